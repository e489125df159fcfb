use crate::lifecycle::ReviewPhase;
use crate::models::{
    Booking, BookingChangeRequest, BookingKind, BookingProposal, BookingStatus, NewReport,
    NewUser, PaymentLog, PaymentMilestone, PaymentPlan, Report, Review, ServiceListing,
    ServiceRequest, User,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::login,
        crate::routes::create_user,
        crate::routes::create_listing,
        crate::routes::send_proposal,
        crate::routes::respond_proposal,
        crate::routes::get_booking,
        crate::routes::post_progress,
        crate::routes::confirm_booking,
        crate::routes::create_review,
        crate::routes::create_payment_plan,
        crate::routes::log_payment,
        crate::routes::acknowledge_payment,
        crate::routes::request_alteration,
        crate::routes::cancel_booking,
        crate::routes::resolve_change_request,
        crate::routes::create_report,
        crate::routes::admin_resolve_report,
    ),
    components(schemas(
        User, NewUser, ServiceListing, ServiceRequest, Booking, BookingStatus, BookingKind,
        BookingProposal, PaymentPlan, PaymentMilestone, PaymentLog, BookingChangeRequest,
        Review, Report, NewReport, ReviewPhase,
        crate::routes::LoginRequest, crate::routes::LoginResponse,
        crate::routes::CreateListing, crate::routes::SendProposal,
        crate::routes::ProposalResponse, crate::routes::RespondProposal,
        crate::routes::RespondAction, crate::routes::BookingView,
        crate::routes::PostProgress, crate::routes::ConfirmBooking,
        crate::routes::CreateReview, crate::routes::CreatePaymentPlan,
        crate::routes::PaymentPlanResponse, crate::routes::LogPayment,
        crate::routes::RequestAlteration, crate::routes::CancelBooking,
        crate::routes::ResolveChangeRequest, crate::routes::ResolveReport
    )),
    tags(
        (name = "proposals", description = "Proposal negotiation"),
        (name = "bookings", description = "Booking lifecycle, payments and change requests"),
        (name = "moderation", description = "Reports and admin moderation"),
    )
)]
pub struct ApiDoc;
