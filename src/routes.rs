use std::sync::Arc;

use actix_web::{web, HttpResponse};
use chrono::{Duration, Utc};
use metrics::increment_counter;

use crate::auth::{Auth, Role};
use crate::error::ApiError;
use crate::lifecycle::{self, BookingEvent, ReviewPhase, CANCEL_NOTICE_HOURS};
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::{
    ChangeRequestWrite, ModerationWrite, PaymentLogWrite, ProgressWrite, Repo,
    ReportResolutionWrite, ReviewWrite,
};
use crate::trust::{self, TrustScorer};

/// Reason stamped onto proposals auto-declined when a request is assigned.
pub const ASSIGNED_ELSEWHERE: &str = "Request was assigned to another resolver";

const DEFAULT_SUSPENSION_DAYS: i64 = 7;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/auth/login").route(web::post().to(login)))
            .service(web::resource("/users").route(web::post().to(create_user)))
            .service(web::resource("/users/{id}").route(web::get().to(get_user)))
            .service(web::resource("/users/{id}/reviews").route(web::get().to(list_user_reviews)))
            .service(
                web::resource("/listings")
                    .route(web::get().to(list_listings))
                    .route(web::post().to(create_listing)),
            )
            .service(web::resource("/listings/{id}").route(web::get().to(get_listing)))
            .service(
                web::resource("/requests")
                    .route(web::get().to(list_requests))
                    .route(web::post().to(create_request)),
            )
            .service(web::resource("/requests/{id}").route(web::get().to(get_request)))
            .service(web::resource("/proposals").route(web::post().to(send_proposal)))
            .service(
                web::resource("/proposals/{id}/respond").route(web::post().to(respond_proposal)),
            )
            .service(web::resource("/bookings/{id}").route(web::get().to(get_booking)))
            .service(
                web::resource("/bookings/{id}/progress")
                    .route(web::get().to(list_progress))
                    .route(web::post().to(post_progress)),
            )
            .service(web::resource("/bookings/{id}/confirm").route(web::post().to(confirm_booking)))
            .service(
                web::resource("/bookings/{id}/review-status")
                    .route(web::get().to(get_review_status)),
            )
            .service(
                web::resource("/bookings/{id}/reviews")
                    .route(web::get().to(list_booking_reviews))
                    .route(web::post().to(create_review)),
            )
            .service(
                web::resource("/bookings/{id}/payment-plan")
                    .route(web::get().to(get_payment_plan))
                    .route(web::post().to(create_payment_plan)),
            )
            .service(
                web::resource("/bookings/{id}/payments")
                    .route(web::get().to(list_payments))
                    .route(web::post().to(log_payment)),
            )
            .service(
                web::resource("/payments/{id}/acknowledge")
                    .route(web::post().to(acknowledge_payment)),
            )
            .service(web::resource("/bookings/{id}/alter").route(web::post().to(request_alteration)))
            .service(web::resource("/bookings/{id}/cancel").route(web::post().to(cancel_booking)))
            .service(
                web::resource("/change-requests/{id}")
                    .route(web::patch().to(resolve_change_request)),
            )
            .service(web::resource("/portfolios").route(web::post().to(create_portfolio)))
            .service(
                web::resource("/admin/portfolios/{id}/approve")
                    .route(web::post().to(admin_approve_portfolio)),
            )
            .service(
                web::resource("/admin/portfolios/{id}/reject")
                    .route(web::post().to(admin_reject_portfolio)),
            )
            .service(web::resource("/reports").route(web::post().to(create_report)))
            .service(web::resource("/admin/reports").route(web::get().to(admin_list_reports)))
            .service(
                web::resource("/admin/reports/{id}/review")
                    .route(web::post().to(admin_review_report)),
            )
            .service(
                web::resource("/admin/reports/{id}/resolve")
                    .route(web::post().to(admin_resolve_report)),
            ),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub trust: Arc<dyn TrustScorer>,
    pub limiter: RateLimiterFacade,
}

// ---------------- shared guards -----------------------------------

/// Which side of `booking` the acting user is on, or Forbidden.
async fn party_role(
    repo: &dyn Repo,
    booking: &Booking,
    user_id: Id,
) -> Result<PartyRole, ApiError> {
    if booking.client_id == user_id {
        return Ok(PartyRole::Client);
    }
    let resolver_id = repo.booking_resolver(booking).await?;
    if resolver_id == user_id {
        return Ok(PartyRole::Resolver);
    }
    Err(ApiError::forbidden("not a party to this booking"))
}

async fn counterparty(repo: &dyn Repo, booking: &Booking, user_id: Id) -> Result<Id, ApiError> {
    let resolver_id = repo.booking_resolver(booking).await?;
    if booking.client_id == user_id {
        Ok(resolver_id)
    } else if resolver_id == user_id {
        Ok(booking.client_id)
    } else {
        Err(ApiError::forbidden("not a party to this booking"))
    }
}

fn advance(status: BookingStatus, event: BookingEvent) -> Result<BookingStatus, ApiError> {
    lifecycle::next_state(status, event).map_err(|e| ApiError::conflict(e.to_string()))
}

// ---------------- auth --------------------------------------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct LoginRequest {
    pub user_id: Id,
    #[serde(default)]
    pub admin: bool,
}

/// Admin tokens are only minted for user ids listed in `ADMIN_USERS`
/// (comma-separated).
fn admin_allowlisted(user_id: Id) -> bool {
    std::env::var("ADMIN_USERS")
        .map(|v| {
            v.split(',')
                .filter_map(|s| s.trim().parse::<Id>().ok())
                .any(|id| id == user_id)
        })
        .unwrap_or(false)
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued", body = LoginResponse),
        (status = 403, description = "Account suspended, or admin requested without being allowlisted"),
        (status = 404, description = "Unknown user")
    )
)]
pub async fn login(
    data: web::Data<AppState>,
    payload: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(payload.user_id).await?;
    if let Some(susp) = data.repo.active_suspension(user.id, Utc::now()).await? {
        return Err(ApiError::forbidden(format!(
            "account suspended until {}",
            susp.end_date.map(|d| d.to_rfc3339()).unwrap_or_default()
        )));
    }
    let mut roles = vec![Role::User];
    if payload.admin {
        if !admin_allowlisted(user.id) {
            return Err(ApiError::forbidden("admin login not permitted"));
        }
        roles.push(Role::Admin);
    }
    let token = crate::auth::create_jwt(user.id, roles).map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(LoginResponse { token, user }))
}

// ---------------- users -------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/users",
    request_body = NewUser,
    responses((status = 201, description = "User created", body = User))
)]
pub async fn create_user(
    data: web::Data<AppState>,
    payload: web::Json<NewUser>,
) -> Result<HttpResponse, ApiError> {
    if payload.username.trim().is_empty() {
        return Err(ApiError::validation("username must not be empty"));
    }
    let user = data.repo.create_user(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(user))
}

pub async fn get_user(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn list_user_reviews(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let reviews = data.repo.list_reviews_for_user(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(reviews))
}

// ---------------- listings / requests -----------------------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct CreateListing {
    pub title: String,
    pub description: String,
    pub price: f64,
}

#[utoipa::path(
    post,
    path = "/api/v1/listings",
    request_body = CreateListing,
    responses(
        (status = 201, description = "Listing created", body = ServiceListing),
        (status = 400, description = "Invalid fields")
    )
)]
pub async fn create_listing(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreateListing>,
) -> Result<HttpResponse, ApiError> {
    if payload.title.trim().is_empty() || payload.description.trim().is_empty() {
        return Err(ApiError::validation("title and description are required"));
    }
    if payload.price <= 0.0 {
        return Err(ApiError::validation("price must be positive"));
    }
    let listing = data
        .repo
        .create_listing(NewServiceListing {
            resolver_id: auth.0.user_id()?,
            title: payload.title.clone(),
            description: payload.description.clone(),
            price: payload.price,
        })
        .await?;
    Ok(HttpResponse::Created().json(listing))
}

pub async fn list_listings(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.list_listings().await?))
}

pub async fn get_listing(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.get_listing(path.into_inner()).await?))
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct CreateRequest {
    pub title: String,
    pub description: String,
    pub budget: f64,
}

pub async fn create_request(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreateRequest>,
) -> Result<HttpResponse, ApiError> {
    if payload.title.trim().is_empty() || payload.description.trim().is_empty() {
        return Err(ApiError::validation("title and description are required"));
    }
    if payload.budget <= 0.0 {
        return Err(ApiError::validation("budget must be positive"));
    }
    let request = data
        .repo
        .create_request(NewServiceRequest {
            client_id: auth.0.user_id()?,
            title: payload.title.clone(),
            description: payload.description.clone(),
            budget: payload.budget,
        })
        .await?;
    Ok(HttpResponse::Created().json(request))
}

pub async fn list_requests(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.list_requests().await?))
}

pub async fn get_request(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.get_request(path.into_inner()).await?))
}

// ---------------- proposals ---------------------------------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct SendProposal {
    pub receiver_id: Id,
    pub service_listing_id: Option<Id>,
    pub service_request_id: Option<Id>,
    pub description: String,
    pub price: f64,
    pub start_date: chrono::DateTime<Utc>,
    pub deadline: Option<chrono::DateTime<Utc>>,
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct ProposalResponse {
    pub proposal: BookingProposal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking: Option<Booking>,
}

#[utoipa::path(
    post,
    path = "/api/v1/proposals",
    request_body = SendProposal,
    responses(
        (status = 201, description = "Proposal sent", body = ProposalResponse),
        (status = 400, description = "Invalid fields or ambiguous context"),
        (status = 404, description = "Context not found"),
        (status = 409, description = "Wrong counterpart or duplicate pending proposal"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn send_proposal(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<SendProposal>,
) -> Result<HttpResponse, ApiError> {
    let sender_id = auth.0.user_id()?;
    if !data.limiter.allow_proposal(&auth.0.sub) {
        return Ok(HttpResponse::TooManyRequests()
            .json(serde_json::json!({"message": "too many proposals, slow down"})));
    }
    if payload.description.trim().is_empty() {
        return Err(ApiError::validation("description must not be empty"));
    }
    if payload.price <= 0.0 {
        return Err(ApiError::validation("price must be positive"));
    }
    let new = NewBookingProposal {
        sender_id,
        receiver_id: payload.receiver_id,
        service_listing_id: payload.service_listing_id,
        service_request_id: payload.service_request_id,
        description: payload.description.clone(),
        price: payload.price,
        start_date: payload.start_date,
        deadline: payload.deadline,
    };
    match (payload.service_listing_id, payload.service_request_id) {
        (Some(listing_id), None) => {
            let listing = data.repo.get_listing(listing_id).await?;
            if listing.resolver_id != payload.receiver_id {
                return Err(ApiError::conflict(
                    "receiver is not the provider of this listing",
                ));
            }
            let (proposal, booking) = data.repo.send_listing_proposal(new).await?;
            Ok(HttpResponse::Created().json(ProposalResponse {
                proposal,
                booking: Some(booking),
            }))
        }
        (None, Some(request_id)) => {
            let request = data.repo.get_request(request_id).await?;
            if request.client_id != payload.receiver_id {
                return Err(ApiError::conflict(
                    "receiver is not the owner of this request",
                ));
            }
            let proposal = data.repo.send_request_proposal(new).await?;
            Ok(HttpResponse::Created().json(ProposalResponse {
                proposal,
                booking: None,
            }))
        }
        _ => Err(ApiError::validation(
            "exactly one of service_listing_id or service_request_id is required",
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RespondAction {
    Accept,
    Decline,
    Counter,
    New,
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct RespondProposal {
    pub action: RespondAction,
    pub decline_reason: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub start_date: Option<chrono::DateTime<Utc>>,
    pub deadline: Option<chrono::DateTime<Utc>>,
}

#[utoipa::path(
    post,
    path = "/api/v1/proposals/{id}/respond",
    request_body = RespondProposal,
    params(("id" = Id, Path, description = "Proposal id")),
    responses(
        (status = 200, description = "Proposal resolved", body = ProposalResponse),
        (status = 400, description = "Missing required fields for the action"),
        (status = 403, description = "Only the receiver may respond"),
        (status = 409, description = "Proposal no longer pending")
    )
)]
pub async fn respond_proposal(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<RespondProposal>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let proposal = data.repo.get_proposal(path.into_inner()).await?;
    if proposal.receiver_id != user_id {
        return Err(ApiError::forbidden("only the receiver may respond"));
    }
    if proposal.status != ProposalStatus::Pending {
        return Err(ApiError::conflict("proposal is no longer pending"));
    }
    match payload.action {
        RespondAction::Accept => {
            if let Some(booking_id) = proposal.booking_id {
                let booking = data.repo.get_booking(booking_id).await?;
                advance(booking.status, BookingEvent::ProposalAccepted)?;
                let (proposal, booking) = data.repo.accept_listing_proposal(proposal.id).await?;
                Ok(HttpResponse::Ok().json(ProposalResponse {
                    proposal,
                    booking: Some(booking),
                }))
            } else {
                let (proposal, booking) = data
                    .repo
                    .accept_request_proposal(proposal.id, ASSIGNED_ELSEWHERE)
                    .await?;
                Ok(HttpResponse::Ok().json(ProposalResponse {
                    proposal,
                    booking: Some(booking),
                }))
            }
        }
        RespondAction::Decline => {
            let reason = payload
                .decline_reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or_else(|| ApiError::validation("decline_reason is required"))?;
            if let Some(booking_id) = proposal.booking_id {
                let booking = data.repo.get_booking(booking_id).await?;
                advance(booking.status, BookingEvent::ProposalDeclined)?;
            }
            let proposal = data.repo.decline_proposal(proposal.id, reason).await?;
            Ok(HttpResponse::Ok().json(ProposalResponse {
                proposal,
                booking: None,
            }))
        }
        RespondAction::Counter | RespondAction::New => {
            let description = payload
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .ok_or_else(|| ApiError::validation("description is required"))?;
            let price = payload
                .price
                .filter(|p| *p > 0.0)
                .ok_or_else(|| ApiError::validation("price must be positive"))?;
            if let Some(booking_id) = proposal.booking_id {
                let booking = data.repo.get_booking(booking_id).await?;
                advance(booking.status, BookingEvent::Countered)?;
            }
            let mark = if payload.action == RespondAction::Counter {
                ProposalStatus::Modified
            } else {
                ProposalStatus::Declined
            };
            // Sender and receiver swap; unspecified terms carry forward.
            let successor = NewBookingProposal {
                sender_id: proposal.receiver_id,
                receiver_id: proposal.sender_id,
                service_listing_id: proposal.service_listing_id,
                service_request_id: proposal.service_request_id,
                description: description.to_string(),
                price,
                start_date: payload.start_date.unwrap_or(proposal.start_date),
                deadline: payload.deadline.or(proposal.deadline),
            };
            let fresh = data
                .repo
                .supersede_proposal(proposal.id, mark, successor)
                .await?;
            Ok(HttpResponse::Ok().json(ProposalResponse {
                proposal: fresh,
                booking: None,
            }))
        }
    }
}

// ---------------- bookings ----------------------------------------

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub kind: BookingKind,
    pub current_step_index: Option<usize>,
    pub needs_update: bool,
    pub review_phase: ReviewPhase,
}

async fn booking_view(repo: &dyn Repo, booking: Booking) -> Result<BookingView, ApiError> {
    let updates = repo.list_progress(booking.id).await?;
    let last_activity = updates
        .last()
        .map(|u| u.created_at)
        .unwrap_or(booking.created_at);
    let now = Utc::now();
    Ok(BookingView {
        kind: booking.kind(),
        current_step_index: lifecycle::current_step_index(
            booking.status,
            booking.client_acknowledged,
        ),
        needs_update: lifecycle::needs_update(
            booking.status,
            booking.client_acknowledged,
            last_activity,
            booking.payment_due,
            now,
        ),
        review_phase: lifecycle::review_phase(booking.status, booking.completed_at, now),
        booking,
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/bookings/{id}",
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 200, description = "Booking with derived view", body = BookingView),
        (status = 404, description = "Booking not found")
    )
)]
pub async fn get_booking(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let booking = data.repo.get_booking(path.into_inner()).await?;
    let view = booking_view(data.repo.as_ref(), booking).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn list_progress(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.list_progress(path.into_inner()).await?))
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct PostProgress {
    pub status: BookingStatus,
    pub message: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/progress",
    request_body = PostProgress,
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 200, description = "Progress recorded", body = BookingView),
        (status = 400, description = "Status must be IN_PROGRESS or COMPLETED"),
        (status = 403, description = "Resolver only"),
        (status = 409, description = "Illegal transition")
    )
)]
pub async fn post_progress(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<PostProgress>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let booking = data.repo.get_booking(path.into_inner()).await?;
    let role = party_role(data.repo.as_ref(), &booking, user_id).await?;
    if role != PartyRole::Resolver {
        return Err(ApiError::forbidden("only the resolver may post progress"));
    }
    let (event, completed_at, ack) = match payload.status {
        BookingStatus::InProgress => {
            // A fresh update clears a previous revision request.
            let ack = if booking.client_acknowledged == Some(false) {
                Some(None)
            } else {
                None
            };
            (BookingEvent::ProgressInProgress, None, ack)
        }
        BookingStatus::Completed => (
            BookingEvent::ProgressCompleted,
            Some(Utc::now()),
            Some(None),
        ),
        _ => {
            return Err(ApiError::validation(
                "status must be IN_PROGRESS or COMPLETED",
            ))
        }
    };
    let next = advance(booking.status, event)?;
    let (booking, _update) = data
        .repo
        .record_progress(ProgressWrite {
            booking_id: booking.id,
            updated_by: user_id,
            booking_status: next,
            message: payload.message.clone(),
            completed_at,
            client_acknowledged: ack,
        })
        .await?;
    let view = booking_view(data.repo.as_ref(), booking).await?;
    Ok(HttpResponse::Ok().json(view))
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct ConfirmBooking {
    pub accepted: bool,
    pub message: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/confirm",
    request_body = ConfirmBooking,
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 200, description = "Decision recorded", body = BookingView),
        (status = 403, description = "Client only"),
        (status = 409, description = "Not completed, or payments not fully acknowledged")
    )
)]
pub async fn confirm_booking(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<ConfirmBooking>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let booking = data.repo.get_booking(path.into_inner()).await?;
    if booking.client_id != user_id {
        return Err(ApiError::forbidden("only the client may confirm delivery"));
    }
    let write = if payload.accepted {
        let next = advance(booking.status, BookingEvent::ClientConfirmed)?;
        let logs = data.repo.list_payment_logs(booking.id).await?;
        if logs.iter().any(|l| !l.fully_acknowledged()) {
            return Err(ApiError::conflict("Payments not fully acknowledged"));
        }
        ProgressWrite {
            booking_id: booking.id,
            updated_by: user_id,
            booking_status: next,
            message: payload.message.clone(),
            completed_at: None,
            client_acknowledged: Some(Some(true)),
        }
    } else {
        let next = advance(booking.status, BookingEvent::RevisionRequested)?;
        ProgressWrite {
            booking_id: booking.id,
            updated_by: user_id,
            booking_status: next,
            message: payload
                .message
                .clone()
                .or_else(|| Some("Revision requested".to_string())),
            completed_at: None,
            client_acknowledged: Some(Some(false)),
        }
    };
    let (booking, _) = data.repo.record_progress(write).await?;
    let view = booking_view(data.repo.as_ref(), booking).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn get_review_status(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let booking = data.repo.get_booking(path.into_inner()).await?;
    let phase = lifecycle::review_phase(booking.status, booking.completed_at, Utc::now());
    Ok(HttpResponse::Ok().json(serde_json::json!({ "review_phase": phase })))
}

// ---------------- reviews -----------------------------------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct CreateReview {
    pub rating: i32,
    pub comment: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/reviews",
    request_body = CreateReview,
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 201, description = "Review recorded", body = Review),
        (status = 400, description = "Rating out of range"),
        (status = 403, description = "Parties only"),
        (status = 409, description = "Not in review phase, or duplicate review")
    )
)]
pub async fn create_review(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<CreateReview>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    if !(1..=5).contains(&payload.rating) {
        return Err(ApiError::validation("rating must be between 1 and 5"));
    }
    let booking = data.repo.get_booking(path.into_inner()).await?;
    let reviewed_id = counterparty(data.repo.as_ref(), &booking, user_id).await?;
    if booking.status != BookingStatus::AwaitingReview
        || booking.client_acknowledged != Some(true)
    {
        return Err(ApiError::conflict("booking is not awaiting reviews"));
    }
    let review = data
        .repo
        .create_review(ReviewWrite {
            booking_id: booking.id,
            reviewer_id: user_id,
            reviewed_id,
            service_listing_id: booking.service_listing_id,
            service_request_id: booking.service_request_id,
            rating: payload.rating,
            comment: payload.comment.clone(),
        })
        .await?;

    let all = data.repo.list_reviews_for_booking(booking.id).await?;
    let both_reviewed = all.iter().any(|r| r.reviewer_id != user_id);
    if both_reviewed {
        advance(booking.status, BookingEvent::BothPartiesReviewed)?;
        let booking = data.repo.complete_reviews(booking.id).await?;
        let resolver_id = data.repo.booking_resolver(&booking).await?;
        let counted = data
            .repo
            .count_completed_booking(booking.id, booking.client_id, resolver_id)
            .await?;
        if counted {
            increment_counter!("peerserve_bookings_completed_total");
        }
    }
    trust::recalculate(data.repo.as_ref(), data.trust.as_ref(), reviewed_id, None).await;
    Ok(HttpResponse::Created().json(review))
}

pub async fn list_booking_reviews(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.list_reviews_for_booking(path.into_inner()).await?))
}

// ---------------- payments ----------------------------------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct CreatePaymentPlan {
    pub milestones: Vec<NewPaymentMilestone>,
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct PaymentPlanResponse {
    pub plan: PaymentPlan,
    pub milestones: Vec<PaymentMilestone>,
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/payment-plan",
    request_body = CreatePaymentPlan,
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 201, description = "Plan created", body = PaymentPlanResponse),
        (status = 400, description = "No milestones"),
        (status = 403, description = "Parties only"),
        (status = 409, description = "Plan already exists")
    )
)]
pub async fn create_payment_plan(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<CreatePaymentPlan>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let booking = data.repo.get_booking(path.into_inner()).await?;
    party_role(data.repo.as_ref(), &booking, user_id).await?;
    if payload.milestones.is_empty() {
        return Err(ApiError::validation("at least one milestone is required"));
    }
    if payload.milestones.iter().any(|m| m.amount <= 0.0) {
        return Err(ApiError::validation("milestone amounts must be positive"));
    }
    let (plan, milestones) = data
        .repo
        .create_payment_plan(booking.id, payload.into_inner().milestones)
        .await?;
    Ok(HttpResponse::Created().json(PaymentPlanResponse { plan, milestones }))
}

pub async fn get_payment_plan(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    match data.repo.get_payment_plan(path.into_inner()).await? {
        Some((plan, milestones)) => {
            Ok(HttpResponse::Ok().json(PaymentPlanResponse { plan, milestones }))
        }
        None => Err(ApiError::NotFound),
    }
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct LogPayment {
    pub milestone_id: Id,
    pub amount: f64,
    pub payment_method: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/payments",
    request_body = LogPayment,
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 201, description = "Payment logged", body = PaymentLog),
        (status = 400, description = "Invalid amount or milestone"),
        (status = 403, description = "Parties only"),
        (status = 409, description = "Milestone already has a log")
    )
)]
pub async fn log_payment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<LogPayment>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let booking = data.repo.get_booking(path.into_inner()).await?;
    let role = party_role(data.repo.as_ref(), &booking, user_id).await?;
    if payload.amount <= 0.0 {
        return Err(ApiError::validation("amount must be positive"));
    }
    let milestone = data.repo.get_milestone(payload.milestone_id).await?;
    let plan = data
        .repo
        .get_payment_plan(booking.id)
        .await?
        .ok_or_else(|| ApiError::validation("booking has no payment plan"))?;
    if milestone.plan_id != plan.0.id {
        return Err(ApiError::validation(
            "milestone does not belong to this booking",
        ));
    }
    let log = data
        .repo
        .log_payment(PaymentLogWrite {
            booking_id: booking.id,
            milestone_id: milestone.id,
            logged_by: user_id,
            amount: payload.amount,
            payment_method: payload.payment_method.clone(),
            logger_role: role,
        })
        .await?;
    Ok(HttpResponse::Created().json(log))
}

pub async fn list_payments(
    _auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.list_payment_logs(path.into_inner()).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/{id}/acknowledge",
    params(("id" = Id, Path, description = "Payment log id")),
    responses(
        (status = 200, description = "Acknowledgment recorded", body = PaymentLog),
        (status = 403, description = "Parties only"),
        (status = 404, description = "Payment log not found")
    )
)]
pub async fn acknowledge_payment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let log = data.repo.get_payment_log(path.into_inner()).await?;
    let booking = data.repo.get_booking(log.booking_id).await?;
    let role = party_role(data.repo.as_ref(), &booking, user_id).await?;
    let log = data.repo.acknowledge_payment(log.id, role).await?;
    if log.fully_acknowledged() {
        let logs = data.repo.list_payment_logs(booking.id).await?;
        let status = lifecycle::recompute_payment_status(&logs, booking.total_price);
        data.repo.set_payment_status(booking.id, status).await?;
    }
    Ok(HttpResponse::Ok().json(log))
}

// ---------------- change requests ---------------------------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct RequestAlteration {
    pub new_price: Option<f64>,
    pub new_start_date: Option<chrono::DateTime<Utc>>,
    pub new_deadline: Option<chrono::DateTime<Utc>>,
    pub reason: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/alter",
    request_body = RequestAlteration,
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 201, description = "Alteration requested", body = BookingChangeRequest),
        (status = 400, description = "No changed fields"),
        (status = 403, description = "Parties only"),
        (status = 409, description = "Booking not CONFIRMED, or alteration already pending")
    )
)]
pub async fn request_alteration(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<RequestAlteration>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let booking = data.repo.get_booking(path.into_inner()).await?;
    party_role(data.repo.as_ref(), &booking, user_id).await?;
    if booking.status != BookingStatus::Confirmed {
        return Err(ApiError::conflict("only a confirmed booking can be altered"));
    }
    if payload.new_price.is_none()
        && payload.new_start_date.is_none()
        && payload.new_deadline.is_none()
    {
        return Err(ApiError::validation("at least one change is required"));
    }
    if let Some(p) = payload.new_price {
        if p <= 0.0 {
            return Err(ApiError::validation("new_price must be positive"));
        }
    }
    let change = data
        .repo
        .create_change_request(ChangeRequestWrite {
            booking_id: booking.id,
            requested_by: user_id,
            kind: ChangeRequestKind::Alteration,
            new_price: payload.new_price,
            new_start_date: payload.new_start_date,
            new_deadline: payload.new_deadline,
            reason: payload.reason.clone(),
            status: ChangeRequestStatus::Pending,
        })
        .await?;
    Ok(HttpResponse::Created().json(change))
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct CancelBooking {
    pub reason: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/bookings/{id}/cancel",
    request_body = CancelBooking,
    params(("id" = Id, Path, description = "Booking id")),
    responses(
        (status = 200, description = "Booking canceled", body = Booking),
        (status = 202, description = "Cancellation pending counterparty approval", body = BookingChangeRequest),
        (status = 403, description = "Parties only"),
        (status = 409, description = "Booking cannot be canceled")
    )
)]
pub async fn cancel_booking(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<CancelBooking>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let booking = data.repo.get_booking(path.into_inner()).await?;
    let role = party_role(data.repo.as_ref(), &booking, user_id).await?;
    advance(booking.status, BookingEvent::Canceled)?;

    let now = Utc::now();
    if booking.start_date - now >= Duration::hours(CANCEL_NOTICE_HOURS) {
        let resolver_id = data.repo.booking_resolver(&booking).await?;
        let booking = data
            .repo
            .cancel_booking(booking.id, user_id, role, payload.reason.clone(), None)
            .await?;
        increment_counter!("peerserve_bookings_canceled_total");
        trust::recalculate(data.repo.as_ref(), data.trust.as_ref(), user_id, Some(role)).await;
        let other = if user_id == booking.client_id {
            resolver_id
        } else {
            booking.client_id
        };
        trust::recalculate(data.repo.as_ref(), data.trust.as_ref(), other, None).await;
        Ok(HttpResponse::Ok().json(booking))
    } else {
        // Inside the notice window the counterparty has to agree.
        let change = data
            .repo
            .create_change_request(ChangeRequestWrite {
                booking_id: booking.id,
                requested_by: user_id,
                kind: ChangeRequestKind::Cancellation,
                new_price: None,
                new_start_date: None,
                new_deadline: None,
                reason: payload.reason.clone(),
                status: ChangeRequestStatus::Pending,
            })
            .await?;
        Ok(HttpResponse::Accepted().json(change))
    }
}

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct ResolveChangeRequest {
    pub approve: bool,
}

#[utoipa::path(
    patch,
    path = "/api/v1/change-requests/{id}",
    request_body = ResolveChangeRequest,
    params(("id" = Id, Path, description = "Change request id")),
    responses(
        (status = 200, description = "Change request resolved"),
        (status = 403, description = "Counterparty only"),
        (status = 409, description = "Already resolved, or illegal transition")
    )
)]
pub async fn resolve_change_request(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<ResolveChangeRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id()?;
    let change = data.repo.get_change_request(path.into_inner()).await?;
    let booking = data.repo.get_booking(change.booking_id).await?;
    party_role(data.repo.as_ref(), &booking, user_id).await?;
    if change.requested_by == user_id {
        return Err(ApiError::forbidden(
            "only the counterparty may resolve a change request",
        ));
    }
    if change.status != ChangeRequestStatus::Pending {
        return Err(ApiError::conflict("change request already resolved"));
    }
    if !payload.approve {
        let change = data.repo.decline_change_request(change.id).await?;
        return Ok(HttpResponse::Ok().json(change));
    }
    match change.kind {
        ChangeRequestKind::Alteration => {
            advance(booking.status, BookingEvent::AlterationApproved)?;
            let (change, booking) = data.repo.approve_alteration(change.id).await?;
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "change_request": change,
                "booking": booking,
            })))
        }
        ChangeRequestKind::Cancellation => {
            advance(booking.status, BookingEvent::Canceled)?;
            let initiator = change.requested_by;
            let initiator_role = party_role(data.repo.as_ref(), &booking, initiator).await?;
            let resolver_id = data.repo.booking_resolver(&booking).await?;
            let booking = data
                .repo
                .cancel_booking(
                    booking.id,
                    initiator,
                    initiator_role,
                    change.reason.clone(),
                    Some(change.id),
                )
                .await?;
            increment_counter!("peerserve_bookings_canceled_total");
            trust::recalculate(
                data.repo.as_ref(),
                data.trust.as_ref(),
                initiator,
                Some(initiator_role),
            )
            .await;
            let other = if initiator == booking.client_id {
                resolver_id
            } else {
                booking.client_id
            };
            trust::recalculate(data.repo.as_ref(), data.trust.as_ref(), other, None).await;
            Ok(HttpResponse::Ok().json(booking))
        }
    }
}

// ---------------- portfolios --------------------------------------

#[derive(serde::Deserialize, utoipa::ToSchema)]
pub struct CreatePortfolio {
    pub title: String,
}

pub async fn create_portfolio(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<CreatePortfolio>,
) -> Result<HttpResponse, ApiError> {
    if payload.title.trim().is_empty() {
        return Err(ApiError::validation("title must not be empty"));
    }
    let portfolio = data
        .repo
        .create_portfolio(NewPortfolio {
            user_id: auth.0.user_id()?,
            title: payload.title.clone(),
        })
        .await?;
    Ok(HttpResponse::Created().json(portfolio))
}

pub async fn admin_approve_portfolio(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    if !auth.0.is_admin() {
        return Err(ApiError::forbidden("admin only"));
    }
    let portfolio = data
        .repo
        .set_portfolio_status(path.into_inner(), PortfolioStatus::Approved)
        .await?;
    trust::recalculate(
        data.repo.as_ref(),
        data.trust.as_ref(),
        portfolio.user_id,
        None,
    )
    .await;
    Ok(HttpResponse::Ok().json(portfolio))
}

pub async fn admin_reject_portfolio(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    if !auth.0.is_admin() {
        return Err(ApiError::forbidden("admin only"));
    }
    let portfolio = data
        .repo
        .set_portfolio_status(path.into_inner(), PortfolioStatus::Rejected)
        .await?;
    Ok(HttpResponse::Ok().json(portfolio))
}

// ---------------- moderation --------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/reports",
    request_body = NewReport,
    responses(
        (status = 201, description = "Report filed", body = Report),
        (status = 404, description = "Reported user not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_report(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewReport>,
) -> Result<HttpResponse, ApiError> {
    let reporter_id = auth.0.user_id()?;
    if !data.limiter.allow_report(&auth.0.sub) {
        return Ok(HttpResponse::TooManyRequests()
            .json(serde_json::json!({"message": "too many reports, slow down"})));
    }
    if payload.reason.trim().is_empty() {
        return Err(ApiError::validation("reason must not be empty"));
    }
    data.repo.get_user(payload.reported_user_id).await?;
    let report = data
        .repo
        .create_report(reporter_id, payload.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(report))
}

pub async fn admin_list_reports(
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    if !auth.0.is_admin() {
        return Err(ApiError::forbidden("admin only"));
    }
    Ok(HttpResponse::Ok().json(data.repo.list_reports().await?))
}

pub async fn admin_review_report(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    if !auth.0.is_admin() {
        return Err(ApiError::forbidden("admin only"));
    }
    let report = data.repo.mark_report_under_review(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolveReport {
    Warning { reason: String },
    SuspendUser { duration_days: Option<i64>, reason: String },
    DeleteContent,
    Dismiss,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/reports/{id}/resolve",
    request_body = ResolveReport,
    params(("id" = Id, Path, description = "Report id")),
    responses(
        (status = 200, description = "Report resolved", body = Report),
        (status = 403, description = "Admin only"),
        (status = 409, description = "Report already resolved")
    )
)]
pub async fn admin_resolve_report(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<ResolveReport>,
) -> Result<HttpResponse, ApiError> {
    if !auth.0.is_admin() {
        return Err(ApiError::forbidden("admin only"));
    }
    let admin_id = auth.0.user_id()?;
    let report = data.repo.get_report(path.into_inner()).await?;
    if matches!(
        report.status,
        ReportStatus::Resolved | ReportStatus::Dismissed
    ) {
        return Err(ApiError::conflict("report already resolved"));
    }

    let write = match payload.into_inner() {
        ResolveReport::Warning { reason } => ReportResolutionWrite {
            report_id: report.id,
            admin_id,
            new_status: ReportStatus::Resolved,
            action: "WARNING".into(),
            metadata: serde_json::json!({ "reason": reason }),
            moderation: Some(ModerationWrite {
                user_id: report.reported_user_id,
                action: ModerationAction::Warning,
                reason,
                end_date: None,
            }),
        },
        ResolveReport::SuspendUser {
            duration_days,
            reason,
        } => {
            let days = duration_days.unwrap_or(DEFAULT_SUSPENSION_DAYS);
            if days <= 0 {
                return Err(ApiError::validation("duration_days must be positive"));
            }
            let end = Utc::now() + Duration::days(days);
            ReportResolutionWrite {
                report_id: report.id,
                admin_id,
                new_status: ReportStatus::Resolved,
                action: "SUSPEND_USER".into(),
                metadata: serde_json::json!({ "reason": reason, "days": days }),
                moderation: Some(ModerationWrite {
                    user_id: report.reported_user_id,
                    action: ModerationAction::TemporarySuspension,
                    reason,
                    end_date: Some(end),
                }),
            }
        }
        ResolveReport::DeleteContent => {
            let removal = remove_reported_content(data.repo.as_ref(), &report).await;
            ReportResolutionWrite {
                report_id: report.id,
                admin_id,
                new_status: ReportStatus::Resolved,
                action: "DELETE_CONTENT".into(),
                metadata: removal,
                moderation: None,
            }
        }
        ResolveReport::Dismiss => ReportResolutionWrite {
            report_id: report.id,
            admin_id,
            new_status: ReportStatus::Dismissed,
            action: "DISMISS".into(),
            metadata: serde_json::json!({}),
            moderation: None,
        },
    };
    let report = data.repo.resolve_report(write).await?;
    increment_counter!("peerserve_reports_resolved_total");
    Ok(HttpResponse::Ok().json(report))
}

/// Soft-remove the reported user's content. Per-item failures are collected
/// into the audit metadata instead of aborting the batch.
async fn remove_reported_content(repo: &dyn Repo, report: &Report) -> serde_json::Value {
    let user_id = report.reported_user_id;
    let mut removed: Vec<serde_json::Value> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    match repo.list_listings_by_user(user_id).await {
        Ok(listings) => {
            for l in listings.iter().filter(|l| l.status == ListingStatus::Active) {
                match repo.set_listing_status(l.id, ListingStatus::Removed).await {
                    Ok(()) => {
                        let _ = repo.create_content_flag(report.id, "LISTING", l.id).await;
                        removed.push(serde_json::json!({"kind": "LISTING", "id": l.id}));
                    }
                    Err(e) => errors.push(format!("listing {}: {e}", l.id)),
                }
            }
        }
        Err(e) => errors.push(format!("listings: {e}")),
    }

    match repo.list_portfolios_by_user(user_id).await {
        Ok(portfolios) => {
            for p in portfolios
                .iter()
                .filter(|p| p.status != PortfolioStatus::Rejected)
            {
                match repo.set_portfolio_status(p.id, PortfolioStatus::Rejected).await {
                    Ok(_) => {
                        let _ = repo.create_content_flag(report.id, "PORTFOLIO", p.id).await;
                        removed.push(serde_json::json!({"kind": "PORTFOLIO", "id": p.id}));
                    }
                    Err(e) => errors.push(format!("portfolio {}: {e}", p.id)),
                }
            }
        }
        Err(e) => errors.push(format!("portfolios: {e}")),
    }

    match repo.list_reviews_by_author(user_id).await {
        Ok(reviews) => {
            for r in &reviews {
                match repo.delete_review(r.id).await {
                    Ok(()) => {
                        let _ = repo.create_content_flag(report.id, "REVIEW", r.id).await;
                        removed.push(serde_json::json!({"kind": "REVIEW", "id": r.id}));
                    }
                    Err(e) => errors.push(format!("review {}: {e}", r.id)),
                }
            }
        }
        Err(e) => errors.push(format!("reviews: {e}")),
    }

    serde_json::json!({ "removed": removed, "errors": errors })
}
