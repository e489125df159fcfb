use chrono::{DateTime, Utc};

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl RepoError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        RepoError::Conflict(msg.into())
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

/// Booking mutation applied together with an appended progress row.
#[derive(Debug, Clone)]
pub struct ProgressWrite {
    pub booking_id: Id,
    pub updated_by: Id,
    pub booking_status: BookingStatus,
    pub message: Option<String>,
    /// Some(ts) stamps completion; None leaves completed_at alone.
    pub completed_at: Option<DateTime<Utc>>,
    /// Some(v) overwrites client_acknowledged (including back to None);
    /// None leaves it alone.
    pub client_acknowledged: Option<Option<bool>>,
}

#[derive(Debug, Clone)]
pub struct PaymentLogWrite {
    pub booking_id: Id,
    pub milestone_id: Id,
    pub logged_by: Id,
    pub amount: f64,
    pub payment_method: String,
    /// Which side the logger is on; their own acknowledgment is set at
    /// creation time.
    pub logger_role: PartyRole,
}

#[derive(Debug, Clone)]
pub struct ChangeRequestWrite {
    pub booking_id: Id,
    pub requested_by: Id,
    pub kind: ChangeRequestKind,
    pub new_price: Option<f64>,
    pub new_start_date: Option<DateTime<Utc>>,
    pub new_deadline: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub status: ChangeRequestStatus,
}

#[derive(Debug, Clone)]
pub struct ReviewWrite {
    pub booking_id: Id,
    pub reviewer_id: Id,
    pub reviewed_id: Id,
    pub service_listing_id: Option<Id>,
    pub service_request_id: Option<Id>,
    pub rating: i32,
    pub comment: String,
}

/// Report resolution writes that must land atomically: the status flip plus
/// the moderation and audit rows. Content removal is per-item best effort
/// and handled separately.
#[derive(Debug, Clone)]
pub struct ReportResolutionWrite {
    pub report_id: Id,
    pub admin_id: Id,
    pub new_status: ReportStatus,
    pub action: String,
    pub metadata: serde_json::Value,
    pub moderation: Option<ModerationWrite>,
}

#[derive(Debug, Clone)]
pub struct ModerationWrite {
    pub user_id: Id,
    pub action: ModerationAction,
    pub reason: String,
    pub end_date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn set_trust_rating(&self, id: Id, rating: f64) -> RepoResult<()>;
    /// One-time counter bump, guarded by `completed_booking_counted` on the
    /// booking. Returns false when the booking was already counted.
    async fn count_completed_booking(&self, booking_id: Id, client_id: Id, resolver_id: Id)
        -> RepoResult<bool>;
}

#[async_trait]
pub trait ListingRepo: Send + Sync {
    async fn create_listing(&self, new: NewServiceListing) -> RepoResult<ServiceListing>;
    async fn get_listing(&self, id: Id) -> RepoResult<ServiceListing>;
    async fn list_listings(&self) -> RepoResult<Vec<ServiceListing>>;
    async fn list_listings_by_user(&self, resolver_id: Id) -> RepoResult<Vec<ServiceListing>>;
    async fn set_listing_status(&self, id: Id, status: ListingStatus) -> RepoResult<()>;
}

#[async_trait]
pub trait RequestRepo: Send + Sync {
    async fn create_request(&self, new: NewServiceRequest) -> RepoResult<ServiceRequest>;
    async fn get_request(&self, id: Id) -> RepoResult<ServiceRequest>;
    async fn list_requests(&self) -> RepoResult<Vec<ServiceRequest>>;
}

#[async_trait]
pub trait ProposalRepo: Send + Sync {
    async fn get_proposal(&self, id: Id) -> RepoResult<BookingProposal>;
    /// Listing flow: create the draft booking, the proposal, and advance the
    /// booking to SERVICE_PROPOSAL_SENT in one atomic unit.
    async fn send_listing_proposal(
        &self,
        new: NewBookingProposal,
    ) -> RepoResult<(BookingProposal, Booking)>;
    /// Request flow: proposal only; a conversation between the parties is
    /// ensured as a side effect.
    async fn send_request_proposal(&self, new: NewBookingProposal) -> RepoResult<BookingProposal>;
    /// Listing flow acceptance: proposal ACCEPTED, attached booking
    /// CONFIRMED with the proposal's terms.
    async fn accept_listing_proposal(&self, proposal_id: Id)
        -> RepoResult<(BookingProposal, Booking)>;
    /// Request flow acceptance: booking created CONFIRMED, resolver assigned
    /// onto the request, conversation linked, and every other PENDING
    /// proposal for the request declined with `others_reason`. Atomic.
    async fn accept_request_proposal(
        &self,
        proposal_id: Id,
        others_reason: &str,
    ) -> RepoResult<(BookingProposal, Booking)>;
    /// Proposal DECLINED; attached booking (if any) DECLINED too.
    async fn decline_proposal(&self, proposal_id: Id, reason: &str) -> RepoResult<BookingProposal>;
    /// Counter ("MODIFIED") or fresh ("DECLINED") renegotiation: mark the
    /// original, create the swapped successor, move an attached booking to
    /// NEGOTIATING pointing at the successor.
    async fn supersede_proposal(
        &self,
        original_id: Id,
        mark_original: ProposalStatus,
        successor: NewBookingProposal,
    ) -> RepoResult<BookingProposal>;
}

#[async_trait]
pub trait BookingRepo: Send + Sync {
    async fn get_booking(&self, id: Id) -> RepoResult<Booking>;
    /// Resolver side of the booking, resolved through its context entity.
    async fn booking_resolver(&self, booking: &Booking) -> RepoResult<Id>;
    /// Status change plus appended progress row, atomically.
    async fn record_progress(&self, write: ProgressWrite) -> RepoResult<(Booking, ProgressUpdate)>;
    async fn list_progress(&self, booking_id: Id) -> RepoResult<Vec<ProgressUpdate>>;
    async fn set_payment_status(&self, booking_id: Id, status: PaymentStatus) -> RepoResult<()>;
    async fn create_change_request(
        &self,
        write: ChangeRequestWrite,
    ) -> RepoResult<BookingChangeRequest>;
    async fn get_change_request(&self, id: Id) -> RepoResult<BookingChangeRequest>;
    /// Apply an approved alteration: changed fields onto the booking, status
    /// forced back to CONFIRMED, price/dates mirrored onto the latest
    /// proposal, change request marked APPROVED. Atomic.
    async fn approve_alteration(&self, change_id: Id)
        -> RepoResult<(BookingChangeRequest, Booking)>;
    async fn decline_change_request(&self, change_id: Id) -> RepoResult<BookingChangeRequest>;
    /// Immediate cancellation: booking CANCELED, audit change-request row,
    /// initiator's per-role cancellation counter. Atomic.
    async fn cancel_booking(
        &self,
        booking_id: Id,
        requested_by: Id,
        initiator_role: PartyRole,
        reason: Option<String>,
        audit_change_id: Option<Id>,
    ) -> RepoResult<Booking>;
}

#[async_trait]
pub trait PaymentRepo: Send + Sync {
    async fn create_payment_plan(
        &self,
        booking_id: Id,
        milestones: Vec<NewPaymentMilestone>,
    ) -> RepoResult<(PaymentPlan, Vec<PaymentMilestone>)>;
    async fn get_payment_plan(
        &self,
        booking_id: Id,
    ) -> RepoResult<Option<(PaymentPlan, Vec<PaymentMilestone>)>>;
    async fn get_milestone(&self, id: Id) -> RepoResult<PaymentMilestone>;
    /// One log per milestone; the logger's own acknowledgment flag is set at
    /// creation, and the legacy flat Payment row is written alongside.
    async fn log_payment(&self, write: PaymentLogWrite) -> RepoResult<PaymentLog>;
    async fn get_payment_log(&self, id: Id) -> RepoResult<PaymentLog>;
    async fn list_payment_logs(&self, booking_id: Id) -> RepoResult<Vec<PaymentLog>>;
    /// Idempotent: re-acknowledging an already-set side is a no-op.
    async fn acknowledge_payment(&self, payment_id: Id, side: PartyRole)
        -> RepoResult<PaymentLog>;
}

#[async_trait]
pub trait ReviewRepo: Send + Sync {
    /// Rejects a duplicate (reviewer, reviewed, context) triple.
    async fn create_review(&self, write: ReviewWrite) -> RepoResult<Review>;
    async fn list_reviews_for_booking(&self, booking_id: Id) -> RepoResult<Vec<Review>>;
    async fn list_reviews_for_user(&self, reviewed_id: Id) -> RepoResult<Vec<Review>>;
    async fn list_reviews_by_author(&self, reviewer_id: Id) -> RepoResult<Vec<Review>>;
    async fn delete_review(&self, id: Id) -> RepoResult<()>;
    /// Flip the booking to REVIEW_COMPLETED.
    async fn complete_reviews(&self, booking_id: Id) -> RepoResult<Booking>;
}

#[async_trait]
pub trait PortfolioRepo: Send + Sync {
    async fn create_portfolio(&self, new: NewPortfolio) -> RepoResult<Portfolio>;
    async fn get_portfolio(&self, id: Id) -> RepoResult<Portfolio>;
    async fn set_portfolio_status(&self, id: Id, status: PortfolioStatus) -> RepoResult<Portfolio>;
    async fn list_portfolios_by_user(&self, user_id: Id) -> RepoResult<Vec<Portfolio>>;
}

#[async_trait]
pub trait ModerationRepo: Send + Sync {
    async fn create_report(&self, reporter_id: Id, new: NewReport) -> RepoResult<Report>;
    async fn get_report(&self, id: Id) -> RepoResult<Report>;
    async fn list_reports(&self) -> RepoResult<Vec<Report>>;
    /// PENDING -> UNDER_REVIEW only.
    async fn mark_report_under_review(&self, id: Id) -> RepoResult<Report>;
    /// Terminal resolution; rejected when the report is already
    /// RESOLVED/DISMISSED. Report + moderation + audit land atomically.
    async fn resolve_report(&self, write: ReportResolutionWrite) -> RepoResult<Report>;
    async fn create_content_flag(
        &self,
        report_id: Id,
        content_kind: &str,
        content_id: Id,
    ) -> RepoResult<ContentFlag>;
    async fn active_suspension(
        &self,
        user_id: Id,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<UserModeration>>;
    async fn list_admin_actions(&self, report_id: Id) -> RepoResult<Vec<AdminAction>>;
}

pub trait Repo:
    UserRepo
    + ListingRepo
    + RequestRepo
    + ProposalRepo
    + BookingRepo
    + PaymentRepo
    + ReviewRepo
    + PortfolioRepo
    + ModerationRepo
{
}

impl<T> Repo for T where
    T: UserRepo
        + ListingRepo
        + RequestRepo
        + ProposalRepo
        + BookingRepo
        + PaymentRepo
        + ReviewRepo
        + PortfolioRepo
        + ModerationRepo
{
}

#[cfg(feature = "inmem-store")]
pub mod inmem;

#[cfg(feature = "postgres-store")]
pub mod pg;
