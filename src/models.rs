use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// Always i64 keys, Postgres bigserial compatible
pub type Id = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum BookingStatus {
    ServiceRequested,
    ServiceProposalSent,
    Negotiating,
    Confirmed,
    InProgress,
    Completed,
    AwaitingReview,
    ReviewCompleted,
    Canceled,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Declined,
    Modified,
}

/// Which side of a booking a user is acting from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyRole {
    Client,
    Resolver,
}

/// Which side of the marketplace a booking originated from. Derived once
/// from the non-null context key and immutable for the booking's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingKind {
    ServiceListing,
    ServiceRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ChangeRequestKind {
    Alteration,
    Cancellation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ChangeRequestStatus {
    Pending,
    Approved,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ListingStatus {
    Active,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum RequestStatus {
    Open,
    Assigned,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum PortfolioStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ReportStatus {
    Pending,
    UnderReview,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ModerationAction {
    Warning,
    TemporarySuspension,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct User {
    pub id: Id,
    pub username: String,
    pub bio: String,
    /// 1.0–5.0, recomputed by the external scoring service.
    pub trust_rating: f64,
    pub completed_bookings: i64,
    pub client_cancellations: i64,
    pub resolver_cancellations: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewUser {
    pub username: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct ServiceListing {
    pub id: Id,
    pub resolver_id: Id,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewServiceListing {
    pub resolver_id: Id,
    pub title: String,
    pub description: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct ServiceRequest {
    pub id: Id,
    pub client_id: Id,
    /// Set when a proposal for this request is accepted.
    pub resolver_id: Option<Id>,
    pub title: String,
    pub description: String,
    pub budget: f64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewServiceRequest {
    pub client_id: Id,
    pub title: String,
    pub description: String,
    pub budget: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Booking {
    pub id: Id,
    pub client_id: Id,
    pub service_listing_id: Option<Id>,
    pub service_request_id: Option<Id>,
    pub status: BookingStatus,
    pub total_price: f64,
    pub payment_status: PaymentStatus,
    pub start_date: DateTime<Utc>,
    pub payment_due: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// None = client has not decided, Some(true) = accepted the delivery,
    /// Some(false) = requested a revision.
    pub client_acknowledged: Option<bool>,
    /// Guards the one-time completed-booking counter increment.
    pub completed_booking_counted: bool,
    pub latest_proposal_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    /// Exactly one context key is non-null for the lifetime of the record.
    pub fn kind(&self) -> BookingKind {
        if self.service_listing_id.is_some() {
            BookingKind::ServiceListing
        } else {
            BookingKind::ServiceRequest
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct BookingProposal {
    pub id: Id,
    pub sender_id: Id,
    pub receiver_id: Id,
    pub service_listing_id: Option<Id>,
    pub service_request_id: Option<Id>,
    /// Null until a request-flow proposal is accepted.
    pub booking_id: Option<Id>,
    pub description: String,
    pub price: f64,
    pub start_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: ProposalStatus,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewBookingProposal {
    pub sender_id: Id,
    pub receiver_id: Id,
    pub service_listing_id: Option<Id>,
    pub service_request_id: Option<Id>,
    pub description: String,
    pub price: f64,
    pub start_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct PaymentPlan {
    pub id: Id,
    pub booking_id: Id,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct PaymentMilestone {
    pub id: Id,
    pub plan_id: Id,
    pub position: i32,
    pub name: String,
    pub amount: f64,
    pub percentage: f64,
    pub due_date: Option<DateTime<Utc>>,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPaymentMilestone {
    pub name: String,
    pub amount: f64,
    pub percentage: f64,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct PaymentLog {
    pub id: Id,
    pub booking_id: Id,
    pub milestone_id: Id,
    pub logged_by: Id,
    pub amount: f64,
    pub payment_method: String,
    pub provider_acknowledged: bool,
    pub provider_acknowledged_at: Option<DateTime<Utc>>,
    pub client_acknowledged: bool,
    pub client_acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PaymentLog {
    /// A payment counts toward the recognized total only with two-party
    /// consensus.
    pub fn fully_acknowledged(&self) -> bool {
        self.provider_acknowledged && self.client_acknowledged
    }
}

/// Legacy flat payment row kept for backward-compatible reporting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Payment {
    pub id: Id,
    pub booking_id: Id,
    pub amount: f64,
    pub payment_method: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct ProgressUpdate {
    pub id: Id,
    pub booking_id: Id,
    pub updated_by: Id,
    pub status: BookingStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct BookingChangeRequest {
    pub id: Id,
    pub booking_id: Id,
    pub requested_by: Id,
    pub kind: ChangeRequestKind,
    pub new_price: Option<f64>,
    pub new_start_date: Option<DateTime<Utc>>,
    pub new_deadline: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub status: ChangeRequestStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Review {
    pub id: Id,
    pub booking_id: Id,
    pub reviewer_id: Id,
    pub reviewed_id: Id,
    pub service_listing_id: Option<Id>,
    pub service_request_id: Option<Id>,
    pub rating: i32,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Conversation {
    pub id: Id,
    pub client_id: Id,
    pub resolver_id: Id,
    pub booking_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Portfolio {
    pub id: Id,
    pub user_id: Id,
    pub title: String,
    pub status: PortfolioStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPortfolio {
    pub user_id: Id,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct Report {
    pub id: Id,
    pub reporter_id: Id,
    pub reported_user_id: Id,
    pub reason: String,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewReport {
    pub reported_user_id: Id,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct AdminAction {
    pub id: Id,
    pub admin_id: Id,
    pub report_id: Id,
    pub action: String,
    /// JSON-encoded snapshot of what the resolution did.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct UserModeration {
    pub id: Id,
    pub user_id: Id,
    pub action: ModerationAction,
    pub reason: String,
    pub end_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-item audit row written when moderation soft-removes content.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::FromRow))]
pub struct ContentFlag {
    pub id: Id,
    pub report_id: Id,
    pub content_kind: String,
    pub content_id: Id,
    pub created_at: DateTime<Utc>,
}
