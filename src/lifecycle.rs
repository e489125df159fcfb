//! Booking lifecycle state machine and the read-time projections derived
//! from it. Every mutating handler goes through [`next_state`] instead of
//! scattering status checks; the projections are pure functions so the read
//! path and the tests share one definition.

use chrono::{DateTime, Duration, Utc};

use crate::models::{BookingStatus, PaymentLog, PaymentStatus};

/// Minimum notice for a unilateral cancellation. Fixed policy, not
/// configurable.
pub const CANCEL_NOTICE_HOURS: i64 = 24;

/// After this long without both reviews, the review phase is displayed as
/// completed. Display only; the stored status is never flipped by a timer.
pub const REVIEW_TIMEOUT_DAYS: i64 = 7;

/// Tolerance when comparing the dual-acknowledged payment sum against the
/// booking total.
pub const PAYMENT_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingEvent {
    ProposalSent,
    ProposalAccepted,
    ProposalDeclined,
    Countered,
    ProgressInProgress,
    ProgressCompleted,
    ClientConfirmed,
    RevisionRequested,
    BothPartiesReviewed,
    AlterationApproved,
    Canceled,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("illegal booking transition: {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: BookingStatus,
    pub event: BookingEvent,
}

/// Single transition table for the booking lifecycle.
pub fn next_state(
    from: BookingStatus,
    event: BookingEvent,
) -> Result<BookingStatus, TransitionError> {
    use BookingEvent::*;
    use BookingStatus::*;
    let to = match (from, event) {
        (ServiceRequested, ProposalSent) => ServiceProposalSent,
        (ServiceProposalSent | Negotiating, ProposalAccepted) => Confirmed,
        (ServiceProposalSent | Negotiating, ProposalDeclined) => Declined,
        (ServiceProposalSent | Negotiating, Countered) => Negotiating,
        (Confirmed | InProgress, ProgressInProgress) => InProgress,
        (Confirmed | InProgress, ProgressCompleted) => Completed,
        (Completed, ClientConfirmed) => AwaitingReview,
        (Completed, RevisionRequested) => InProgress,
        (AwaitingReview, BothPartiesReviewed) => ReviewCompleted,
        (Confirmed, AlterationApproved) => Confirmed,
        (
            ServiceRequested | ServiceProposalSent | Negotiating | Confirmed | InProgress,
            BookingEvent::Canceled,
        ) => BookingStatus::Canceled,
        _ => return Err(TransitionError { from, event }),
    };
    Ok(to)
}

/// Display step of a post-confirmation booking. `None` while the booking is
/// still negotiating or has been canceled/declined.
///
/// 0 = confirmed, 1 = work/update pending (including a revision cycle),
/// 2 = delivered and awaiting the client's decision, 3 = awaiting reviews,
/// 4 = done.
pub fn current_step_index(
    status: BookingStatus,
    client_acknowledged: Option<bool>,
) -> Option<usize> {
    match status {
        BookingStatus::Confirmed => Some(0),
        BookingStatus::InProgress => Some(1),
        // A delivered booking whose client asked for a revision is back in
        // the work-pending step even before the resolver posts an update.
        BookingStatus::Completed if client_acknowledged == Some(false) => Some(1),
        BookingStatus::Completed => Some(2),
        BookingStatus::AwaitingReview => Some(3),
        BookingStatus::ReviewCompleted => Some(4),
        _ => None,
    }
}

/// Soft SLA reminder: has the resolver gone silent while an update is
/// pending? Read path only, never enforced on write.
///
/// The silence threshold tightens from 24h to 12h once the payment deadline
/// is less than 48h away.
pub fn needs_update(
    status: BookingStatus,
    client_acknowledged: Option<bool>,
    last_activity: DateTime<Utc>,
    payment_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if current_step_index(status, client_acknowledged) != Some(1) {
        return false;
    }
    let deadline_close = payment_due
        .map(|due| due - now < Duration::hours(48))
        .unwrap_or(false);
    let threshold = if deadline_close {
        Duration::hours(12)
    } else {
        Duration::hours(24)
    };
    now - last_activity >= threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewPhase {
    AwaitingReviews,
    ReviewCompleted,
}

/// Review phase as shown to the parties. Seven days after completion the
/// phase reads as completed even without both reviews, without touching the
/// stored booking status.
pub fn review_phase(
    status: BookingStatus,
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ReviewPhase {
    if status == BookingStatus::ReviewCompleted {
        return ReviewPhase::ReviewCompleted;
    }
    if let Some(done) = completed_at {
        if now - done >= Duration::days(REVIEW_TIMEOUT_DAYS) {
            return ReviewPhase::ReviewCompleted;
        }
    }
    ReviewPhase::AwaitingReviews
}

/// Aggregate payment state from the dual-acknowledged logs. Logs with only
/// one acknowledgment never count.
pub fn recompute_payment_status(logs: &[PaymentLog], total_price: f64) -> PaymentStatus {
    let recognized: f64 = logs
        .iter()
        .filter(|l| l.fully_acknowledged())
        .map(|l| l.amount)
        .sum();
    if recognized > 0.0 && total_price - recognized <= PAYMENT_EPSILON {
        PaymentStatus::Paid
    } else if recognized > 0.0 {
        PaymentStatus::Partial
    } else {
        PaymentStatus::Pending
    }
}
