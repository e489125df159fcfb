use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use super::*;
use crate::models::*;

#[derive(Clone)]
pub struct PgRepo {
    pool: Pool<Postgres>,
}

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> RepoError {
    match e {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(ref d) if d.is_unique_violation() => {
            RepoError::conflict("duplicate record")
        }
        other => RepoError::Internal(other.to_string()),
    }
}

const BOOKING_COLS: &str = "id, client_id, service_listing_id, service_request_id, status, \
     total_price, payment_status, start_date, payment_due, completed_at, client_acknowledged, \
     completed_booking_counted, latest_proposal_id, created_at";

const PROPOSAL_COLS: &str = "id, sender_id, receiver_id, service_listing_id, service_request_id, \
     booking_id, description, price, start_date, deadline, status, decline_reason, created_at";

async fn get_booking_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    id: Id,
) -> RepoResult<Booking> {
    sqlx::query_as::<_, Booking>(&format!("SELECT {BOOKING_COLS} FROM bookings WHERE id=$1"))
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
}

async fn ensure_conversation_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    client_id: Id,
    resolver_id: Id,
) -> RepoResult<Id> {
    if let Some((id,)) = sqlx::query_as::<_, (Id,)>(
        "SELECT id FROM conversations WHERE client_id=$1 AND resolver_id=$2",
    )
    .bind(client_id)
    .bind(resolver_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?
    {
        return Ok(id);
    }
    let (id,): (Id,) = sqlx::query_as(
        "INSERT INTO conversations (client_id, resolver_id) VALUES ($1,$2) RETURNING id",
    )
    .bind(client_id)
    .bind(resolver_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(id)
}

#[async_trait]
impl UserRepo for PgRepo {
    async fn create_user(&self, new: NewUser) -> RepoResult<User> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users (username, bio) VALUES ($1,$2) \
             RETURNING id, username, bio, trust_rating, completed_bookings, \
             client_cancellations, resolver_cancellations, created_at",
        )
        .bind(&new.username)
        .bind(&new.bio)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, bio, trust_rating, completed_bookings, client_cancellations, \
             resolver_cancellations, created_at FROM users WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_trust_rating(&self, id: Id, rating: f64) -> RepoResult<()> {
        let res = sqlx::query("UPDATE users SET trust_rating=$2 WHERE id=$1")
            .bind(id)
            .bind(rating)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn count_completed_booking(
        &self,
        booking_id: Id,
        client_id: Id,
        resolver_id: Id,
    ) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query(
            "UPDATE bookings SET completed_booking_counted=TRUE \
             WHERE id=$1 AND completed_booking_counted=FALSE",
        )
        .bind(booking_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("UPDATE users SET completed_bookings = completed_bookings + 1 WHERE id = ANY($1)")
            .bind(vec![client_id, resolver_id])
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}

#[async_trait]
impl ListingRepo for PgRepo {
    async fn create_listing(&self, new: NewServiceListing) -> RepoResult<ServiceListing> {
        sqlx::query_as::<_, ServiceListing>(
            "INSERT INTO service_listings (resolver_id, title, description, price) \
             VALUES ($1,$2,$3,$4) \
             RETURNING id, resolver_id, title, description, price, status, created_at",
        )
        .bind(new.resolver_id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.price)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_listing(&self, id: Id) -> RepoResult<ServiceListing> {
        sqlx::query_as::<_, ServiceListing>(
            "SELECT id, resolver_id, title, description, price, status, created_at \
             FROM service_listings WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_listings(&self) -> RepoResult<Vec<ServiceListing>> {
        sqlx::query_as::<_, ServiceListing>(
            "SELECT id, resolver_id, title, description, price, status, created_at \
             FROM service_listings WHERE status='ACTIVE' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_listings_by_user(&self, resolver_id: Id) -> RepoResult<Vec<ServiceListing>> {
        sqlx::query_as::<_, ServiceListing>(
            "SELECT id, resolver_id, title, description, price, status, created_at \
             FROM service_listings WHERE resolver_id=$1 ORDER BY id",
        )
        .bind(resolver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_listing_status(&self, id: Id, status: ListingStatus) -> RepoResult<()> {
        let res = sqlx::query("UPDATE service_listings SET status=$2 WHERE id=$1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl RequestRepo for PgRepo {
    async fn create_request(&self, new: NewServiceRequest) -> RepoResult<ServiceRequest> {
        sqlx::query_as::<_, ServiceRequest>(
            "INSERT INTO service_requests (client_id, title, description, budget) \
             VALUES ($1,$2,$3,$4) \
             RETURNING id, client_id, resolver_id, title, description, budget, status, created_at",
        )
        .bind(new.client_id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.budget)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_request(&self, id: Id) -> RepoResult<ServiceRequest> {
        sqlx::query_as::<_, ServiceRequest>(
            "SELECT id, client_id, resolver_id, title, description, budget, status, created_at \
             FROM service_requests WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_requests(&self) -> RepoResult<Vec<ServiceRequest>> {
        sqlx::query_as::<_, ServiceRequest>(
            "SELECT id, client_id, resolver_id, title, description, budget, status, created_at \
             FROM service_requests ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl ProposalRepo for PgRepo {
    async fn get_proposal(&self, id: Id) -> RepoResult<BookingProposal> {
        sqlx::query_as::<_, BookingProposal>(&format!(
            "SELECT {PROPOSAL_COLS} FROM booking_proposals WHERE id=$1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn send_listing_proposal(
        &self,
        new: NewBookingProposal,
    ) -> RepoResult<(BookingProposal, Booking)> {
        let listing_id = new.service_listing_id.ok_or(RepoError::NotFound)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (resolver_id,): (Id,) =
            sqlx::query_as("SELECT resolver_id FROM service_listings WHERE id=$1")
                .bind(listing_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        let (booking_id,): (Id,) = sqlx::query_as(
            "INSERT INTO bookings (client_id, service_listing_id, status, total_price, \
             start_date, payment_due) VALUES ($1,$2,'SERVICE_REQUESTED',$3,$4,$5) RETURNING id",
        )
        .bind(new.sender_id)
        .bind(listing_id)
        .bind(new.price)
        .bind(new.start_date)
        .bind(new.deadline)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let proposal = sqlx::query_as::<_, BookingProposal>(&format!(
            "INSERT INTO booking_proposals (sender_id, receiver_id, service_listing_id, \
             booking_id, description, price, start_date, deadline, status) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,'PENDING') RETURNING {PROPOSAL_COLS}"
        ))
        .bind(new.sender_id)
        .bind(new.receiver_id)
        .bind(listing_id)
        .bind(booking_id)
        .bind(&new.description)
        .bind(new.price)
        .bind(new.start_date)
        .bind(new.deadline)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "UPDATE bookings SET status='SERVICE_PROPOSAL_SENT', latest_proposal_id=$2 WHERE id=$1",
        )
        .bind(booking_id)
        .bind(proposal.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        ensure_conversation_tx(&mut tx, new.sender_id, resolver_id).await?;
        let booking = get_booking_tx(&mut tx, booking_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((proposal, booking))
    }

    async fn send_request_proposal(&self, new: NewBookingProposal) -> RepoResult<BookingProposal> {
        let request_id = new.service_request_id.ok_or(RepoError::NotFound)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (client_id,): (Id,) =
            sqlx::query_as("SELECT client_id FROM service_requests WHERE id=$1")
                .bind(request_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        let (dup,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM booking_proposals \
             WHERE sender_id=$1 AND service_request_id=$2 AND status='PENDING')",
        )
        .bind(new.sender_id)
        .bind(request_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if dup {
            return Err(RepoError::conflict(
                "sender already has a pending proposal for this request",
            ));
        }
        let proposal = sqlx::query_as::<_, BookingProposal>(&format!(
            "INSERT INTO booking_proposals (sender_id, receiver_id, service_request_id, \
             description, price, start_date, deadline, status) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,'PENDING') RETURNING {PROPOSAL_COLS}"
        ))
        .bind(new.sender_id)
        .bind(new.receiver_id)
        .bind(request_id)
        .bind(&new.description)
        .bind(new.price)
        .bind(new.start_date)
        .bind(new.deadline)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        ensure_conversation_tx(&mut tx, client_id, new.sender_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(proposal)
    }

    async fn accept_listing_proposal(
        &self,
        proposal_id: Id,
    ) -> RepoResult<(BookingProposal, Booking)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let proposal = sqlx::query_as::<_, BookingProposal>(&format!(
            "UPDATE booking_proposals SET status='ACCEPTED' \
             WHERE id=$1 AND status='PENDING' RETURNING {PROPOSAL_COLS}"
        ))
        .bind(proposal_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RepoError::conflict("proposal is no longer pending"))?;
        let booking_id = proposal.booking_id.ok_or(RepoError::NotFound)?;
        sqlx::query(
            "UPDATE bookings SET status='CONFIRMED', total_price=$2, start_date=$3, \
             payment_due=$4, latest_proposal_id=$5 WHERE id=$1",
        )
        .bind(booking_id)
        .bind(proposal.price)
        .bind(proposal.start_date)
        .bind(proposal.deadline)
        .bind(proposal.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let booking = get_booking_tx(&mut tx, booking_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((proposal, booking))
    }

    async fn accept_request_proposal(
        &self,
        proposal_id: Id,
        others_reason: &str,
    ) -> RepoResult<(BookingProposal, Booking)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let proposal = sqlx::query_as::<_, BookingProposal>(&format!(
            "SELECT {PROPOSAL_COLS} FROM booking_proposals WHERE id=$1 FOR UPDATE"
        ))
        .bind(proposal_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(RepoError::conflict("proposal is no longer pending"));
        }
        let request_id = proposal.service_request_id.ok_or(RepoError::NotFound)?;
        let (client_id,): (Id,) =
            sqlx::query_as("SELECT client_id FROM service_requests WHERE id=$1")
                .bind(request_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        let (booking_id,): (Id,) = sqlx::query_as(
            "INSERT INTO bookings (client_id, service_request_id, status, total_price, \
             start_date, payment_due, latest_proposal_id) \
             VALUES ($1,$2,'CONFIRMED',$3,$4,$5,$6) RETURNING id",
        )
        .bind(client_id)
        .bind(request_id)
        .bind(proposal.price)
        .bind(proposal.start_date)
        .bind(proposal.deadline)
        .bind(proposal.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE service_requests SET resolver_id=$2, status='ASSIGNED' WHERE id=$1")
            .bind(request_id)
            .bind(proposal.sender_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "UPDATE booking_proposals SET status='DECLINED', decline_reason=$3 \
             WHERE service_request_id=$1 AND id<>$2 AND status='PENDING'",
        )
        .bind(request_id)
        .bind(proposal_id)
        .bind(others_reason)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let conv_id = ensure_conversation_tx(&mut tx, client_id, proposal.sender_id).await?;
        sqlx::query("UPDATE conversations SET booking_id=$2 WHERE id=$1")
            .bind(conv_id)
            .bind(booking_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let proposal = sqlx::query_as::<_, BookingProposal>(&format!(
            "UPDATE booking_proposals SET status='ACCEPTED', booking_id=$2 \
             WHERE id=$1 RETURNING {PROPOSAL_COLS}"
        ))
        .bind(proposal_id)
        .bind(booking_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let booking = get_booking_tx(&mut tx, booking_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((proposal, booking))
    }

    async fn decline_proposal(&self, proposal_id: Id, reason: &str) -> RepoResult<BookingProposal> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let proposal = sqlx::query_as::<_, BookingProposal>(&format!(
            "UPDATE booking_proposals SET status='DECLINED', decline_reason=$2 \
             WHERE id=$1 AND status='PENDING' RETURNING {PROPOSAL_COLS}"
        ))
        .bind(proposal_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RepoError::conflict("proposal is no longer pending"))?;
        if let Some(booking_id) = proposal.booking_id {
            sqlx::query("UPDATE bookings SET status='DECLINED' WHERE id=$1")
                .bind(booking_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(proposal)
    }

    async fn supersede_proposal(
        &self,
        original_id: Id,
        mark_original: ProposalStatus,
        successor: NewBookingProposal,
    ) -> RepoResult<BookingProposal> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let original = sqlx::query_as::<_, BookingProposal>(&format!(
            "UPDATE booking_proposals SET status=$2 \
             WHERE id=$1 AND status='PENDING' RETURNING {PROPOSAL_COLS}"
        ))
        .bind(original_id)
        .bind(mark_original)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RepoError::conflict("proposal is no longer pending"))?;
        let proposal = sqlx::query_as::<_, BookingProposal>(&format!(
            "INSERT INTO booking_proposals (sender_id, receiver_id, service_listing_id, \
             service_request_id, booking_id, description, price, start_date, deadline, status) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,'PENDING') RETURNING {PROPOSAL_COLS}"
        ))
        .bind(successor.sender_id)
        .bind(successor.receiver_id)
        .bind(successor.service_listing_id)
        .bind(successor.service_request_id)
        .bind(original.booking_id)
        .bind(&successor.description)
        .bind(successor.price)
        .bind(successor.start_date)
        .bind(successor.deadline)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if let Some(booking_id) = original.booking_id {
            sqlx::query(
                "UPDATE bookings SET status='NEGOTIATING', latest_proposal_id=$2 WHERE id=$1",
            )
            .bind(booking_id)
            .bind(proposal.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(proposal)
    }
}

#[async_trait]
impl BookingRepo for PgRepo {
    async fn get_booking(&self, id: Id) -> RepoResult<Booking> {
        sqlx::query_as::<_, Booking>(&format!("SELECT {BOOKING_COLS} FROM bookings WHERE id=$1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn booking_resolver(&self, booking: &Booking) -> RepoResult<Id> {
        if let Some(listing_id) = booking.service_listing_id {
            let (resolver_id,): (Id,) =
                sqlx::query_as("SELECT resolver_id FROM service_listings WHERE id=$1")
                    .bind(listing_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?;
            return Ok(resolver_id);
        }
        if let Some(request_id) = booking.service_request_id {
            let (resolver_id,): (Option<Id>,) =
                sqlx::query_as("SELECT resolver_id FROM service_requests WHERE id=$1")
                    .bind(request_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?;
            return resolver_id.ok_or(RepoError::NotFound);
        }
        Err(RepoError::NotFound)
    }

    async fn record_progress(&self, write: ProgressWrite) -> RepoResult<(Booking, ProgressUpdate)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE bookings SET status=$2 WHERE id=$1")
            .bind(write.booking_id)
            .bind(write.booking_status)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if let Some(ts) = write.completed_at {
            sqlx::query("UPDATE bookings SET completed_at=$2 WHERE id=$1")
                .bind(write.booking_id)
                .bind(ts)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        if let Some(ack) = write.client_acknowledged {
            sqlx::query("UPDATE bookings SET client_acknowledged=$2 WHERE id=$1")
                .bind(write.booking_id)
                .bind(ack)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        let update = sqlx::query_as::<_, ProgressUpdate>(
            "INSERT INTO progress_updates (booking_id, updated_by, status, message) \
             VALUES ($1,$2,$3,$4) RETURNING id, booking_id, updated_by, status, message, created_at",
        )
        .bind(write.booking_id)
        .bind(write.updated_by)
        .bind(write.booking_status)
        .bind(&write.message)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let booking = get_booking_tx(&mut tx, write.booking_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((booking, update))
    }

    async fn list_progress(&self, booking_id: Id) -> RepoResult<Vec<ProgressUpdate>> {
        sqlx::query_as::<_, ProgressUpdate>(
            "SELECT id, booking_id, updated_by, status, message, created_at \
             FROM progress_updates WHERE booking_id=$1 ORDER BY id",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_payment_status(&self, booking_id: Id, status: PaymentStatus) -> RepoResult<()> {
        let res = sqlx::query("UPDATE bookings SET payment_status=$2 WHERE id=$1")
            .bind(booking_id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn create_change_request(
        &self,
        write: ChangeRequestWrite,
    ) -> RepoResult<BookingChangeRequest> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if write.kind == ChangeRequestKind::Alteration {
            let (dup,): (bool,) = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM booking_change_requests \
                 WHERE booking_id=$1 AND kind='ALTERATION' AND status='PENDING')",
            )
            .bind(write.booking_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            if dup {
                return Err(RepoError::conflict(
                    "an alteration request is already pending for this booking",
                ));
            }
        }
        let resolved_at = (write.status != ChangeRequestStatus::Pending).then(Utc::now);
        let change = sqlx::query_as::<_, BookingChangeRequest>(
            "INSERT INTO booking_change_requests (booking_id, requested_by, kind, new_price, \
             new_start_date, new_deadline, reason, status, resolved_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
             RETURNING id, booking_id, requested_by, kind, new_price, new_start_date, \
             new_deadline, reason, status, created_at, resolved_at",
        )
        .bind(write.booking_id)
        .bind(write.requested_by)
        .bind(write.kind)
        .bind(write.new_price)
        .bind(write.new_start_date)
        .bind(write.new_deadline)
        .bind(&write.reason)
        .bind(write.status)
        .bind(resolved_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(change)
    }

    async fn get_change_request(&self, id: Id) -> RepoResult<BookingChangeRequest> {
        sqlx::query_as::<_, BookingChangeRequest>(
            "SELECT id, booking_id, requested_by, kind, new_price, new_start_date, new_deadline, \
             reason, status, created_at, resolved_at FROM booking_change_requests WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn approve_alteration(
        &self,
        change_id: Id,
    ) -> RepoResult<(BookingChangeRequest, Booking)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let change = sqlx::query_as::<_, BookingChangeRequest>(
            "UPDATE booking_change_requests SET status='APPROVED', resolved_at=now() \
             WHERE id=$1 AND status='PENDING' \
             RETURNING id, booking_id, requested_by, kind, new_price, new_start_date, \
             new_deadline, reason, status, created_at, resolved_at",
        )
        .bind(change_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RepoError::conflict("change request already resolved"))?;
        sqlx::query(
            "UPDATE bookings SET total_price=COALESCE($2,total_price), \
             start_date=COALESCE($3,start_date), payment_due=COALESCE($4,payment_due), \
             status='CONFIRMED' WHERE id=$1",
        )
        .bind(change.booking_id)
        .bind(change.new_price)
        .bind(change.new_start_date)
        .bind(change.new_deadline)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        // Keep the negotiated terms and the proposal record in agreement.
        sqlx::query(
            "UPDATE booking_proposals p SET price=COALESCE($2,p.price), \
             start_date=COALESCE($3,p.start_date), deadline=COALESCE($4,p.deadline) \
             FROM bookings b WHERE b.id=$1 AND p.id=b.latest_proposal_id",
        )
        .bind(change.booking_id)
        .bind(change.new_price)
        .bind(change.new_start_date)
        .bind(change.new_deadline)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let booking = get_booking_tx(&mut tx, change.booking_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok((change, booking))
    }

    async fn decline_change_request(&self, change_id: Id) -> RepoResult<BookingChangeRequest> {
        sqlx::query_as::<_, BookingChangeRequest>(
            "UPDATE booking_change_requests SET status='DECLINED', resolved_at=now() \
             WHERE id=$1 AND status='PENDING' \
             RETURNING id, booking_id, requested_by, kind, new_price, new_start_date, \
             new_deadline, reason, status, created_at, resolved_at",
        )
        .bind(change_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RepoError::conflict("change request already resolved"))
    }

    async fn cancel_booking(
        &self,
        booking_id: Id,
        requested_by: Id,
        initiator_role: PartyRole,
        reason: Option<String>,
        audit_change_id: Option<Id>,
    ) -> RepoResult<Booking> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE bookings SET status='CANCELED' WHERE id=$1")
            .bind(booking_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        match audit_change_id {
            Some(change_id) => {
                sqlx::query(
                    "UPDATE booking_change_requests SET status='APPROVED', resolved_at=now() \
                     WHERE id=$1",
                )
                .bind(change_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO booking_change_requests (booking_id, requested_by, kind, \
                     reason, status, resolved_at) \
                     VALUES ($1,$2,'CANCELLATION',$3,'APPROVED',now())",
                )
                .bind(booking_id)
                .bind(requested_by)
                .bind(&reason)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }
        let counter = match initiator_role {
            PartyRole::Client => "client_cancellations",
            PartyRole::Resolver => "resolver_cancellations",
        };
        sqlx::query(&format!(
            "UPDATE users SET {counter} = {counter} + 1 WHERE id=$1"
        ))
        .bind(requested_by)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let booking = get_booking_tx(&mut tx, booking_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(booking)
    }
}

#[async_trait]
impl PaymentRepo for PgRepo {
    async fn create_payment_plan(
        &self,
        booking_id: Id,
        milestones: Vec<NewPaymentMilestone>,
    ) -> RepoResult<(PaymentPlan, Vec<PaymentMilestone>)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (dup,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM payment_plans WHERE booking_id=$1)")
                .bind(booking_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        if dup {
            return Err(RepoError::conflict("booking already has a payment plan"));
        }
        let plan = sqlx::query_as::<_, PaymentPlan>(
            "INSERT INTO payment_plans (booking_id) VALUES ($1) \
             RETURNING id, booking_id, created_at",
        )
        .bind(booking_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let mut rows = Vec::with_capacity(milestones.len());
        for (i, m) in milestones.into_iter().enumerate() {
            let row = sqlx::query_as::<_, PaymentMilestone>(
                "INSERT INTO payment_milestones (plan_id, position, name, amount, percentage, \
                 due_date, required) VALUES ($1,$2,$3,$4,$5,$6,$7) \
                 RETURNING id, plan_id, position, name, amount, percentage, due_date, required",
            )
            .bind(plan.id)
            .bind(i as i32)
            .bind(&m.name)
            .bind(m.amount)
            .bind(m.percentage)
            .bind(m.due_date)
            .bind(m.required)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            rows.push(row);
        }
        tx.commit().await.map_err(db_err)?;
        Ok((plan, rows))
    }

    async fn get_payment_plan(
        &self,
        booking_id: Id,
    ) -> RepoResult<Option<(PaymentPlan, Vec<PaymentMilestone>)>> {
        let Some(plan) = sqlx::query_as::<_, PaymentPlan>(
            "SELECT id, booking_id, created_at FROM payment_plans WHERE booking_id=$1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        else {
            return Ok(None);
        };
        let rows = sqlx::query_as::<_, PaymentMilestone>(
            "SELECT id, plan_id, position, name, amount, percentage, due_date, required \
             FROM payment_milestones WHERE plan_id=$1 ORDER BY position",
        )
        .bind(plan.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(Some((plan, rows)))
    }

    async fn get_milestone(&self, id: Id) -> RepoResult<PaymentMilestone> {
        sqlx::query_as::<_, PaymentMilestone>(
            "SELECT id, plan_id, position, name, amount, percentage, due_date, required \
             FROM payment_milestones WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn log_payment(&self, write: PaymentLogWrite) -> RepoResult<PaymentLog> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (dup,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM payment_logs WHERE booking_id=$1 AND milestone_id=$2)",
        )
        .bind(write.booking_id)
        .bind(write.milestone_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if dup {
            return Err(RepoError::conflict(
                "a payment is already logged for this milestone",
            ));
        }
        let as_provider = write.logger_role == PartyRole::Resolver;
        let log = sqlx::query_as::<_, PaymentLog>(
            "INSERT INTO payment_logs (booking_id, milestone_id, logged_by, amount, \
             payment_method, provider_acknowledged, provider_acknowledged_at, \
             client_acknowledged, client_acknowledged_at) \
             VALUES ($1,$2,$3,$4,$5,$6, CASE WHEN $6 THEN now() END, \
             $7, CASE WHEN $7 THEN now() END) \
             RETURNING id, booking_id, milestone_id, logged_by, amount, payment_method, \
             provider_acknowledged, provider_acknowledged_at, client_acknowledged, \
             client_acknowledged_at, created_at",
        )
        .bind(write.booking_id)
        .bind(write.milestone_id)
        .bind(write.logged_by)
        .bind(write.amount)
        .bind(&write.payment_method)
        .bind(as_provider)
        .bind(!as_provider)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("INSERT INTO payments (booking_id, amount, payment_method) VALUES ($1,$2,$3)")
            .bind(write.booking_id)
            .bind(write.amount)
            .bind(&write.payment_method)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(log)
    }

    async fn get_payment_log(&self, id: Id) -> RepoResult<PaymentLog> {
        sqlx::query_as::<_, PaymentLog>(
            "SELECT id, booking_id, milestone_id, logged_by, amount, payment_method, \
             provider_acknowledged, provider_acknowledged_at, client_acknowledged, \
             client_acknowledged_at, created_at FROM payment_logs WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_payment_logs(&self, booking_id: Id) -> RepoResult<Vec<PaymentLog>> {
        sqlx::query_as::<_, PaymentLog>(
            "SELECT id, booking_id, milestone_id, logged_by, amount, payment_method, \
             provider_acknowledged, provider_acknowledged_at, client_acknowledged, \
             client_acknowledged_at, created_at FROM payment_logs WHERE booking_id=$1 ORDER BY id",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn acknowledge_payment(
        &self,
        payment_id: Id,
        side: PartyRole,
    ) -> RepoResult<PaymentLog> {
        let column = match side {
            PartyRole::Resolver => "provider_acknowledged",
            PartyRole::Client => "client_acknowledged",
        };
        sqlx::query_as::<_, PaymentLog>(&format!(
            "UPDATE payment_logs SET {column}=TRUE, \
             {column}_at=CASE WHEN {column} THEN {column}_at ELSE now() END \
             WHERE id=$1 \
             RETURNING id, booking_id, milestone_id, logged_by, amount, payment_method, \
             provider_acknowledged, provider_acknowledged_at, client_acknowledged, \
             client_acknowledged_at, created_at"
        ))
        .bind(payment_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

const REVIEW_COLS: &str = "id, booking_id, reviewer_id, reviewed_id, service_listing_id, \
     service_request_id, rating, comment, created_at";

#[async_trait]
impl ReviewRepo for PgRepo {
    async fn create_review(&self, write: ReviewWrite) -> RepoResult<Review> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (dup,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM reviews WHERE reviewer_id=$1 AND reviewed_id=$2 \
             AND service_listing_id IS NOT DISTINCT FROM $3 \
             AND service_request_id IS NOT DISTINCT FROM $4)",
        )
        .bind(write.reviewer_id)
        .bind(write.reviewed_id)
        .bind(write.service_listing_id)
        .bind(write.service_request_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if dup {
            return Err(RepoError::conflict("review already submitted"));
        }
        let review = sqlx::query_as::<_, Review>(&format!(
            "INSERT INTO reviews (booking_id, reviewer_id, reviewed_id, service_listing_id, \
             service_request_id, rating, comment) VALUES ($1,$2,$3,$4,$5,$6,$7) \
             RETURNING {REVIEW_COLS}"
        ))
        .bind(write.booking_id)
        .bind(write.reviewer_id)
        .bind(write.reviewed_id)
        .bind(write.service_listing_id)
        .bind(write.service_request_id)
        .bind(write.rating)
        .bind(&write.comment)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(review)
    }

    async fn list_reviews_for_booking(&self, booking_id: Id) -> RepoResult<Vec<Review>> {
        sqlx::query_as::<_, Review>(&format!(
            "SELECT {REVIEW_COLS} FROM reviews WHERE booking_id=$1 ORDER BY id"
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_reviews_for_user(&self, reviewed_id: Id) -> RepoResult<Vec<Review>> {
        sqlx::query_as::<_, Review>(&format!(
            "SELECT {REVIEW_COLS} FROM reviews WHERE reviewed_id=$1 ORDER BY id"
        ))
        .bind(reviewed_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_reviews_by_author(&self, reviewer_id: Id) -> RepoResult<Vec<Review>> {
        sqlx::query_as::<_, Review>(&format!(
            "SELECT {REVIEW_COLS} FROM reviews WHERE reviewer_id=$1 ORDER BY id"
        ))
        .bind(reviewer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn delete_review(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM reviews WHERE id=$1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn complete_reviews(&self, booking_id: Id) -> RepoResult<Booking> {
        sqlx::query_as::<_, Booking>(&format!(
            "UPDATE bookings SET status='REVIEW_COMPLETED' WHERE id=$1 RETURNING {BOOKING_COLS}"
        ))
        .bind(booking_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl PortfolioRepo for PgRepo {
    async fn create_portfolio(&self, new: NewPortfolio) -> RepoResult<Portfolio> {
        sqlx::query_as::<_, Portfolio>(
            "INSERT INTO portfolios (user_id, title, status) VALUES ($1,$2,$3) \
             RETURNING id, user_id, title, status, created_at",
        )
        .bind(new.user_id)
        .bind(&new.title)
        .bind(PortfolioStatus::Pending)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_portfolio(&self, id: Id) -> RepoResult<Portfolio> {
        sqlx::query_as::<_, Portfolio>(
            "SELECT id, user_id, title, status, created_at FROM portfolios WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_portfolio_status(&self, id: Id, status: PortfolioStatus) -> RepoResult<Portfolio> {
        sqlx::query_as::<_, Portfolio>(
            "UPDATE portfolios SET status=$2 WHERE id=$1 \
             RETURNING id, user_id, title, status, created_at",
        )
        .bind(id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_portfolios_by_user(&self, user_id: Id) -> RepoResult<Vec<Portfolio>> {
        sqlx::query_as::<_, Portfolio>(
            "SELECT id, user_id, title, status, created_at FROM portfolios \
             WHERE user_id=$1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl ModerationRepo for PgRepo {
    async fn create_report(&self, reporter_id: Id, new: NewReport) -> RepoResult<Report> {
        sqlx::query_as::<_, Report>(
            "INSERT INTO reports (reporter_id, reported_user_id, reason) VALUES ($1,$2,$3) \
             RETURNING id, reporter_id, reported_user_id, reason, status, created_at, resolved_at",
        )
        .bind(reporter_id)
        .bind(new.reported_user_id)
        .bind(&new.reason)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_report(&self, id: Id) -> RepoResult<Report> {
        sqlx::query_as::<_, Report>(
            "SELECT id, reporter_id, reported_user_id, reason, status, created_at, resolved_at \
             FROM reports WHERE id=$1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_reports(&self) -> RepoResult<Vec<Report>> {
        sqlx::query_as::<_, Report>(
            "SELECT id, reporter_id, reported_user_id, reason, status, created_at, resolved_at \
             FROM reports ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn mark_report_under_review(&self, id: Id) -> RepoResult<Report> {
        sqlx::query_as::<_, Report>(
            "UPDATE reports SET status='UNDER_REVIEW' WHERE id=$1 AND status='PENDING' \
             RETURNING id, reporter_id, reported_user_id, reason, status, created_at, resolved_at",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RepoError::conflict("report is not pending"))
    }

    async fn resolve_report(&self, write: ReportResolutionWrite) -> RepoResult<Report> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let report = sqlx::query_as::<_, Report>(
            "UPDATE reports SET status=$2, resolved_at=now() \
             WHERE id=$1 AND status IN ('PENDING','UNDER_REVIEW') \
             RETURNING id, reporter_id, reported_user_id, reason, status, created_at, resolved_at",
        )
        .bind(write.report_id)
        .bind(write.new_status)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| RepoError::conflict("report already resolved"))?;
        if let Some(m) = write.moderation {
            sqlx::query(
                "INSERT INTO user_moderations (user_id, action, reason, end_date, is_active) \
                 VALUES ($1,$2,$3,$4,TRUE)",
            )
            .bind(m.user_id)
            .bind(m.action)
            .bind(&m.reason)
            .bind(m.end_date)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        sqlx::query(
            "INSERT INTO admin_actions (admin_id, report_id, action, metadata) \
             VALUES ($1,$2,$3,$4)",
        )
        .bind(write.admin_id)
        .bind(write.report_id)
        .bind(&write.action)
        .bind(&write.metadata)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(report)
    }

    async fn create_content_flag(
        &self,
        report_id: Id,
        content_kind: &str,
        content_id: Id,
    ) -> RepoResult<ContentFlag> {
        sqlx::query_as::<_, ContentFlag>(
            "INSERT INTO content_flags (report_id, content_kind, content_id) VALUES ($1,$2,$3) \
             RETURNING id, report_id, content_kind, content_id, created_at",
        )
        .bind(report_id)
        .bind(content_kind)
        .bind(content_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn active_suspension(
        &self,
        user_id: Id,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<UserModeration>> {
        sqlx::query_as::<_, UserModeration>(
            "SELECT id, user_id, action, reason, end_date, is_active, created_at \
             FROM user_moderations WHERE user_id=$1 AND action='TEMPORARY_SUSPENSION' \
             AND is_active AND end_date > $2 ORDER BY end_date DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_admin_actions(&self, report_id: Id) -> RepoResult<Vec<AdminAction>> {
        sqlx::query_as::<_, AdminAction>(
            "SELECT id, admin_id, report_id, action, metadata, created_at \
             FROM admin_actions WHERE report_id=$1 ORDER BY id",
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}
