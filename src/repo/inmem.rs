use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::*;
use crate::models::*;

const SNAPSHOT_PATH: &str = "data/state.json";

#[derive(Default, Serialize, Deserialize)]
struct State {
    users: HashMap<Id, User>,
    listings: HashMap<Id, ServiceListing>,
    requests: HashMap<Id, ServiceRequest>,
    proposals: HashMap<Id, BookingProposal>,
    bookings: HashMap<Id, Booking>,
    plans: HashMap<Id, PaymentPlan>,
    milestones: HashMap<Id, PaymentMilestone>,
    payment_logs: HashMap<Id, PaymentLog>,
    payments: HashMap<Id, Payment>,
    progress: HashMap<Id, ProgressUpdate>,
    change_requests: HashMap<Id, BookingChangeRequest>,
    reviews: HashMap<Id, Review>,
    conversations: HashMap<Id, Conversation>,
    portfolios: HashMap<Id, Portfolio>,
    reports: HashMap<Id, Report>,
    admin_actions: HashMap<Id, AdminAction>,
    moderations: HashMap<Id, UserModeration>,
    content_flags: HashMap<Id, ContentFlag>,
    next_id: Id,
}

#[derive(Clone)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
    snapshot_path: Arc<PathBuf>,
}

impl InMemRepo {
    fn data_dir() -> PathBuf {
        std::env::var("PEERSERVE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"))
    }

    fn snapshot_path() -> PathBuf {
        if std::env::var("PEERSERVE_DATA_DIR").is_ok() {
            let mut p = Self::data_dir();
            p.push("state.json");
            p
        } else {
            PathBuf::from(SNAPSHOT_PATH)
        }
    }

    fn load_state_from(path: &Path) -> State {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(s) => {
                    log::info!("[inmem] loaded snapshot '{}'", path.display());
                    s
                }
                Err(e) => {
                    log::warn!(
                        "[inmem] failed to parse snapshot '{}': {e}. Starting empty.",
                        path.display()
                    );
                    State::default()
                }
            },
            Err(_) => State::default(),
        }
    }

    fn persist(&self) {
        let path = self.snapshot_path.clone();
        if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(e) = std::fs::write(&*path, s) {
                log::warn!("[inmem] failed to write snapshot '{}': {e}", path.display());
            }
        }
    }

    pub fn new() -> Self {
        let snapshot_path = Self::snapshot_path();
        let state = Self::load_state_from(&snapshot_path);
        Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Arc::new(snapshot_path),
        }
    }

    fn next_id(state: &mut State) -> Id {
        state.next_id += 1;
        state.next_id
    }

    fn ensure_conversation_locked(state: &mut State, client_id: Id, resolver_id: Id) -> Id {
        if let Some(c) = state
            .conversations
            .values()
            .find(|c| c.client_id == client_id && c.resolver_id == resolver_id)
        {
            return c.id;
        }
        let id = Self::next_id(state);
        state.conversations.insert(
            id,
            Conversation {
                id,
                client_id,
                resolver_id,
                booking_id: None,
                created_at: Utc::now(),
            },
        );
        id
    }
}

impl Default for InMemRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepo for InMemRepo {
    async fn create_user(&self, new: NewUser) -> RepoResult<User> {
        let mut s = self.state.write().unwrap();
        if s.users.values().any(|u| u.username == new.username) {
            return Err(RepoError::conflict("username already taken"));
        }
        let id = Self::next_id(&mut s);
        let user = User {
            id,
            username: new.username,
            bio: new.bio,
            trust_rating: 3.0,
            completed_bookings: 0,
            client_cancellations: 0,
            resolver_cancellations: 0,
            created_at: Utc::now(),
        };
        s.users.insert(id, user.clone());
        drop(s);
        self.persist();
        Ok(user)
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        let s = self.state.read().unwrap();
        s.users.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn set_trust_rating(&self, id: Id, rating: f64) -> RepoResult<()> {
        let mut s = self.state.write().unwrap();
        let user = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
        user.trust_rating = rating;
        drop(s);
        self.persist();
        Ok(())
    }

    async fn count_completed_booking(
        &self,
        booking_id: Id,
        client_id: Id,
        resolver_id: Id,
    ) -> RepoResult<bool> {
        let mut s = self.state.write().unwrap();
        let booking = s.bookings.get_mut(&booking_id).ok_or(RepoError::NotFound)?;
        if booking.completed_booking_counted {
            return Ok(false);
        }
        booking.completed_booking_counted = true;
        if let Some(u) = s.users.get_mut(&client_id) {
            u.completed_bookings += 1;
        }
        if let Some(u) = s.users.get_mut(&resolver_id) {
            u.completed_bookings += 1;
        }
        drop(s);
        self.persist();
        Ok(true)
    }
}

#[async_trait]
impl ListingRepo for InMemRepo {
    async fn create_listing(&self, new: NewServiceListing) -> RepoResult<ServiceListing> {
        let mut s = self.state.write().unwrap();
        if !s.users.contains_key(&new.resolver_id) {
            return Err(RepoError::NotFound);
        }
        let id = Self::next_id(&mut s);
        let listing = ServiceListing {
            id,
            resolver_id: new.resolver_id,
            title: new.title,
            description: new.description,
            price: new.price,
            status: ListingStatus::Active,
            created_at: Utc::now(),
        };
        s.listings.insert(id, listing.clone());
        drop(s);
        self.persist();
        Ok(listing)
    }

    async fn get_listing(&self, id: Id) -> RepoResult<ServiceListing> {
        let s = self.state.read().unwrap();
        s.listings.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn list_listings(&self) -> RepoResult<Vec<ServiceListing>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .listings
            .values()
            .filter(|l| l.status == ListingStatus::Active)
            .cloned()
            .collect();
        v.sort_by_key(|l| l.id);
        Ok(v)
    }

    async fn list_listings_by_user(&self, resolver_id: Id) -> RepoResult<Vec<ServiceListing>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .listings
            .values()
            .filter(|l| l.resolver_id == resolver_id)
            .cloned()
            .collect();
        v.sort_by_key(|l| l.id);
        Ok(v)
    }

    async fn set_listing_status(&self, id: Id, status: ListingStatus) -> RepoResult<()> {
        let mut s = self.state.write().unwrap();
        let listing = s.listings.get_mut(&id).ok_or(RepoError::NotFound)?;
        listing.status = status;
        drop(s);
        self.persist();
        Ok(())
    }
}

#[async_trait]
impl RequestRepo for InMemRepo {
    async fn create_request(&self, new: NewServiceRequest) -> RepoResult<ServiceRequest> {
        let mut s = self.state.write().unwrap();
        if !s.users.contains_key(&new.client_id) {
            return Err(RepoError::NotFound);
        }
        let id = Self::next_id(&mut s);
        let request = ServiceRequest {
            id,
            client_id: new.client_id,
            resolver_id: None,
            title: new.title,
            description: new.description,
            budget: new.budget,
            status: RequestStatus::Open,
            created_at: Utc::now(),
        };
        s.requests.insert(id, request.clone());
        drop(s);
        self.persist();
        Ok(request)
    }

    async fn get_request(&self, id: Id) -> RepoResult<ServiceRequest> {
        let s = self.state.read().unwrap();
        s.requests.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn list_requests(&self) -> RepoResult<Vec<ServiceRequest>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s.requests.values().cloned().collect();
        v.sort_by_key(|r| r.id);
        Ok(v)
    }
}

#[async_trait]
impl ProposalRepo for InMemRepo {
    async fn get_proposal(&self, id: Id) -> RepoResult<BookingProposal> {
        let s = self.state.read().unwrap();
        s.proposals.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn send_listing_proposal(
        &self,
        new: NewBookingProposal,
    ) -> RepoResult<(BookingProposal, Booking)> {
        let mut s = self.state.write().unwrap();
        let listing_id = new.service_listing_id.ok_or(RepoError::NotFound)?;
        let resolver_id = s
            .listings
            .get(&listing_id)
            .ok_or(RepoError::NotFound)?
            .resolver_id;
        let now = Utc::now();

        let booking_id = Self::next_id(&mut s);
        let proposal_id = Self::next_id(&mut s);
        let mut booking = Booking {
            id: booking_id,
            client_id: new.sender_id,
            service_listing_id: Some(listing_id),
            service_request_id: None,
            status: BookingStatus::ServiceRequested,
            total_price: new.price,
            payment_status: PaymentStatus::Pending,
            start_date: new.start_date,
            payment_due: new.deadline,
            completed_at: None,
            client_acknowledged: None,
            completed_booking_counted: false,
            latest_proposal_id: None,
            created_at: now,
        };
        let proposal = BookingProposal {
            id: proposal_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            service_listing_id: Some(listing_id),
            service_request_id: None,
            booking_id: Some(booking_id),
            description: new.description,
            price: new.price,
            start_date: new.start_date,
            deadline: new.deadline,
            status: ProposalStatus::Pending,
            decline_reason: None,
            created_at: now,
        };
        booking.status = BookingStatus::ServiceProposalSent;
        booking.latest_proposal_id = Some(proposal_id);
        s.bookings.insert(booking_id, booking.clone());
        s.proposals.insert(proposal_id, proposal.clone());
        Self::ensure_conversation_locked(&mut s, new.sender_id, resolver_id);
        drop(s);
        self.persist();
        Ok((proposal, booking))
    }

    async fn send_request_proposal(&self, new: NewBookingProposal) -> RepoResult<BookingProposal> {
        let mut s = self.state.write().unwrap();
        let request_id = new.service_request_id.ok_or(RepoError::NotFound)?;
        let client_id = s
            .requests
            .get(&request_id)
            .ok_or(RepoError::NotFound)?
            .client_id;
        if s.proposals.values().any(|p| {
            p.sender_id == new.sender_id
                && p.service_request_id == Some(request_id)
                && p.status == ProposalStatus::Pending
        }) {
            return Err(RepoError::conflict(
                "sender already has a pending proposal for this request",
            ));
        }
        let id = Self::next_id(&mut s);
        let proposal = BookingProposal {
            id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            service_listing_id: None,
            service_request_id: Some(request_id),
            booking_id: None,
            description: new.description,
            price: new.price,
            start_date: new.start_date,
            deadline: new.deadline,
            status: ProposalStatus::Pending,
            decline_reason: None,
            created_at: Utc::now(),
        };
        s.proposals.insert(id, proposal.clone());
        Self::ensure_conversation_locked(&mut s, client_id, new.sender_id);
        drop(s);
        self.persist();
        Ok(proposal)
    }

    async fn accept_listing_proposal(
        &self,
        proposal_id: Id,
    ) -> RepoResult<(BookingProposal, Booking)> {
        let mut s = self.state.write().unwrap();
        let proposal = s
            .proposals
            .get(&proposal_id)
            .cloned()
            .ok_or(RepoError::NotFound)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(RepoError::conflict("proposal is no longer pending"));
        }
        let booking_id = proposal.booking_id.ok_or(RepoError::NotFound)?;
        {
            let booking = s.bookings.get_mut(&booking_id).ok_or(RepoError::NotFound)?;
            booking.status = BookingStatus::Confirmed;
            booking.total_price = proposal.price;
            booking.start_date = proposal.start_date;
            booking.payment_due = proposal.deadline;
            booking.latest_proposal_id = Some(proposal_id);
        }
        let p = s.proposals.get_mut(&proposal_id).unwrap();
        p.status = ProposalStatus::Accepted;
        let proposal = p.clone();
        let booking = s.bookings[&booking_id].clone();
        drop(s);
        self.persist();
        Ok((proposal, booking))
    }

    async fn accept_request_proposal(
        &self,
        proposal_id: Id,
        others_reason: &str,
    ) -> RepoResult<(BookingProposal, Booking)> {
        let mut s = self.state.write().unwrap();
        let proposal = s
            .proposals
            .get(&proposal_id)
            .cloned()
            .ok_or(RepoError::NotFound)?;
        if proposal.status != ProposalStatus::Pending {
            return Err(RepoError::conflict("proposal is no longer pending"));
        }
        let request_id = proposal.service_request_id.ok_or(RepoError::NotFound)?;
        let client_id = s
            .requests
            .get(&request_id)
            .ok_or(RepoError::NotFound)?
            .client_id;

        let booking_id = Self::next_id(&mut s);
        let booking = Booking {
            id: booking_id,
            client_id,
            service_listing_id: None,
            service_request_id: Some(request_id),
            status: BookingStatus::Confirmed,
            total_price: proposal.price,
            payment_status: PaymentStatus::Pending,
            start_date: proposal.start_date,
            payment_due: proposal.deadline,
            completed_at: None,
            client_acknowledged: None,
            completed_booking_counted: false,
            latest_proposal_id: Some(proposal_id),
            created_at: Utc::now(),
        };
        s.bookings.insert(booking_id, booking.clone());

        let request = s.requests.get_mut(&request_id).unwrap();
        request.resolver_id = Some(proposal.sender_id);
        request.status = RequestStatus::Assigned;

        // Losing bidders are told why.
        let others: Vec<Id> = s
            .proposals
            .values()
            .filter(|p| {
                p.id != proposal_id
                    && p.service_request_id == Some(request_id)
                    && p.status == ProposalStatus::Pending
            })
            .map(|p| p.id)
            .collect();
        for id in others {
            let p = s.proposals.get_mut(&id).unwrap();
            p.status = ProposalStatus::Declined;
            p.decline_reason = Some(others_reason.to_string());
        }

        let conv_id = Self::ensure_conversation_locked(&mut s, client_id, proposal.sender_id);
        s.conversations.get_mut(&conv_id).unwrap().booking_id = Some(booking_id);

        let p = s.proposals.get_mut(&proposal_id).unwrap();
        p.status = ProposalStatus::Accepted;
        p.booking_id = Some(booking_id);
        let proposal = p.clone();
        drop(s);
        self.persist();
        Ok((proposal, booking))
    }

    async fn decline_proposal(&self, proposal_id: Id, reason: &str) -> RepoResult<BookingProposal> {
        let mut s = self.state.write().unwrap();
        let booking_id = {
            let p = s.proposals.get_mut(&proposal_id).ok_or(RepoError::NotFound)?;
            if p.status != ProposalStatus::Pending {
                return Err(RepoError::conflict("proposal is no longer pending"));
            }
            p.status = ProposalStatus::Declined;
            p.decline_reason = Some(reason.to_string());
            p.booking_id
        };
        if let Some(bid) = booking_id {
            if let Some(b) = s.bookings.get_mut(&bid) {
                b.status = BookingStatus::Declined;
            }
        }
        let proposal = s.proposals[&proposal_id].clone();
        drop(s);
        self.persist();
        Ok(proposal)
    }

    async fn supersede_proposal(
        &self,
        original_id: Id,
        mark_original: ProposalStatus,
        successor: NewBookingProposal,
    ) -> RepoResult<BookingProposal> {
        let mut s = self.state.write().unwrap();
        let booking_id = {
            let p = s.proposals.get_mut(&original_id).ok_or(RepoError::NotFound)?;
            if p.status != ProposalStatus::Pending {
                return Err(RepoError::conflict("proposal is no longer pending"));
            }
            p.status = mark_original;
            p.booking_id
        };
        let id = Self::next_id(&mut s);
        let proposal = BookingProposal {
            id,
            sender_id: successor.sender_id,
            receiver_id: successor.receiver_id,
            service_listing_id: successor.service_listing_id,
            service_request_id: successor.service_request_id,
            booking_id,
            description: successor.description,
            price: successor.price,
            start_date: successor.start_date,
            deadline: successor.deadline,
            status: ProposalStatus::Pending,
            decline_reason: None,
            created_at: Utc::now(),
        };
        s.proposals.insert(id, proposal.clone());
        if let Some(bid) = booking_id {
            if let Some(b) = s.bookings.get_mut(&bid) {
                b.status = BookingStatus::Negotiating;
                b.latest_proposal_id = Some(id);
            }
        }
        drop(s);
        self.persist();
        Ok(proposal)
    }
}

#[async_trait]
impl BookingRepo for InMemRepo {
    async fn get_booking(&self, id: Id) -> RepoResult<Booking> {
        let s = self.state.read().unwrap();
        s.bookings.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn booking_resolver(&self, booking: &Booking) -> RepoResult<Id> {
        let s = self.state.read().unwrap();
        if let Some(listing_id) = booking.service_listing_id {
            return Ok(s
                .listings
                .get(&listing_id)
                .ok_or(RepoError::NotFound)?
                .resolver_id);
        }
        if let Some(request_id) = booking.service_request_id {
            return s
                .requests
                .get(&request_id)
                .ok_or(RepoError::NotFound)?
                .resolver_id
                .ok_or(RepoError::NotFound);
        }
        Err(RepoError::NotFound)
    }

    async fn record_progress(&self, write: ProgressWrite) -> RepoResult<(Booking, ProgressUpdate)> {
        let mut s = self.state.write().unwrap();
        {
            let booking = s
                .bookings
                .get_mut(&write.booking_id)
                .ok_or(RepoError::NotFound)?;
            booking.status = write.booking_status;
            if let Some(ts) = write.completed_at {
                booking.completed_at = Some(ts);
            }
            if let Some(ack) = write.client_acknowledged {
                booking.client_acknowledged = ack;
            }
        }
        let id = Self::next_id(&mut s);
        let update = ProgressUpdate {
            id,
            booking_id: write.booking_id,
            updated_by: write.updated_by,
            status: write.booking_status,
            message: write.message,
            created_at: Utc::now(),
        };
        s.progress.insert(id, update.clone());
        let booking = s.bookings[&write.booking_id].clone();
        drop(s);
        self.persist();
        Ok((booking, update))
    }

    async fn list_progress(&self, booking_id: Id) -> RepoResult<Vec<ProgressUpdate>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .progress
            .values()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect();
        v.sort_by_key(|p| p.id);
        Ok(v)
    }

    async fn set_payment_status(&self, booking_id: Id, status: PaymentStatus) -> RepoResult<()> {
        let mut s = self.state.write().unwrap();
        let booking = s.bookings.get_mut(&booking_id).ok_or(RepoError::NotFound)?;
        booking.payment_status = status;
        drop(s);
        self.persist();
        Ok(())
    }

    async fn create_change_request(
        &self,
        write: ChangeRequestWrite,
    ) -> RepoResult<BookingChangeRequest> {
        let mut s = self.state.write().unwrap();
        if !s.bookings.contains_key(&write.booking_id) {
            return Err(RepoError::NotFound);
        }
        if write.kind == ChangeRequestKind::Alteration
            && s.change_requests.values().any(|c| {
                c.booking_id == write.booking_id
                    && c.kind == ChangeRequestKind::Alteration
                    && c.status == ChangeRequestStatus::Pending
            })
        {
            return Err(RepoError::conflict(
                "an alteration request is already pending for this booking",
            ));
        }
        let id = Self::next_id(&mut s);
        let change = BookingChangeRequest {
            id,
            booking_id: write.booking_id,
            requested_by: write.requested_by,
            kind: write.kind,
            new_price: write.new_price,
            new_start_date: write.new_start_date,
            new_deadline: write.new_deadline,
            reason: write.reason,
            status: write.status,
            created_at: Utc::now(),
            resolved_at: if write.status == ChangeRequestStatus::Pending {
                None
            } else {
                Some(Utc::now())
            },
        };
        s.change_requests.insert(id, change.clone());
        drop(s);
        self.persist();
        Ok(change)
    }

    async fn get_change_request(&self, id: Id) -> RepoResult<BookingChangeRequest> {
        let s = self.state.read().unwrap();
        s.change_requests
            .get(&id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn approve_alteration(
        &self,
        change_id: Id,
    ) -> RepoResult<(BookingChangeRequest, Booking)> {
        let mut s = self.state.write().unwrap();
        let change = s
            .change_requests
            .get(&change_id)
            .cloned()
            .ok_or(RepoError::NotFound)?;
        if change.status != ChangeRequestStatus::Pending {
            return Err(RepoError::conflict("change request already resolved"));
        }
        let latest_proposal_id = {
            let booking = s
                .bookings
                .get_mut(&change.booking_id)
                .ok_or(RepoError::NotFound)?;
            if let Some(p) = change.new_price {
                booking.total_price = p;
            }
            if let Some(d) = change.new_start_date {
                booking.start_date = d;
            }
            if let Some(d) = change.new_deadline {
                booking.payment_due = Some(d);
            }
            booking.status = BookingStatus::Confirmed;
            booking.latest_proposal_id
        };
        // Keep the negotiated terms and the proposal record in agreement.
        if let Some(pid) = latest_proposal_id {
            if let Some(p) = s.proposals.get_mut(&pid) {
                if let Some(price) = change.new_price {
                    p.price = price;
                }
                if let Some(d) = change.new_start_date {
                    p.start_date = d;
                }
                if let Some(d) = change.new_deadline {
                    p.deadline = Some(d);
                }
            }
        }
        let c = s.change_requests.get_mut(&change_id).unwrap();
        c.status = ChangeRequestStatus::Approved;
        c.resolved_at = Some(Utc::now());
        let change = c.clone();
        let booking = s.bookings[&change.booking_id].clone();
        drop(s);
        self.persist();
        Ok((change, booking))
    }

    async fn decline_change_request(&self, change_id: Id) -> RepoResult<BookingChangeRequest> {
        let mut s = self.state.write().unwrap();
        let c = s
            .change_requests
            .get_mut(&change_id)
            .ok_or(RepoError::NotFound)?;
        if c.status != ChangeRequestStatus::Pending {
            return Err(RepoError::conflict("change request already resolved"));
        }
        c.status = ChangeRequestStatus::Declined;
        c.resolved_at = Some(Utc::now());
        let change = c.clone();
        drop(s);
        self.persist();
        Ok(change)
    }

    async fn cancel_booking(
        &self,
        booking_id: Id,
        requested_by: Id,
        initiator_role: PartyRole,
        reason: Option<String>,
        audit_change_id: Option<Id>,
    ) -> RepoResult<Booking> {
        let mut s = self.state.write().unwrap();
        {
            let booking = s.bookings.get_mut(&booking_id).ok_or(RepoError::NotFound)?;
            booking.status = BookingStatus::Canceled;
        }
        match audit_change_id {
            Some(change_id) => {
                let c = s
                    .change_requests
                    .get_mut(&change_id)
                    .ok_or(RepoError::NotFound)?;
                c.status = ChangeRequestStatus::Approved;
                c.resolved_at = Some(Utc::now());
            }
            None => {
                let id = Self::next_id(&mut s);
                s.change_requests.insert(
                    id,
                    BookingChangeRequest {
                        id,
                        booking_id,
                        requested_by,
                        kind: ChangeRequestKind::Cancellation,
                        new_price: None,
                        new_start_date: None,
                        new_deadline: None,
                        reason,
                        status: ChangeRequestStatus::Approved,
                        created_at: Utc::now(),
                        resolved_at: Some(Utc::now()),
                    },
                );
            }
        }
        if let Some(u) = s.users.get_mut(&requested_by) {
            match initiator_role {
                PartyRole::Client => u.client_cancellations += 1,
                PartyRole::Resolver => u.resolver_cancellations += 1,
            }
        }
        let booking = s.bookings[&booking_id].clone();
        drop(s);
        self.persist();
        Ok(booking)
    }
}

#[async_trait]
impl PaymentRepo for InMemRepo {
    async fn create_payment_plan(
        &self,
        booking_id: Id,
        milestones: Vec<NewPaymentMilestone>,
    ) -> RepoResult<(PaymentPlan, Vec<PaymentMilestone>)> {
        let mut s = self.state.write().unwrap();
        if !s.bookings.contains_key(&booking_id) {
            return Err(RepoError::NotFound);
        }
        if s.plans.values().any(|p| p.booking_id == booking_id) {
            return Err(RepoError::conflict("booking already has a payment plan"));
        }
        let plan_id = Self::next_id(&mut s);
        let plan = PaymentPlan {
            id: plan_id,
            booking_id,
            created_at: Utc::now(),
        };
        s.plans.insert(plan_id, plan.clone());
        let mut rows = Vec::with_capacity(milestones.len());
        for (i, m) in milestones.into_iter().enumerate() {
            let id = Self::next_id(&mut s);
            let row = PaymentMilestone {
                id,
                plan_id,
                position: i as i32,
                name: m.name,
                amount: m.amount,
                percentage: m.percentage,
                due_date: m.due_date,
                required: m.required,
            };
            s.milestones.insert(id, row.clone());
            rows.push(row);
        }
        drop(s);
        self.persist();
        Ok((plan, rows))
    }

    async fn get_payment_plan(
        &self,
        booking_id: Id,
    ) -> RepoResult<Option<(PaymentPlan, Vec<PaymentMilestone>)>> {
        let s = self.state.read().unwrap();
        let Some(plan) = s
            .plans
            .values()
            .find(|p| p.booking_id == booking_id)
            .cloned()
        else {
            return Ok(None);
        };
        let mut rows: Vec<_> = s
            .milestones
            .values()
            .filter(|m| m.plan_id == plan.id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.position);
        Ok(Some((plan, rows)))
    }

    async fn get_milestone(&self, id: Id) -> RepoResult<PaymentMilestone> {
        let s = self.state.read().unwrap();
        s.milestones.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn log_payment(&self, write: PaymentLogWrite) -> RepoResult<PaymentLog> {
        let mut s = self.state.write().unwrap();
        if !s.bookings.contains_key(&write.booking_id) {
            return Err(RepoError::NotFound);
        }
        if !s.milestones.contains_key(&write.milestone_id) {
            return Err(RepoError::NotFound);
        }
        if s.payment_logs
            .values()
            .any(|l| l.booking_id == write.booking_id && l.milestone_id == write.milestone_id)
        {
            return Err(RepoError::conflict(
                "a payment is already logged for this milestone",
            ));
        }
        let now = Utc::now();
        let id = Self::next_id(&mut s);
        let log = PaymentLog {
            id,
            booking_id: write.booking_id,
            milestone_id: write.milestone_id,
            logged_by: write.logged_by,
            amount: write.amount,
            payment_method: write.payment_method.clone(),
            provider_acknowledged: write.logger_role == PartyRole::Resolver,
            provider_acknowledged_at: (write.logger_role == PartyRole::Resolver).then_some(now),
            client_acknowledged: write.logger_role == PartyRole::Client,
            client_acknowledged_at: (write.logger_role == PartyRole::Client).then_some(now),
            created_at: now,
        };
        s.payment_logs.insert(id, log.clone());
        // Legacy flat row for reporting.
        let pid = Self::next_id(&mut s);
        s.payments.insert(
            pid,
            Payment {
                id: pid,
                booking_id: write.booking_id,
                amount: write.amount,
                payment_method: write.payment_method,
                created_at: now,
            },
        );
        drop(s);
        self.persist();
        Ok(log)
    }

    async fn get_payment_log(&self, id: Id) -> RepoResult<PaymentLog> {
        let s = self.state.read().unwrap();
        s.payment_logs.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn list_payment_logs(&self, booking_id: Id) -> RepoResult<Vec<PaymentLog>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .payment_logs
            .values()
            .filter(|l| l.booking_id == booking_id)
            .cloned()
            .collect();
        v.sort_by_key(|l| l.id);
        Ok(v)
    }

    async fn acknowledge_payment(
        &self,
        payment_id: Id,
        side: PartyRole,
    ) -> RepoResult<PaymentLog> {
        let mut s = self.state.write().unwrap();
        let log = s
            .payment_logs
            .get_mut(&payment_id)
            .ok_or(RepoError::NotFound)?;
        let now = Utc::now();
        match side {
            PartyRole::Resolver if !log.provider_acknowledged => {
                log.provider_acknowledged = true;
                log.provider_acknowledged_at = Some(now);
            }
            PartyRole::Client if !log.client_acknowledged => {
                log.client_acknowledged = true;
                log.client_acknowledged_at = Some(now);
            }
            _ => {} // already acknowledged, no-op
        }
        let log = log.clone();
        drop(s);
        self.persist();
        Ok(log)
    }
}

#[async_trait]
impl ReviewRepo for InMemRepo {
    async fn create_review(&self, write: ReviewWrite) -> RepoResult<Review> {
        let mut s = self.state.write().unwrap();
        if s.reviews.values().any(|r| {
            r.reviewer_id == write.reviewer_id
                && r.reviewed_id == write.reviewed_id
                && r.service_listing_id == write.service_listing_id
                && r.service_request_id == write.service_request_id
        }) {
            return Err(RepoError::conflict("review already submitted"));
        }
        let id = Self::next_id(&mut s);
        let review = Review {
            id,
            booking_id: write.booking_id,
            reviewer_id: write.reviewer_id,
            reviewed_id: write.reviewed_id,
            service_listing_id: write.service_listing_id,
            service_request_id: write.service_request_id,
            rating: write.rating,
            comment: write.comment,
            created_at: Utc::now(),
        };
        s.reviews.insert(id, review.clone());
        drop(s);
        self.persist();
        Ok(review)
    }

    async fn list_reviews_for_booking(&self, booking_id: Id) -> RepoResult<Vec<Review>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .reviews
            .values()
            .filter(|r| r.booking_id == booking_id)
            .cloned()
            .collect();
        v.sort_by_key(|r| r.id);
        Ok(v)
    }

    async fn list_reviews_for_user(&self, reviewed_id: Id) -> RepoResult<Vec<Review>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .reviews
            .values()
            .filter(|r| r.reviewed_id == reviewed_id)
            .cloned()
            .collect();
        v.sort_by_key(|r| r.id);
        Ok(v)
    }

    async fn list_reviews_by_author(&self, reviewer_id: Id) -> RepoResult<Vec<Review>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .reviews
            .values()
            .filter(|r| r.reviewer_id == reviewer_id)
            .cloned()
            .collect();
        v.sort_by_key(|r| r.id);
        Ok(v)
    }

    async fn delete_review(&self, id: Id) -> RepoResult<()> {
        let mut s = self.state.write().unwrap();
        s.reviews.remove(&id).ok_or(RepoError::NotFound)?;
        drop(s);
        self.persist();
        Ok(())
    }

    async fn complete_reviews(&self, booking_id: Id) -> RepoResult<Booking> {
        let mut s = self.state.write().unwrap();
        let booking = s.bookings.get_mut(&booking_id).ok_or(RepoError::NotFound)?;
        booking.status = BookingStatus::ReviewCompleted;
        let booking = booking.clone();
        drop(s);
        self.persist();
        Ok(booking)
    }
}

#[async_trait]
impl PortfolioRepo for InMemRepo {
    async fn create_portfolio(&self, new: NewPortfolio) -> RepoResult<Portfolio> {
        let mut s = self.state.write().unwrap();
        if !s.users.contains_key(&new.user_id) {
            return Err(RepoError::NotFound);
        }
        let id = Self::next_id(&mut s);
        let portfolio = Portfolio {
            id,
            user_id: new.user_id,
            title: new.title,
            status: PortfolioStatus::Pending,
            created_at: Utc::now(),
        };
        s.portfolios.insert(id, portfolio.clone());
        drop(s);
        self.persist();
        Ok(portfolio)
    }

    async fn get_portfolio(&self, id: Id) -> RepoResult<Portfolio> {
        let s = self.state.read().unwrap();
        s.portfolios.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn set_portfolio_status(&self, id: Id, status: PortfolioStatus) -> RepoResult<Portfolio> {
        let mut s = self.state.write().unwrap();
        let p = s.portfolios.get_mut(&id).ok_or(RepoError::NotFound)?;
        p.status = status;
        let p = p.clone();
        drop(s);
        self.persist();
        Ok(p)
    }

    async fn list_portfolios_by_user(&self, user_id: Id) -> RepoResult<Vec<Portfolio>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .portfolios
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        v.sort_by_key(|p| p.id);
        Ok(v)
    }
}

#[async_trait]
impl ModerationRepo for InMemRepo {
    async fn create_report(&self, reporter_id: Id, new: NewReport) -> RepoResult<Report> {
        let mut s = self.state.write().unwrap();
        if !s.users.contains_key(&new.reported_user_id) {
            return Err(RepoError::NotFound);
        }
        let id = Self::next_id(&mut s);
        let report = Report {
            id,
            reporter_id,
            reported_user_id: new.reported_user_id,
            reason: new.reason,
            status: ReportStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        s.reports.insert(id, report.clone());
        drop(s);
        self.persist();
        Ok(report)
    }

    async fn get_report(&self, id: Id) -> RepoResult<Report> {
        let s = self.state.read().unwrap();
        s.reports.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn list_reports(&self) -> RepoResult<Vec<Report>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s.reports.values().cloned().collect();
        v.sort_by_key(|r| r.id);
        Ok(v)
    }

    async fn mark_report_under_review(&self, id: Id) -> RepoResult<Report> {
        let mut s = self.state.write().unwrap();
        let report = s.reports.get_mut(&id).ok_or(RepoError::NotFound)?;
        if report.status != ReportStatus::Pending {
            return Err(RepoError::conflict("report is not pending"));
        }
        report.status = ReportStatus::UnderReview;
        let report = report.clone();
        drop(s);
        self.persist();
        Ok(report)
    }

    async fn resolve_report(&self, write: ReportResolutionWrite) -> RepoResult<Report> {
        let mut s = self.state.write().unwrap();
        {
            let report = s
                .reports
                .get_mut(&write.report_id)
                .ok_or(RepoError::NotFound)?;
            if matches!(
                report.status,
                ReportStatus::Resolved | ReportStatus::Dismissed
            ) {
                return Err(RepoError::conflict("report already resolved"));
            }
            report.status = write.new_status;
            report.resolved_at = Some(Utc::now());
        }
        if let Some(m) = write.moderation {
            let id = Self::next_id(&mut s);
            s.moderations.insert(
                id,
                UserModeration {
                    id,
                    user_id: m.user_id,
                    action: m.action,
                    reason: m.reason,
                    end_date: m.end_date,
                    is_active: true,
                    created_at: Utc::now(),
                },
            );
        }
        let id = Self::next_id(&mut s);
        s.admin_actions.insert(
            id,
            AdminAction {
                id,
                admin_id: write.admin_id,
                report_id: write.report_id,
                action: write.action,
                metadata: write.metadata,
                created_at: Utc::now(),
            },
        );
        let report = s.reports[&write.report_id].clone();
        drop(s);
        self.persist();
        Ok(report)
    }

    async fn create_content_flag(
        &self,
        report_id: Id,
        content_kind: &str,
        content_id: Id,
    ) -> RepoResult<ContentFlag> {
        let mut s = self.state.write().unwrap();
        let id = Self::next_id(&mut s);
        let flag = ContentFlag {
            id,
            report_id,
            content_kind: content_kind.to_string(),
            content_id,
            created_at: Utc::now(),
        };
        s.content_flags.insert(id, flag.clone());
        drop(s);
        self.persist();
        Ok(flag)
    }

    async fn active_suspension(
        &self,
        user_id: Id,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<UserModeration>> {
        let s = self.state.read().unwrap();
        Ok(s.moderations
            .values()
            .find(|m| {
                m.user_id == user_id
                    && m.action == ModerationAction::TemporarySuspension
                    && m.is_active
                    && m.end_date.map(|d| d > now).unwrap_or(false)
            })
            .cloned())
    }

    async fn list_admin_actions(&self, report_id: Id) -> RepoResult<Vec<AdminAction>> {
        let s = self.state.read().unwrap();
        let mut v: Vec<_> = s
            .admin_actions
            .values()
            .filter(|a| a.report_id == report_id)
            .cloned()
            .collect();
        v.sort_by_key(|a| a.id);
        Ok(v)
    }
}
