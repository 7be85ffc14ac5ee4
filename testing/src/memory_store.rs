//! In-memory [`QueueStore`] for fast, deterministic tests.
//!
//! All state sits behind one `RwLock`, so every trait method is a single atomic
//! step, the same guarantee the Postgres backend gets from row locks. Transient
//! failures can be injected to exercise the engine's single retry.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only panics on a poisoned lock

use chrono::{DateTime, NaiveDate, Utc};
use queueline_core::error::StoreError;
use queueline_core::store::{Allocation, QueueStore, StoreFuture};
use queueline_core::transition::Transition;
use queueline_core::types::{
    CancellationRecord, Feedback, Service, ServiceId, Ticket, TicketId, TicketState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    services: HashMap<ServiceId, Service>,
    tickets: HashMap<TicketId, Ticket>,
    leases: HashMap<TicketId, Lease>,
    codes: HashMap<String, TicketId>,
    numbers: HashSet<(ServiceId, u64)>,
    reference_max: HashMap<(String, i32), u32>,
}

#[derive(Debug, Default)]
struct Faults {
    allocations: AtomicUsize,
    cancellations: AtomicUsize,
    allocation_calls: AtomicUsize,
    yield_on_code_reads: AtomicBool,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// `HashMap`-backed queue store.
///
/// # Example
///
/// ```
/// use queueline_testing::InMemoryQueueStore;
/// use queueline_core::store::QueueStore;
/// use queueline_core::types::Service;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryQueueStore::new();
/// let service = Service::new("Passports", "PAS");
/// let id = service.id;
/// store.insert_service(service).await?;
/// assert!(store.service(id).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryQueueStore {
    state: Arc<RwLock<State>>,
    faults: Arc<Faults>,
}

impl InMemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` allocations fail with a transient error before writing anything.
    pub fn fail_next_allocations(&self, n: usize) {
        self.faults.allocations.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` cancellation writes fail with a transient error.
    pub fn fail_next_cancellations(&self, n: usize) {
        self.faults.cancellations.store(n, Ordering::SeqCst);
    }

    /// Yield to the scheduler before every reference-sequence and code read.
    ///
    /// A database store suspends between those reads and the insert, letting
    /// concurrent creates interleave; this reproduces that in memory.
    pub fn yield_on_code_reads(&self, enabled: bool) {
        self.faults.yield_on_code_reads.store(enabled, Ordering::SeqCst);
    }

    async fn maybe_yield(&self) {
        if self.faults.yield_on_code_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    /// How many times `allocate_ticket_number` was called, failures included.
    #[must_use]
    pub fn allocation_calls(&self) -> usize {
        self.faults.allocation_calls.load(Ordering::SeqCst)
    }

    /// Every ticket, ordered by service then ticket number.
    #[must_use]
    pub fn tickets(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.state.read().unwrap().tickets.values().cloned().collect();
        tickets.sort_by_key(|t| (t.service_id, t.ticket_number));
        tickets
    }

    /// Overwrite a service's counter, simulating drift after a bad import.
    pub fn force_last_issued_number(&self, id: ServiceId, value: u64) {
        if let Some(service) = self.state.write().unwrap().services.get_mut(&id) {
            service.last_issued_number = value;
        }
    }

    /// Whether a live or expired cancellation lease exists on the ticket.
    #[must_use]
    pub fn has_cancellation_lease(&self, id: TicketId) -> bool {
        self.state.read().unwrap().leases.contains_key(&id)
    }
}

impl State {
    fn ticket_mut(&mut self, id: TicketId) -> Result<&mut Ticket, StoreError> {
        self.tickets.get_mut(&id).ok_or(StoreError::TicketNotFound(id))
    }

    fn service_mut(&mut self, id: ServiceId) -> Result<&mut Service, StoreError> {
        self.services.get_mut(&id).ok_or(StoreError::ServiceNotFound(id))
    }

    fn filter_tickets(&self, keep: impl Fn(&Ticket) -> bool) -> Vec<Ticket> {
        self.tickets.values().filter(|t| keep(t)).cloned().collect()
    }
}

impl QueueStore for InMemoryQueueStore {
    fn insert_service(&self, service: Service) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            if state.services.contains_key(&service.id) {
                return Err(StoreError::Duplicate { field: "id" });
            }
            state.services.insert(service.id, service);
            Ok(())
        })
    }

    fn service(&self, id: ServiceId) -> StoreFuture<'_, Option<Service>> {
        Box::pin(async move { Ok(self.state.read().unwrap().services.get(&id).cloned()) })
    }

    fn services(&self) -> StoreFuture<'_, Vec<Service>> {
        Box::pin(async move {
            let mut services: Vec<Service> = self.state.read().unwrap().services.values().cloned().collect();
            services.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(services)
        })
    }

    fn set_service_open(&self, id: ServiceId, open: bool) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.write().unwrap().service_mut(id)?.is_open = open;
            Ok(())
        })
    }

    fn reset_current_ticket_numbers(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            for service in state.services.values_mut() {
                service.current_ticket_number = 0;
            }
            Ok(u64::try_from(state.services.len()).unwrap_or(u64::MAX))
        })
    }

    fn allocate_ticket_number(&self, id: ServiceId, day: NaiveDate) -> StoreFuture<'_, Allocation> {
        Box::pin(async move {
            self.faults.allocation_calls.fetch_add(1, Ordering::SeqCst);
            if Faults::take(&self.faults.allocations) {
                return Err(StoreError::Unavailable("injected allocation failure".into()));
            }
            let mut state = self.state.write().unwrap();
            let service = state.service_mut(id)?;
            let issued = service.issued_on_day(day);
            if issued >= service.max_tickets_per_day {
                return Err(StoreError::CapacityReached {
                    limit: service.max_tickets_per_day,
                });
            }
            service.last_issued_number += 1;
            service.issued_on = Some(day);
            service.issued_today = issued + 1;
            Ok(Allocation {
                ticket_number: service.last_issued_number,
                issued_today: service.issued_today,
            })
        })
    }

    fn resync_ticket_number(&self, id: ServiceId) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            let persisted = state
                .tickets
                .values()
                .filter(|t| t.service_id == id)
                .map(|t| t.ticket_number)
                .max()
                .unwrap_or(0);
            let service = state.service_mut(id)?;
            service.last_issued_number = service.last_issued_number.max(persisted);
            Ok(service.last_issued_number)
        })
    }

    fn max_reference_sequence<'a>(&'a self, prefix: &'a str, year: i32) -> StoreFuture<'a, u32> {
        Box::pin(async move {
            self.maybe_yield().await;
            let state = self.state.read().unwrap();
            Ok(state
                .reference_max
                .get(&(prefix.to_string(), year))
                .copied()
                .unwrap_or(0))
        })
    }

    fn code_in_use<'a>(&'a self, code: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.maybe_yield().await;
            Ok(self.state.read().unwrap().codes.contains_key(code))
        })
    }

    fn insert_ticket(&self, ticket: Ticket) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            if !state.services.contains_key(&ticket.service_id) {
                return Err(StoreError::ServiceNotFound(ticket.service_id));
            }
            if state.tickets.contains_key(&ticket.id) {
                return Err(StoreError::Duplicate { field: "id" });
            }
            if state.numbers.contains(&(ticket.service_id, ticket.ticket_number)) {
                return Err(StoreError::Duplicate { field: "ticket_number" });
            }
            let reference = ticket.reference.to_string();
            for (field, code) in [
                ("reference", &reference),
                ("short_code", &ticket.short_code),
                ("security_token", &ticket.security_token),
            ] {
                if state.codes.contains_key(code.as_str()) {
                    return Err(StoreError::Duplicate { field });
                }
            }

            state.numbers.insert((ticket.service_id, ticket.ticket_number));
            for code in [reference, ticket.short_code.clone(), ticket.security_token.clone()] {
                state.codes.insert(code, ticket.id);
            }
            let key = (ticket.reference.prefix.clone(), ticket.reference.year);
            let max = state.reference_max.entry(key).or_insert(0);
            *max = (*max).max(ticket.reference.sequence);
            state.tickets.insert(ticket.id, ticket);
            Ok(())
        })
    }

    fn ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move { Ok(self.state.read().unwrap().tickets.get(&id).cloned()) })
    }

    fn find_by_code<'a>(&'a self, code: &'a str) -> StoreFuture<'a, Option<Ticket>> {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            Ok(state.codes.get(code).and_then(|id| state.tickets.get(id)).cloned())
        })
    }

    fn waiting_tickets(&self, service_id: ServiceId) -> StoreFuture<'_, Vec<Ticket>> {
        self.tickets_in_state(service_id, TicketState::Waiting)
    }

    fn tickets_in_state(&self, service_id: ServiceId, state: TicketState) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .unwrap()
                .filter_tickets(|t| t.service_id == service_id && t.state == state))
        })
    }

    fn called_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            Ok(self.state.read().unwrap().filter_tickets(|t| {
                t.state == TicketState::Called && t.called_at.is_some_and(|at| at < cutoff)
            }))
        })
    }

    fn tickets_created_between(
        &self,
        service_id: ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .unwrap()
                .filter_tickets(|t| t.service_id == service_id && from <= t.created_at && t.created_at < to))
        })
    }

    fn cancelled_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .unwrap()
                .filter_tickets(|t| t.cancelled_at().is_some_and(|at| from <= at && at < to)))
        })
    }

    fn transition_ticket(
        &self,
        id: TicketId,
        expected: TicketState,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            let ticket = state.ticket_mut(id)?;
            let actual = ticket.state;
            if actual != expected {
                return Err(StoreError::StateConflict { ticket_id: id, actual });
            }
            ticket
                .apply(transition, at)
                .map_err(|_| StoreError::StateConflict { ticket_id: id, actual })?;
            let updated = ticket.clone();
            if transition == Transition::Call {
                state.service_mut(updated.service_id)?.current_ticket_number = updated.ticket_number;
            }
            Ok(updated)
        })
    }

    fn record_feedback(&self, id: TicketId, feedback: Feedback) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            let ticket = state.ticket_mut(id)?;
            if ticket.state != TicketState::Served {
                return Err(StoreError::StateConflict {
                    ticket_id: id,
                    actual: ticket.state,
                });
            }
            ticket.feedback = Some(feedback);
            Ok(ticket.clone())
        })
    }

    fn try_lock_cancellation(
        &self,
        id: TicketId,
        token: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            state.ticket_mut(id)?;
            if state.leases.get(&id).is_some_and(|lease| lease.expires_at > now) {
                return Ok(false);
            }
            state.leases.insert(id, Lease { token, expires_at });
            Ok(true)
        })
    }

    fn apply_cancellation(&self, id: TicketId, token: Uuid, record: CancellationRecord) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            if Faults::take(&self.faults.cancellations) {
                return Err(StoreError::Unavailable("injected cancellation failure".into()));
            }
            let mut state = self.state.write().unwrap();
            state.ticket_mut(id)?;
            if state.leases.get(&id).is_none_or(|lease| lease.token != token) {
                return Err(StoreError::LockNotHeld(id));
            }
            let ticket = state.ticket_mut(id)?;
            let actual = ticket.state;
            ticket
                .cancel(record)
                .map_err(|_| StoreError::StateConflict { ticket_id: id, actual })?;
            let updated = ticket.clone();
            state.leases.remove(&id);
            Ok(updated)
        })
    }

    fn release_cancellation(&self, id: TicketId, token: Uuid) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            if state.leases.get(&id).is_some_and(|lease| lease.token == token) {
                state.leases.remove(&id);
            }
            Ok(())
        })
    }
}
