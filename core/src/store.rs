//! Repository trait over services and tickets.
//!
//! The engine talks to persistence only through [`QueueStore`]. Each method is
//! one consistent unit of work on the backend; the ones that guard shared
//! resources carry their atomicity contract in their docs.
//!
//! # Implementations
//!
//! - `PostgresQueueStore` (in `queueline-postgres`): production backend
//! - `InMemoryQueueStore` (in `queueline-testing`): fast, deterministic tests
//!
//! # Dyn Compatibility
//!
//! Methods return [`StoreFuture`] instead of using `async fn` so the engine can
//! hold an `Arc<dyn QueueStore>`.

use crate::error::StoreError;
use crate::transition::Transition;
use crate::types::{CancellationRecord, Feedback, Service, ServiceId, Ticket, TicketId, TicketState};
use chrono::{DateTime, NaiveDate, Utc};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Boxed future returned by every store method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Result of a ticket number allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// The new ticket number.
    pub ticket_number: u64,
    /// Tickets issued on the allocation day, this one included.
    pub issued_today: u32,
}

/// Persistence for services and tickets.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; many staff terminals and customer
/// clients hit the same store concurrently.
pub trait QueueStore: Send + Sync {
    /// Persist a new service.
    ///
    /// # Errors
    ///
    /// - `Duplicate { field: "id" }` if the id is taken
    fn insert_service(&self, service: Service) -> StoreFuture<'_, ()>;

    /// Load a service.
    ///
    /// # Errors
    ///
    /// Backend failures only; a missing service is `Ok(None)`.
    fn service(&self, id: ServiceId) -> StoreFuture<'_, Option<Service>>;

    /// Load every service.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn services(&self) -> StoreFuture<'_, Vec<Service>>;

    /// Flip the administrative open/closed switch.
    ///
    /// # Errors
    ///
    /// - `ServiceNotFound`
    fn set_service_open(&self, id: ServiceId, open: bool) -> StoreFuture<'_, ()>;

    /// Reset `current_ticket_number` to zero on every service. Returns how many
    /// services were touched.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn reset_current_ticket_numbers(&self) -> StoreFuture<'_, u64>;

    /// Atomically check the daily limit, bump `last_issued_number` and count the
    /// ticket against `day`.
    ///
    /// The read-increment-write must be a single atomic step per service: two
    /// concurrent callers never observe the same number. On failure nothing is
    /// written. When `day` differs from the stored issue day the daily count
    /// starts over.
    ///
    /// # Errors
    ///
    /// - `ServiceNotFound`
    /// - `CapacityReached` when `day`'s count already equals the limit
    /// - `Unavailable` for transient failures (nothing written)
    fn allocate_ticket_number(&self, id: ServiceId, day: NaiveDate) -> StoreFuture<'_, Allocation>;

    /// Raise `last_issued_number` to the highest persisted ticket number for the
    /// service, under the same lock as allocation. Never lowers it. Returns the
    /// counter after repair.
    ///
    /// # Errors
    ///
    /// - `ServiceNotFound`
    fn resync_ticket_number(&self, id: ServiceId) -> StoreFuture<'_, u64>;

    /// Highest reference sequence issued for `prefix` in `year`, or zero.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn max_reference_sequence<'a>(&'a self, prefix: &'a str, year: i32) -> StoreFuture<'a, u32>;

    /// Whether any ticket already uses `code` as reference, short code or security token.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn code_in_use<'a>(&'a self, code: &'a str) -> StoreFuture<'a, bool>;

    /// Persist a new ticket.
    ///
    /// # Errors
    ///
    /// - `Duplicate` naming the clashing unique field
    /// - `ServiceNotFound`
    fn insert_ticket(&self, ticket: Ticket) -> StoreFuture<'_, ()>;

    /// Load a ticket by id.
    ///
    /// # Errors
    ///
    /// Backend failures only; a miss is `Ok(None)`.
    fn ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>>;

    /// Find the ticket whose reference, short code or security token equals `code`.
    /// Must use an index, not a scan.
    ///
    /// # Errors
    ///
    /// Backend failures only; a miss is `Ok(None)`.
    fn find_by_code<'a>(&'a self, code: &'a str) -> StoreFuture<'a, Option<Ticket>>;

    /// Every waiting ticket of a service, in any order.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn waiting_tickets(&self, service_id: ServiceId) -> StoreFuture<'_, Vec<Ticket>>;

    /// Every ticket of a service in `state`, in any order.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn tickets_in_state(&self, service_id: ServiceId, state: TicketState) -> StoreFuture<'_, Vec<Ticket>>;

    /// Called tickets, across services, whose `called_at` is before `cutoff`.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn called_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<Ticket>>;

    /// Tickets of a service created in `[from, to)`, in any order.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn tickets_created_between(
        &self,
        service_id: ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<Ticket>>;

    /// Tickets cancelled in `[from, to)`.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn cancelled_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreFuture<'_, Vec<Ticket>>;

    /// Compare-and-set a staff transition: applies only if the ticket is still in
    /// `expected`. A `Call` also sets the service's `current_ticket_number` in
    /// the same unit of work. Returns the updated ticket.
    ///
    /// # Errors
    ///
    /// - `TicketNotFound`
    /// - `StateConflict` if the ticket moved on or the transition is not
    ///   allowed from its state; nothing is written
    fn transition_ticket(
        &self,
        id: TicketId,
        expected: TicketState,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Ticket>;

    /// Attach feedback to a served ticket, replacing any earlier feedback.
    ///
    /// # Errors
    ///
    /// - `TicketNotFound`
    /// - `StateConflict` unless the ticket is served
    fn record_feedback(&self, id: TicketId, feedback: Feedback) -> StoreFuture<'_, Ticket>;

    /// Take the per-ticket cancellation lease if it is free or expired at `now`.
    /// Returns `false` when another holder's lease is live.
    ///
    /// # Errors
    ///
    /// - `TicketNotFound`
    fn try_lock_cancellation(
        &self,
        id: TicketId,
        token: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// Write the cancellation and clear the lease in one atomic step. No reader
    /// sees the new state without the cancellation fields or a cleared lease
    /// without the new state.
    ///
    /// # Errors
    ///
    /// - `TicketNotFound`
    /// - `LockNotHeld` if `token` no longer owns the lease
    /// - `StateConflict` if the ticket is no longer waiting or called
    /// - `Unavailable` for transient failures (nothing written)
    fn apply_cancellation(&self, id: TicketId, token: Uuid, record: CancellationRecord) -> StoreFuture<'_, Ticket>;

    /// Drop the lease if `token` still owns it. A no-op otherwise.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn release_cancellation(&self, id: TicketId, token: Uuid) -> StoreFuture<'_, ()>;
}
