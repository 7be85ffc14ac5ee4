//! Error taxonomy.
//!
//! [`QueueError`] is what callers of the engine see. [`StoreError`] is what a
//! [`QueueStore`](crate::store::QueueStore) backend reports; the engine maps it onto
//! the caller-facing taxonomy and decides whether a failure is worth one retry.

use crate::schedule::{Availability, ScheduleError};
use crate::types::{ServiceId, TicketId, TicketState};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Something a lookup could not find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    /// No service with this id.
    Service(ServiceId),
    /// No ticket with this id.
    Ticket(TicketId),
    /// No ticket answers to this reference, short code or token.
    Code(String),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(id) => write!(f, "service {id}"),
            Self::Ticket(id) => write!(f, "ticket {id}"),
            Self::Code(code) => write!(f, "ticket code {code:?}"),
        }
    }
}

/// Why a ticket cannot be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelBlock {
    /// Already being served or in a terminal state.
    State(TicketState),
    /// Client-initiated cancellation is switched off.
    ClientCancellationDisabled,
}

impl fmt::Display for CancelBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(state) => write!(f, "ticket is {state}"),
            Self::ClientCancellationDisabled => f.write_str("client cancellation is disabled"),
        }
    }
}

/// Errors returned by queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The service is closed, outside its hours, or on a break.
    #[error("service {service_id} is not accepting tickets: {availability}")]
    ServiceUnavailable {
        /// Service asked for a ticket.
        service_id: ServiceId,
        /// Why it is unavailable.
        availability: Availability,
    },

    /// The service already issued its daily maximum.
    #[error("service {service_id} reached its daily limit of {limit} tickets")]
    CapacityExceeded {
        /// Service asked for a ticket.
        service_id: ServiceId,
        /// Configured daily maximum.
        limit: u32,
    },

    /// A state machine guard failed; the ticket was left unchanged.
    #[error("cannot {action} ticket {ticket_id} in state {from}")]
    InvalidTransition {
        /// Ticket acted on.
        ticket_id: TicketId,
        /// Attempted operation.
        action: &'static str,
        /// State the ticket was in.
        from: TicketState,
    },

    /// The ticket can no longer be cancelled.
    #[error("ticket {ticket_id} cannot be cancelled: {cause}")]
    NotCancellable {
        /// Ticket acted on.
        ticket_id: TicketId,
        /// What blocks the cancellation.
        cause: CancelBlock,
    },

    /// A client tried to cancel after the cancellation window closed.
    #[error("cancellation window for ticket {ticket_id} closed after {window:?}")]
    CancellationWindowExpired {
        /// Ticket acted on.
        ticket_id: TicketId,
        /// Configured window.
        window: Duration,
    },

    /// The supplied proof of ownership does not match, or none was supplied.
    #[error("invalid proof of ownership for ticket {ticket_id}")]
    InvalidProof {
        /// Ticket acted on.
        ticket_id: TicketId,
    },

    /// Another cancellation of the same ticket holds the lock.
    #[error("a cancellation of ticket {ticket_id} is already in progress")]
    AlreadyInProgress {
        /// Ticket acted on.
        ticket_id: TicketId,
    },

    /// Too many client cancellations from one source.
    #[error("too many cancellations from {source_key}: limit is {limit} per {window:?}")]
    RateLimited {
        /// Source identity that hit the limit.
        source_key: String,
        /// Allowed cancellations per window.
        limit: u32,
        /// Window length.
        window: Duration,
    },

    /// A lookup missed.
    #[error("{0} not found")]
    NotFound(Missing),

    /// The ticket number or reference could not be allocated.
    #[error("could not allocate a ticket for service {service_id}: {reason}")]
    AllocationFailure {
        /// Service asked for a ticket.
        service_id: ServiceId,
        /// Underlying failure.
        reason: String,
    },

    /// Rating outside `1..=5`.
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    /// Operating hours failed validation.
    #[error("invalid operating hours: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl QueueError {
    /// Short stable label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotCancellable { .. } => "not_cancellable",
            Self::CancellationWindowExpired { .. } => "cancellation_window_expired",
            Self::InvalidProof { .. } => "invalid_proof",
            Self::AlreadyInProgress { .. } => "already_in_progress",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::AllocationFailure { .. } => "allocation_failure",
            Self::InvalidRating(_) => "invalid_rating",
            Self::InvalidSchedule(_) => "invalid_schedule",
            Self::Storage(_) => "storage",
        }
    }
}

/// Errors reported by a [`QueueStore`](crate::store::QueueStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No service with this id.
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),

    /// No ticket with this id.
    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),

    /// A unique field clashed with an existing record.
    #[error("duplicate {field}")]
    Duplicate {
        /// `id`, `ticket_number`, `reference`, `short_code` or `security_token`.
        field: &'static str,
    },

    /// A compare-and-set write found the ticket in another state.
    #[error("ticket {ticket_id} is {actual}")]
    StateConflict {
        /// Ticket written.
        ticket_id: TicketId,
        /// State actually found.
        actual: TicketState,
    },

    /// Allocation refused because the service issued its daily maximum.
    #[error("daily limit of {limit} reached")]
    CapacityReached {
        /// Configured daily maximum.
        limit: u32,
    },

    /// The cancellation lock is held by someone else or has expired.
    #[error("cancellation lock for ticket {0} is not held")]
    LockNotHeld(TicketId),

    /// Transient backend failure; nothing was written.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Permanent backend failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether one retry is allowed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::Database("syntax".into()).is_transient());
        assert!(!StoreError::Duplicate { field: "reference" }.is_transient());
    }

    #[test]
    fn invalid_transition_display() {
        let id = TicketId::new();
        let error = QueueError::InvalidTransition {
            ticket_id: id,
            action: "start_service",
            from: TicketState::Waiting,
        };
        let display = error.to_string();
        assert!(display.contains("start_service"));
        assert!(display.contains("waiting"));
        assert!(display.contains(&id.to_string()));
        assert_eq!(error.label(), "invalid_transition");
    }

    #[test]
    fn not_found_display() {
        let error = QueueError::NotFound(Missing::Code("PAS12XY".into()));
        assert_eq!(error.to_string(), "ticket code \"PAS12XY\" not found");
    }

    #[test]
    fn store_errors_convert() {
        let error: QueueError = StoreError::Database("boom".into()).into();
        assert!(matches!(error, QueueError::Storage(StoreError::Database(_))));
    }
}
