//! # Queueline Core
//!
//! Domain types, transition rules and repository traits for the queueline
//! ticket lifecycle engine.
//!
//! ## Core Concepts
//!
//! - **Service**: a counter or desk with its own hours, capacity and ticket sequence
//! - **Ticket**: one customer's place in a service's queue
//! - **Tier**: priority class (urgent, high, normal), the primary ranking key
//! - **Reference / short code / security token**: three unique handles on the same
//!   ticket, for long-form display, QR/SMS, and proof of ownership
//!
//! This crate performs no I/O. The engine lives in `queueline-runtime`, the
//! Postgres backend in `queueline-postgres`.

pub mod environment;
pub mod error;
pub mod schedule;
pub mod store;
pub mod transition;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use environment::{AuditAction, AuditEntry, Auditor, Clock, Notification, Notifier, SystemClock};
pub use error::{CancelBlock, Missing, QueueError, StoreError};
pub use schedule::{Availability, HourWindow, OperatingHours};
pub use store::{Allocation, QueueStore, StoreFuture};
pub use transition::Transition;
pub use types::{
    Actor, CancellationRecord, ContactInfo, Feedback, Priority, Rating, Service, ServiceId, Ticket, TicketId,
    TicketReference, TicketState,
};
