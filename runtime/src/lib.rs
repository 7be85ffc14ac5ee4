//! # Queueline Runtime
//!
//! The ticket lifecycle engine.
//!
//! This crate turns the rules in `queueline-core` into operations over a
//! [`QueueStore`](queueline_core::store::QueueStore): numbering, code
//! generation, guarded transitions, cancellation, ranking and housekeeping.
//!
//! ## Core Components
//!
//! - **`SequenceAllocator`**: per-service ticket numbers, atomic in the store
//! - **`ReferenceCodec`**: reference, short code and security token, plus lookup
//! - **`TicketStateMachine`**: creation and staff transitions as compare-and-set writes
//! - **`CancellationCoordinator`**: the one cancellation pipeline, with rate limiting
//!   and a per-ticket lease
//! - **`QueueRanker`**: tiered FIFO positions and linear wait estimates
//! - **`QueueEngine`**: the facade, with queue snapshots and statistics
//! - **`Housekeeper`**: call-timeout sweep and daily reset on an interval
//!
//! ## Example
//!
//! ```ignore
//! use queueline_runtime::{CancelRequest, EngineConfig, QueueEngine};
//! use queueline_core::types::{Priority, Service};
//!
//! let engine = QueueEngine::builder(store).config(EngineConfig::from_env()).build();
//! let service = engine.register_service(Service::new("Passports", "PAS")).await?;
//!
//! let ticket = engine.create_ticket(service.id, Priority::Normal, None).await?;
//! let status = engine.ticket_status(&ticket.short_code).await?;
//!
//! let request = CancelRequest::client("203.0.113.9").with_proof(ticket.security_token.clone());
//! engine.cancel(ticket.id, request).await?;
//! ```

/// Cancellation pipeline
pub mod cancellation;

/// Environment-driven configuration
pub mod config;

/// The engine facade
pub mod engine;

/// Best-effort notifier and auditor dispatch
pub mod hooks;

/// Ticket creation and staff transitions
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Queue positions and wait estimates
pub mod ranking;

/// Per-source rate limiting
pub mod rate_limit;

/// Ticket codes
pub mod reference;

/// Retry logic with exponential backoff
pub mod retry;

/// Ticket number allocation
pub mod sequence;

/// Periodic housekeeping
pub mod sweep;

pub use cancellation::{BulkCancelReport, CancelRequest, CancellationCoordinator, CancellationPolicy};
pub use config::EngineConfig;
pub use engine::{
    CancellationStats, QueueEngine, QueueEngineBuilder, QueueEntry, QueueStatus, ServiceStatistics, SweepReport,
    TicketStatus,
};
pub use lifecycle::TicketStateMachine;
pub use ranking::QueueRanker;
pub use reference::{ReferenceCodec, TicketCodes};
pub use retry::RetryPolicy;
pub use sequence::SequenceAllocator;
pub use sweep::{Housekeeper, TickOutcome};
