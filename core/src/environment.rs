//! Injected dependencies: time and the two best-effort collaborators.
//!
//! All external dependencies are abstracted behind traits so the engine can be
//! driven by a fixed clock and recording collaborators in tests.

use crate::types::{Actor, ServiceId, Ticket, TicketId, TicketState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Clock trait - abstracts time operations for testability
///
/// # Examples
///
/// ```
/// use queueline_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let _now = clock.now();
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Failure reported by a notifier or auditor. Logged, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SideEffectError(pub String);

/// Future returned by the collaborator traits.
pub type SideEffectFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SideEffectError>> + Send + 'a>>;

/// Messages for the customer-facing notifier (email, SMS, push).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// The ticket was called to a counter.
    TicketCalled {
        /// Ticket after the call.
        ticket: Box<Ticket>,
    },
    /// The ticket was cancelled.
    TicketCancelled {
        /// Ticket after the cancellation.
        ticket: Box<Ticket>,
    },
    /// Service completed; ask for a rating.
    FeedbackRequested {
        /// Ticket after completion.
        ticket: Box<Ticket>,
    },
}

impl Notification {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TicketCalled { .. } => "ticket_called",
            Self::TicketCancelled { .. } => "ticket_cancelled",
            Self::FeedbackRequested { .. } => "feedback_requested",
        }
    }

    /// Ticket the notification is about.
    #[must_use]
    pub fn ticket(&self) -> &Ticket {
        match self {
            Self::TicketCalled { ticket }
            | Self::TicketCancelled { ticket }
            | Self::FeedbackRequested { ticket } => ticket,
        }
    }
}

/// Delivers notifications. Failures never roll back the triggering change.
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    ///
    /// # Errors
    ///
    /// Returns [`SideEffectError`] if delivery failed.
    fn notify(&self, notification: Notification) -> SideEffectFuture<'_>;
}

/// What happened to a ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Ticket issued.
    Created,
    /// Called to a counter.
    Called,
    /// Service started.
    ServiceStarted,
    /// Service completed.
    Served,
    /// Customer did not show up.
    NoShow,
    /// Cancelled.
    Cancelled,
    /// Feedback recorded.
    FeedbackSubmitted,
}

/// One row of the append-only ticket history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Ticket concerned.
    pub ticket_id: TicketId,
    /// Its service.
    pub service_id: ServiceId,
    /// What happened.
    pub action: AuditAction,
    /// State before, `None` on creation.
    pub from: Option<TicketState>,
    /// State after.
    pub to: TicketState,
    /// Who did it, when known.
    pub actor: Option<Actor>,
    /// Free-form detail such as a cancellation reason.
    pub detail: Option<String>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry for `ticket` in its current state.
    #[must_use]
    pub fn for_ticket(ticket: &Ticket, action: AuditAction, from: Option<TicketState>, at: DateTime<Utc>) -> Self {
        Self {
            ticket_id: ticket.id,
            service_id: ticket.service_id,
            action,
            from,
            to: ticket.state,
            actor: None,
            detail: None,
            at,
        }
    }

    /// Attach the actor.
    #[must_use]
    pub fn by(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Attach a detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

/// Appends to the ticket history. Failures never roll back the triggering change.
pub trait Auditor: Send + Sync {
    /// Record one entry.
    ///
    /// # Errors
    ///
    /// Returns [`SideEffectError`] if the entry could not be written.
    fn record(&self, entry: AuditEntry) -> SideEffectFuture<'_>;
}

/// Notifier that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) -> SideEffectFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// Auditor that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditor;

impl Auditor for NoopAuditor {
    fn record(&self, _entry: AuditEntry) -> SideEffectFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}
