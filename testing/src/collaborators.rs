//! Notifier and auditor doubles.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use queueline_core::environment::{
    AuditAction, AuditEntry, Auditor, Notification, Notifier, SideEffectError, SideEffectFuture,
};
use queueline_core::types::TicketId;
use std::sync::{Arc, Mutex};

/// Captures every notification.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Kinds sent so far, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(Notification::kind).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) -> SideEffectFuture<'_> {
        self.sent.lock().unwrap().push(notification);
        Box::pin(async { Ok(()) })
    }
}

/// Captures every audit entry.
#[derive(Clone, Debug, Default)]
pub struct RecordingAuditor {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl RecordingAuditor {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Actions recorded for one ticket, in order.
    #[must_use]
    pub fn actions_for(&self, ticket_id: TicketId) -> Vec<AuditAction> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.ticket_id == ticket_id)
            .map(|e| e.action)
            .collect()
    }
}

impl Auditor for RecordingAuditor {
    fn record(&self, entry: AuditEntry) -> SideEffectFuture<'_> {
        self.entries.lock().unwrap().push(entry);
        Box::pin(async { Ok(()) })
    }
}

/// Notifier and auditor that always fail.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingCollaborator;

impl Notifier for FailingCollaborator {
    fn notify(&self, notification: Notification) -> SideEffectFuture<'_> {
        let kind = notification.kind();
        Box::pin(async move { Err(SideEffectError(format!("smtp relay refused {kind}"))) })
    }
}

impl Auditor for FailingCollaborator {
    fn record(&self, _entry: AuditEntry) -> SideEffectFuture<'_> {
        Box::pin(async { Err(SideEffectError("audit log is read-only".into())) })
    }
}

/// Notifier that never completes, for exercising the side-effect timeout.
#[derive(Clone, Copy, Debug, Default)]
pub struct HangingNotifier;

impl Notifier for HangingNotifier {
    fn notify(&self, _notification: Notification) -> SideEffectFuture<'_> {
        Box::pin(std::future::pending())
    }
}
