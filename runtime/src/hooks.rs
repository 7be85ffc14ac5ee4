//! Best-effort dispatch to the notifier and auditor.
//!
//! Both collaborators run after the state change is durable. A failure or a
//! timeout is logged and counted; it never reaches the caller.

use crate::metrics::SideEffectMetrics;
use queueline_core::environment::{AuditEntry, Auditor, NoopAuditor, NoopNotifier, Notification, Notifier};
use std::sync::Arc;
use std::time::Duration;

/// Holds the collaborators and the per-call time budget.
#[derive(Clone)]
pub struct SideEffects {
    notifier: Arc<dyn Notifier>,
    auditor: Arc<dyn Auditor>,
    timeout: Duration,
}

impl std::fmt::Debug for SideEffects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffects").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

impl SideEffects {
    /// Wrap the given collaborators.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, auditor: Arc<dyn Auditor>, timeout: Duration) -> Self {
        Self {
            notifier,
            auditor,
            timeout,
        }
    }

    /// Collaborators that do nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopNotifier), Arc::new(NoopAuditor), Duration::from_secs(1))
    }

    /// Send a notification, swallowing failures.
    pub async fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        let ticket_id = notification.ticket().id;
        match tokio::time::timeout(self.timeout, self.notifier.notify(notification)).await {
            Ok(Ok(())) => tracing::debug!(%ticket_id, kind, "notification_sent"),
            Ok(Err(error)) => {
                SideEffectMetrics::record_failure("notifier");
                tracing::warn!(%ticket_id, kind, %error, "notification_failed");
            }
            Err(_) => {
                SideEffectMetrics::record_failure("notifier");
                tracing::warn!(%ticket_id, kind, timeout_ms = self.timeout_ms(), "notification_timed_out");
            }
        }
    }

    /// Append an audit entry, swallowing failures.
    pub async fn audit(&self, entry: AuditEntry) {
        let ticket_id = entry.ticket_id;
        let action = entry.action;
        match tokio::time::timeout(self.timeout, self.auditor.record(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                SideEffectMetrics::record_failure("auditor");
                tracing::warn!(%ticket_id, ?action, %error, "audit_failed");
            }
            Err(_) => {
                SideEffectMetrics::record_failure("auditor");
                tracing::warn!(%ticket_id, ?action, timeout_ms = self.timeout_ms(), "audit_timed_out");
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}
