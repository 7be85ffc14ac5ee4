//! The single guarded cancellation pipeline.
//!
//! Clients, staff, the system and the call-timeout sweep all cancel through
//! [`CancellationCoordinator::cancel`]:
//!
//! 1. rate limit (client requests carrying a source identity)
//! 2. validate state, client switch, client window and proof of ownership
//! 3. take the per-ticket lease; a live lease fails fast with `AlreadyInProgress`
//! 4. write the cancellation and clear the lease in one store call
//! 5. release the lease on any failure
//! 6. notify and audit, best effort
//!
//! The lease expires on its own, so a crash between steps 3 and 5 only blocks
//! the ticket for the lease lifetime.

use crate::hooks::SideEffects;
use crate::metrics::CancellationMetrics;
use crate::rate_limit::RateLimiter;
use crate::reference::ReferenceCodec;
use crate::retry::{RetryPolicy, retry_transient};
use chrono::{DateTime, Utc};
use queueline_core::environment::{AuditAction, AuditEntry, Clock, Notification};
use queueline_core::error::{CancelBlock, Missing, QueueError, StoreError};
use queueline_core::store::QueueStore;
use queueline_core::types::{Actor, CancellationRecord, Ticket, TicketId, TicketState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Who is cancelling and with what credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelRequest {
    /// Acting party.
    pub actor: Actor,
    /// Free-form reason stored on the ticket.
    pub reason: Option<String>,
    /// Security token presented as proof of ownership.
    pub proof: Option<String>,
    /// Whether the caller was authenticated by the surrounding application.
    pub authenticated: bool,
    /// Source identity for rate limiting, such as a client address.
    pub source: Option<String>,
}

impl CancelRequest {
    /// Anonymous customer request from `source`.
    #[must_use]
    pub fn client(source: impl Into<String>) -> Self {
        Self {
            actor: Actor::Client,
            reason: None,
            proof: None,
            authenticated: false,
            source: Some(source.into()),
        }
    }

    /// Staff request.
    #[must_use]
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            actor: Actor::Agent(agent_id.into()),
            reason: None,
            proof: None,
            authenticated: true,
            source: None,
        }
    }

    /// Automated request from the surrounding application.
    #[must_use]
    pub const fn system() -> Self {
        Self {
            actor: Actor::System,
            reason: None,
            proof: None,
            authenticated: true,
            source: None,
        }
    }

    /// Issued by the call-timeout sweep.
    #[must_use]
    pub const fn timeout() -> Self {
        Self {
            actor: Actor::Timeout,
            reason: None,
            proof: None,
            authenticated: true,
            source: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a proof of ownership.
    #[must_use]
    pub fn with_proof(mut self, proof: impl Into<String>) -> Self {
        self.proof = Some(proof.into());
        self
    }

    /// Mark the caller as authenticated, waiving the proof requirement.
    #[must_use]
    pub const fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }
}

/// Per-ticket outcome of a bulk cancellation.
#[derive(Debug, Default)]
pub struct BulkCancelReport {
    /// Outcome per requested ticket.
    pub results: BTreeMap<TicketId, Result<Ticket, QueueError>>,
}

impl BulkCancelReport {
    /// Tickets that were cancelled.
    #[must_use]
    pub fn succeeded(&self) -> Vec<TicketId> {
        self.results
            .iter()
            .filter_map(|(id, result)| result.is_ok().then_some(*id))
            .collect()
    }

    /// Tickets that were not cancelled, with why.
    #[must_use]
    pub fn failed(&self) -> Vec<(TicketId, &QueueError)> {
        self.results
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|e| (*id, e)))
            .collect()
    }
}

/// Policy for the pipeline.
#[derive(Clone, Debug)]
pub struct CancellationPolicy {
    /// How long after creation a client may still cancel.
    pub client_window: Duration,
    /// Whether clients may cancel at all.
    pub allow_client_cancellation: bool,
    /// Lease lifetime.
    pub lock_ttl: Duration,
}

/// Runs the cancellation pipeline.
#[derive(Clone)]
pub struct CancellationCoordinator {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    effects: SideEffects,
    retry: RetryPolicy,
    policy: CancellationPolicy,
}

impl CancellationCoordinator {
    /// Wire the coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        limiter: Arc<RateLimiter>,
        effects: SideEffects,
        retry: RetryPolicy,
        policy: CancellationPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            limiter,
            effects,
            retry,
            policy,
        }
    }

    /// Cancel one ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::RateLimited`] when the source is over its limit; the
    ///   ticket is not read
    /// - [`QueueError::NotCancellable`] when serving or terminal, or when client
    ///   cancellation is disabled
    /// - [`QueueError::CancellationWindowExpired`] for late client requests
    /// - [`QueueError::InvalidProof`] for a wrong or missing token
    /// - [`QueueError::AlreadyInProgress`] when another cancellation holds the lease
    /// - [`QueueError::Storage`] for backend failures after the single retry
    pub async fn cancel(&self, ticket_id: TicketId, request: &CancelRequest) -> Result<Ticket, QueueError> {
        let started = Instant::now();
        let now = self.clock.now();

        let rate_key = match (&request.actor, &request.source) {
            (Actor::Client, Some(source)) => Some(source.as_str()),
            _ => None,
        };
        if let Some(key) = rate_key {
            if !self.limiter.try_acquire(key, now) {
                let error = QueueError::RateLimited {
                    source_key: key.to_string(),
                    limit: self.limiter.limit(),
                    window: self.limiter.window(),
                };
                return Err(Self::refused(ticket_id, request, error));
            }
        }

        let result = self.run(ticket_id, request, now).await;
        match result {
            Ok(ticket) => {
                CancellationMetrics::record_applied(request.actor.kind(), started.elapsed());
                tracing::info!(
                    %ticket_id,
                    service_id = %ticket.service_id,
                    actor = %request.actor,
                    reason = request.reason.as_deref().unwrap_or(""),
                    "ticket_cancelled"
                );
                Ok(ticket)
            }
            Err(error) => {
                if let Some(key) = rate_key {
                    self.limiter.refund(key, now);
                }
                Err(Self::refused(ticket_id, request, error))
            }
        }
    }

    fn refused(ticket_id: TicketId, request: &CancelRequest, error: QueueError) -> QueueError {
        CancellationMetrics::record_rejected(error.label());
        tracing::debug!(%ticket_id, actor = %request.actor, %error, "cancellation_refused");
        error
    }

    async fn run(&self, ticket_id: TicketId, request: &CancelRequest, now: DateTime<Utc>) -> Result<Ticket, QueueError> {
        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or(QueueError::NotFound(Missing::Ticket(ticket_id)))?;
        self.validate(&ticket, request, now)?;

        let token = Uuid::new_v4();
        let expires_at = now + chrono::Duration::from_std(self.policy.lock_ttl).unwrap_or(chrono::Duration::MAX);
        let locked = retry_transient(&self.retry, "lock_cancellation", || {
            self.store.try_lock_cancellation(ticket_id, token, now, expires_at)
        })
        .await
        .map_err(|error| Self::map_store(ticket_id, error))?;
        if !locked {
            return Err(QueueError::AlreadyInProgress { ticket_id });
        }

        let record = CancellationRecord {
            by: request.actor.clone(),
            reason: request.reason.clone(),
            at: now,
        };
        let applied = retry_transient(&self.retry, "apply_cancellation", || {
            self.store.apply_cancellation(ticket_id, token, record.clone())
        })
        .await;

        let cancelled = match applied {
            Ok(ticket) => ticket,
            Err(error) => {
                if let Err(release) = self.store.release_cancellation(ticket_id, token).await {
                    tracing::warn!(%ticket_id, error = %release, "cancellation_release_failed");
                }
                return Err(Self::map_store(ticket_id, error));
            }
        };

        self.effects
            .notify(Notification::TicketCancelled {
                ticket: Box::new(cancelled.clone()),
            })
            .await;
        self.effects
            .audit(
                AuditEntry::for_ticket(&cancelled, AuditAction::Cancelled, Some(ticket.state), now)
                    .by(request.actor.clone())
                    .with_detail(request.reason.clone()),
            )
            .await;
        Ok(cancelled)
    }

    fn validate(&self, ticket: &Ticket, request: &CancelRequest, now: DateTime<Utc>) -> Result<(), QueueError> {
        let ticket_id = ticket.id;
        if !ticket.state.is_cancellable() {
            return Err(QueueError::NotCancellable {
                ticket_id,
                cause: CancelBlock::State(ticket.state),
            });
        }

        if request.actor == Actor::Client {
            if !self.policy.allow_client_cancellation {
                return Err(QueueError::NotCancellable {
                    ticket_id,
                    cause: CancelBlock::ClientCancellationDisabled,
                });
            }
            let elapsed = (now - ticket.created_at).to_std().unwrap_or_default();
            if elapsed > self.policy.client_window {
                return Err(QueueError::CancellationWindowExpired {
                    ticket_id,
                    window: self.policy.client_window,
                });
            }
        }

        match &request.proof {
            Some(proof) if !ReferenceCodec::verify(ticket, proof) => Err(QueueError::InvalidProof { ticket_id }),
            None if !request.authenticated => Err(QueueError::InvalidProof { ticket_id }),
            _ => Ok(()),
        }
    }

    fn map_store(ticket_id: TicketId, error: StoreError) -> QueueError {
        match error {
            StoreError::TicketNotFound(id) => QueueError::NotFound(Missing::Ticket(id)),
            StoreError::LockNotHeld(_) => QueueError::AlreadyInProgress { ticket_id },
            StoreError::StateConflict { actual, .. } => QueueError::NotCancellable {
                ticket_id,
                cause: CancelBlock::State(actual),
            },
            other => QueueError::Storage(other),
        }
    }

    /// Cancel several tickets with the same request. Not transactional: each
    /// ticket succeeds or fails on its own.
    pub async fn bulk_cancel(&self, ticket_ids: &[TicketId], request: &CancelRequest) -> BulkCancelReport {
        let mut report = BulkCancelReport::default();
        for &ticket_id in ticket_ids {
            if report.results.contains_key(&ticket_id) {
                continue;
            }
            let result = self.cancel(ticket_id, request).await;
            report.results.insert(ticket_id, result);
        }
        tracing::info!(
            requested = ticket_ids.len(),
            succeeded = report.succeeded().len(),
            "bulk_cancel_finished"
        );
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use queueline_testing::fixtures::{open_service, waiting_ticket};
    use queueline_testing::mocks::ManualClock;
    use queueline_testing::{InMemoryQueueStore, RecordingAuditor, RecordingNotifier};

    struct Harness {
        store: InMemoryQueueStore,
        clock: ManualClock,
        notifier: RecordingNotifier,
        auditor: RecordingAuditor,
        coordinator: CancellationCoordinator,
    }

    fn harness(allow_client_cancellation: bool) -> Harness {
        let store = InMemoryQueueStore::new();
        let clock = ManualClock::at_test_time();
        let notifier = RecordingNotifier::new();
        let auditor = RecordingAuditor::new();
        let coordinator = CancellationCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            Arc::new(RateLimiter::new(2, Duration::from_secs(600))),
            SideEffects::new(Arc::new(notifier.clone()), Arc::new(auditor.clone()), Duration::from_secs(1)),
            RetryPolicy::builder().initial_delay(Duration::from_millis(1)).build(),
            CancellationPolicy {
                client_window: Duration::from_secs(30 * 60),
                allow_client_cancellation,
                lock_ttl: Duration::from_secs(30),
            },
        );
        Harness {
            store,
            clock,
            notifier,
            auditor,
            coordinator,
        }
    }

    async fn ticket(h: &Harness, number: u64) -> Ticket {
        let service = open_service("Passports", "PAS");
        h.store.insert_service(service.clone()).await.unwrap();
        let ticket = waiting_ticket(&service, number, h.clock.now());
        h.store.insert_ticket(ticket.clone()).await.unwrap();
        ticket
    }

    #[tokio::test]
    async fn client_with_token_cancels() {
        let h = harness(true);
        let ticket = ticket(&h, 1).await;

        let request = CancelRequest::client("203.0.113.9")
            .with_proof(ticket.security_token.clone())
            .with_reason("changed plans");
        let cancelled = h.coordinator.cancel(ticket.id, &request).await.unwrap();

        assert_eq!(cancelled.state, TicketState::Cancelled);
        let record = cancelled.cancellation.unwrap();
        assert_eq!(record.by, Actor::Client);
        assert_eq!(record.reason.as_deref(), Some("changed plans"));
        assert_eq!(record.at, h.clock.now());
        assert!(!h.store.has_cancellation_lease(ticket.id));
        assert_eq!(h.notifier.kinds(), vec!["ticket_cancelled"]);
        assert_eq!(h.auditor.actions_for(ticket.id), vec![AuditAction::Cancelled]);
    }

    #[tokio::test]
    async fn anonymous_client_needs_matching_token() {
        let h = harness(true);
        let ticket = ticket(&h, 1).await;

        let missing = h.coordinator.cancel(ticket.id, &CancelRequest::client("a")).await;
        assert!(matches!(missing, Err(QueueError::InvalidProof { .. })));

        let wrong = h
            .coordinator
            .cancel(ticket.id, &CancelRequest::client("a").with_proof("guess"))
            .await;
        assert!(matches!(wrong, Err(QueueError::InvalidProof { .. })));

        let authenticated = CancelRequest::client("a").authenticated();
        assert!(h.coordinator.cancel(ticket.id, &authenticated).await.is_ok());
    }

    #[tokio::test]
    async fn late_client_cancel_leaves_ticket_waiting() {
        let h = harness(true);
        let ticket = ticket(&h, 1).await;
        h.clock.advance(chrono::Duration::minutes(35));

        let request = CancelRequest::client("a").with_proof(ticket.security_token.clone());
        let err = h.coordinator.cancel(ticket.id, &request).await.unwrap_err();

        assert!(matches!(err, QueueError::CancellationWindowExpired { .. }));
        let stored = h.store.ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TicketState::Waiting);

        // Staff are not bound by the client window.
        assert!(h.coordinator.cancel(ticket.id, &CancelRequest::agent("desk-3")).await.is_ok());
    }

    #[tokio::test]
    async fn client_switch_only_blocks_clients() {
        let h = harness(false);
        let ticket = ticket(&h, 1).await;

        let request = CancelRequest::client("a").with_proof(ticket.security_token.clone());
        let err = h.coordinator.cancel(ticket.id, &request).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::NotCancellable {
                cause: CancelBlock::ClientCancellationDisabled,
                ..
            }
        ));
        assert!(h.coordinator.cancel(ticket.id, &CancelRequest::system()).await.is_ok());
    }

    #[tokio::test]
    async fn rate_limit_counts_only_successful_cancellations() {
        let h = harness(true);
        let first = ticket(&h, 1).await;
        let second = ticket(&h, 2).await;
        let third = ticket(&h, 3).await;

        // A refused request hands its slot back.
        let bad = CancelRequest::client("198.51.100.7").with_proof("nope");
        assert!(h.coordinator.cancel(first.id, &bad).await.is_err());

        for t in [&first, &second] {
            let request = CancelRequest::client("198.51.100.7").with_proof(t.security_token.clone());
            h.coordinator.cancel(t.id, &request).await.unwrap();
        }

        let request = CancelRequest::client("198.51.100.7").with_proof(third.security_token.clone());
        let err = h.coordinator.cancel(third.id, &request).await.unwrap_err();
        assert!(matches!(err, QueueError::RateLimited { limit: 2, .. }));
        assert_eq!(h.store.ticket(third.id).await.unwrap().unwrap().state, TicketState::Waiting);
    }

    #[tokio::test]
    async fn terminal_ticket_is_not_cancellable() {
        let h = harness(true);
        let ticket = ticket(&h, 1).await;
        h.coordinator.cancel(ticket.id, &CancelRequest::system()).await.unwrap();

        let err = h.coordinator.cancel(ticket.id, &CancelRequest::system()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::NotCancellable {
                cause: CancelBlock::State(TicketState::Cancelled),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn live_lease_fails_fast() {
        let h = harness(true);
        let ticket = ticket(&h, 1).await;
        let now = h.clock.now();
        h.store
            .try_lock_cancellation(ticket.id, Uuid::new_v4(), now, now + chrono::Duration::seconds(30))
            .await
            .unwrap();

        let err = h.coordinator.cancel(ticket.id, &CancelRequest::system()).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyInProgress { .. }));

        // An abandoned lease stops blocking once it expires.
        h.clock.advance(chrono::Duration::seconds(31));
        assert!(h.coordinator.cancel(ticket.id, &CancelRequest::system()).await.is_ok());
    }

    #[tokio::test]
    async fn transient_apply_failure_is_retried_once() {
        let h = harness(true);
        let ticket = ticket(&h, 1).await;

        h.store.fail_next_cancellations(1);
        assert!(h.coordinator.cancel(ticket.id, &CancelRequest::system()).await.is_ok());

        let other = self::ticket(&h, 2).await;
        h.store.fail_next_cancellations(2);
        let err = h.coordinator.cancel(other.id, &CancelRequest::system()).await.unwrap_err();
        assert!(matches!(err, QueueError::Storage(StoreError::Unavailable(_))));
        assert!(!h.store.has_cancellation_lease(other.id));
        assert_eq!(h.store.ticket(other.id).await.unwrap().unwrap().state, TicketState::Waiting);
    }

    #[tokio::test]
    async fn bulk_cancel_reports_per_ticket() {
        let h = harness(true);
        let waiting = ticket(&h, 1).await;
        let done = ticket(&h, 2).await;
        h.coordinator.cancel(done.id, &CancelRequest::system()).await.unwrap();
        let unknown = TicketId::new();

        let report = h
            .coordinator
            .bulk_cancel(&[waiting.id, done.id, unknown], &CancelRequest::agent("desk-1").with_reason("closing"))
            .await;

        assert_eq!(report.succeeded(), vec![waiting.id]);
        assert_eq!(report.failed().len(), 2);
        assert!(matches!(report.results[&unknown], Err(QueueError::NotFound(Missing::Ticket(_)))));
    }
}
