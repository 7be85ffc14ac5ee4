//! Ticket creation and staff transitions.
//!
//! Every transition is a compare-and-set against the state the guard was
//! checked on, so two terminals acting on one ticket cannot both win and a
//! rejected transition never writes anything. Cancellation goes through
//! [`CancellationCoordinator`](crate::cancellation::CancellationCoordinator).

use crate::hooks::SideEffects;
use crate::metrics::{AllocationMetrics, TransitionMetrics};
use crate::reference::{ReferenceCodec, TicketCodes};
use crate::retry::{RetryPolicy, retry_transient};
use crate::sequence::SequenceAllocator;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Utc};
use queueline_core::environment::{AuditAction, AuditEntry, Clock, Notification};
use queueline_core::error::{Missing, QueueError, StoreError};
use queueline_core::store::QueueStore;
use queueline_core::transition::Transition;
use queueline_core::types::{
    ContactInfo, Feedback, Priority, Rating, Service, ServiceId, Ticket, TicketId, TicketState,
};
use std::sync::Arc;
use std::time::Instant;

/// Short code or token regenerations when an insert loses a race on them.
const INSERT_ATTEMPTS: u32 = 5;

/// Issues tickets and applies staff transitions.
#[derive(Clone)]
pub struct TicketStateMachine {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    allocator: SequenceAllocator,
    codec: Arc<ReferenceCodec>,
    effects: SideEffects,
    retry: RetryPolicy,
    offset: FixedOffset,
}

impl TicketStateMachine {
    /// Wire the state machine to its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        codec: Arc<ReferenceCodec>,
        effects: SideEffects,
        retry: RetryPolicy,
        offset: FixedOffset,
    ) -> Self {
        Self {
            allocator: SequenceAllocator::new(Arc::clone(&store), retry.clone()),
            store,
            clock,
            codec,
            effects,
            retry,
            offset,
        }
    }

    /// The allocator backing [`create`](Self::create).
    #[must_use]
    pub const fn allocator(&self) -> &SequenceAllocator {
        &self.allocator
    }

    fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.offset).naive_local()
    }

    /// Issue a waiting ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    /// - [`QueueError::ServiceUnavailable`] when closed, outside hours or on a break
    /// - [`QueueError::CapacityExceeded`] when the daily limit is reached
    /// - [`QueueError::AllocationFailure`] when numbering or code generation fails
    pub async fn create(
        &self,
        service_id: ServiceId,
        priority: Priority,
        contact: Option<ContactInfo>,
    ) -> Result<Ticket, QueueError> {
        let started = Instant::now();
        let result = self.issue(service_id, priority, contact.unwrap_or_default()).await;
        match &result {
            Ok(ticket) => {
                AllocationMetrics::record_issued(started.elapsed());
                tracing::info!(
                    ticket_id = %ticket.id,
                    %service_id,
                    ticket_number = ticket.ticket_number,
                    reference = %ticket.reference,
                    priority = %ticket.priority,
                    "ticket_created"
                );
                self.effects
                    .audit(AuditEntry::for_ticket(ticket, AuditAction::Created, None, ticket.created_at))
                    .await;
            }
            Err(QueueError::AllocationFailure { reason, .. }) => {
                AllocationMetrics::record_failure();
                tracing::error!(%service_id, %reason, "ticket_allocation_failed");
            }
            Err(error) => tracing::debug!(%service_id, %error, "ticket_refused"),
        }
        result
    }

    async fn issue(&self, service_id: ServiceId, priority: Priority, contact: ContactInfo) -> Result<Ticket, QueueError> {
        let service = self
            .store
            .service(service_id)
            .await?
            .ok_or(QueueError::NotFound(Missing::Service(service_id)))?;

        let now = self.clock.now();
        let local = self.local(now);
        let availability = service.availability(local);
        if !availability.is_open() {
            return Err(QueueError::ServiceUnavailable {
                service_id,
                availability,
            });
        }

        let allocation = self.allocator.allocate(service_id, local.date()).await?;
        let number = allocation.ticket_number;
        let mut id = TicketId::new();
        let mut codes = self.codec.generate(&service, id, number, now, local.year()).await?;
        let mut reference_clashes = 0;
        let mut code_clashes = 0;

        loop {
            let ticket = Self::draft(&service, id, number, priority, contact.clone(), now, codes.clone());
            match retry_transient(&self.retry, "insert_ticket", || self.store.insert_ticket(ticket.clone())).await {
                Ok(()) => return Ok(ticket),
                // A concurrent create took the same sequence; stay on it and suffix.
                Err(StoreError::Duplicate { field: "reference" }) if reference_clashes < self.codec.reference_attempts() => {
                    reference_clashes += 1;
                    tracing::warn!(%service_id, reference = %codes.reference, attempt = reference_clashes, "ticket_reference_collision");
                    codes.reference = self.codec.suffixed_reference(&service, &codes.reference).await?;
                    codes.security_token = self.codec.security_token(id, &codes.reference, now, service_id);
                }
                Err(StoreError::Duplicate {
                    field: field @ ("short_code" | "security_token"),
                }) if code_clashes < INSERT_ATTEMPTS => {
                    code_clashes += 1;
                    tracing::warn!(%service_id, field, attempt = code_clashes, "ticket_code_collision");
                    if field == "short_code" {
                        codes.short_code = self.codec.short_code(&service, number).await?;
                    } else {
                        id = TicketId::new();
                        codes.security_token = self.codec.security_token(id, &codes.reference, now, service_id);
                    }
                }
                Err(StoreError::Duplicate { field }) => {
                    return Err(QueueError::AllocationFailure {
                        service_id,
                        reason: format!("{field} kept colliding for ticket {number}"),
                    });
                }
                Err(StoreError::ServiceNotFound(id)) => return Err(QueueError::NotFound(Missing::Service(id))),
                Err(other) => {
                    return Err(QueueError::AllocationFailure {
                        service_id,
                        reason: other.to_string(),
                    });
                }
            }
        }
    }

    fn draft(
        service: &Service,
        id: TicketId,
        ticket_number: u64,
        priority: Priority,
        contact: ContactInfo,
        created_at: DateTime<Utc>,
        codes: TicketCodes,
    ) -> Ticket {
        Ticket {
            id,
            service_id: service.id,
            ticket_number,
            reference: codes.reference,
            short_code: codes.short_code,
            security_token: codes.security_token,
            priority,
            state: TicketState::Waiting,
            contact,
            created_at,
            called_at: None,
            served_at: None,
            completed_at: None,
            cancellation: None,
            feedback: None,
        }
    }

    /// Apply a staff transition.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::InvalidTransition`] when the guard fails; nothing is written
    /// - [`QueueError::Storage`] for backend failures
    pub async fn transition(&self, ticket_id: TicketId, transition: Transition) -> Result<Ticket, QueueError> {
        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or(QueueError::NotFound(Missing::Ticket(ticket_id)))?;
        self.transition_from(ticket_id, ticket.state, transition).await
    }

    /// Apply a staff transition to a ticket last seen in `expected`.
    ///
    /// # Errors
    ///
    /// Same as [`transition`](Self::transition).
    pub async fn transition_from(
        &self,
        ticket_id: TicketId,
        expected: TicketState,
        transition: Transition,
    ) -> Result<Ticket, QueueError> {
        let mut expected = expected;
        loop {
            if !transition.allowed_from(expected) {
                return Err(Self::rejected(ticket_id, transition, expected));
            }
            let at = self.clock.now();
            match self.store.transition_ticket(ticket_id, expected, transition, at).await {
                Ok(ticket) => {
                    self.after_transition(&ticket, expected, transition, at).await;
                    return Ok(ticket);
                }
                // Someone else moved the ticket between our read and the write;
                // re-check the guard against what is actually stored.
                Err(StoreError::StateConflict { actual, .. }) if actual != expected => expected = actual,
                Err(StoreError::StateConflict { actual, .. }) => {
                    return Err(Self::rejected(ticket_id, transition, actual));
                }
                Err(StoreError::TicketNotFound(id)) => return Err(QueueError::NotFound(Missing::Ticket(id))),
                Err(other) => return Err(other.into()),
            }
        }
    }

    fn rejected(ticket_id: TicketId, transition: Transition, from: TicketState) -> QueueError {
        TransitionMetrics::record_rejected(transition.name());
        tracing::debug!(%ticket_id, transition = transition.name(), %from, "transition_rejected");
        QueueError::InvalidTransition {
            ticket_id,
            action: transition.name(),
            from,
        }
    }

    async fn after_transition(&self, ticket: &Ticket, from: TicketState, transition: Transition, at: DateTime<Utc>) {
        TransitionMetrics::record_applied(transition.name());
        tracing::info!(
            ticket_id = %ticket.id,
            service_id = %ticket.service_id,
            transition = transition.name(),
            %from,
            to = %ticket.state,
            "ticket_transitioned"
        );

        let action = match transition {
            Transition::Call => AuditAction::Called,
            Transition::StartService => AuditAction::ServiceStarted,
            Transition::CompleteService => AuditAction::Served,
            Transition::MarkNoShow => AuditAction::NoShow,
        };
        self.effects
            .audit(AuditEntry::for_ticket(ticket, action, Some(from), at))
            .await;

        match transition {
            Transition::Call => {
                self.effects
                    .notify(Notification::TicketCalled {
                        ticket: Box::new(ticket.clone()),
                    })
                    .await;
            }
            Transition::CompleteService => {
                self.effects
                    .notify(Notification::FeedbackRequested {
                        ticket: Box::new(ticket.clone()),
                    })
                    .await;
            }
            Transition::StartService | Transition::MarkNoShow => {}
        }
    }

    /// Record a 1-5 rating on a served ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidRating`] outside `1..=5`
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::InvalidTransition`] unless the ticket is served
    pub async fn submit_feedback(
        &self,
        ticket_id: TicketId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Ticket, QueueError> {
        let rating = Rating::new(rating).ok_or(QueueError::InvalidRating(rating))?;
        let at = self.clock.now();
        let feedback = Feedback {
            rating,
            comment: comment.filter(|c| !c.trim().is_empty()),
            submitted_at: at,
        };

        let ticket = self
            .store
            .record_feedback(ticket_id, feedback)
            .await
            .map_err(|error| match error {
                StoreError::TicketNotFound(id) => QueueError::NotFound(Missing::Ticket(id)),
                StoreError::StateConflict { ticket_id, actual } => QueueError::InvalidTransition {
                    ticket_id,
                    action: "submit_feedback",
                    from: actual,
                },
                other => QueueError::Storage(other),
            })?;

        tracing::info!(%ticket_id, rating = rating.value(), "feedback_submitted");
        self.effects
            .audit(
                AuditEntry::for_ticket(&ticket, AuditAction::FeedbackSubmitted, Some(TicketState::Served), at)
                    .with_detail(Some(format!("rating={}", rating.value()))),
            )
            .await;
        Ok(ticket)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use queueline_testing::fixtures::open_service;
    use queueline_testing::mocks::ManualClock;
    use queueline_testing::{InMemoryQueueStore, RecordingAuditor, RecordingNotifier};
    use std::time::Duration;

    struct Harness {
        store: InMemoryQueueStore,
        clock: ManualClock,
        notifier: RecordingNotifier,
        auditor: RecordingAuditor,
        machine: TicketStateMachine,
    }

    fn harness() -> Harness {
        let store = InMemoryQueueStore::new();
        let clock = ManualClock::at_test_time();
        let notifier = RecordingNotifier::new();
        let auditor = RecordingAuditor::new();
        let shared: Arc<dyn QueueStore> = Arc::new(store.clone());
        let codec = Arc::new(ReferenceCodec::new(Arc::clone(&shared), "secret", 10, 10).with_seed(1));
        let effects = SideEffects::new(Arc::new(notifier.clone()), Arc::new(auditor.clone()), Duration::from_secs(1));
        let machine = TicketStateMachine::new(
            shared,
            Arc::new(clock.clone()),
            codec,
            effects,
            RetryPolicy::builder().initial_delay(Duration::from_millis(1)).build(),
            FixedOffset::east_opt(0).unwrap(),
        );
        Harness {
            store,
            clock,
            notifier,
            auditor,
            machine,
        }
    }

    async fn service(h: &Harness) -> Service {
        let service = open_service("Passports", "PAS");
        h.store.insert_service(service.clone()).await.unwrap();
        service
    }

    #[tokio::test]
    async fn create_issues_waiting_ticket_with_codes() {
        let h = harness();
        let service = service(&h).await;

        let ticket = h.machine.create(service.id, Priority::High, None).await.unwrap();

        assert_eq!(ticket.ticket_number, 1);
        assert_eq!(ticket.state, TicketState::Waiting);
        assert_eq!(ticket.reference.to_string(), "PAS-2025-00001");
        assert!(ticket.short_code.starts_with("PAS01"));
        assert_eq!(ticket.created_at, h.clock.now());
        assert_eq!(h.auditor.actions_for(ticket.id), vec![AuditAction::Created]);
    }

    #[tokio::test]
    async fn full_path_stamps_timestamps_in_order() {
        let h = harness();
        let service = service(&h).await;
        let ticket = h.machine.create(service.id, Priority::Normal, None).await.unwrap();

        h.clock.advance(chrono::Duration::minutes(3));
        h.machine.transition(ticket.id, Transition::Call).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        h.machine.transition(ticket.id, Transition::StartService).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(4));
        let served = h.machine.transition(ticket.id, Transition::CompleteService).await.unwrap();

        assert_eq!(served.state, TicketState::Served);
        let (called, started, done) = (served.called_at.unwrap(), served.served_at.unwrap(), served.completed_at.unwrap());
        assert!(called <= started && started <= done);
        assert_eq!(h.notifier.kinds(), vec!["ticket_called", "feedback_requested"]);
        assert_eq!(
            h.auditor.actions_for(ticket.id),
            vec![AuditAction::Created, AuditAction::Called, AuditAction::ServiceStarted, AuditAction::Served]
        );
        let service = h.store.service(service.id).await.unwrap().unwrap();
        assert_eq!(service.current_ticket_number, 1);
    }

    #[tokio::test]
    async fn terminal_states_reject_everything() {
        let h = harness();
        let service = service(&h).await;
        let ticket = h.machine.create(service.id, Priority::Normal, None).await.unwrap();
        h.machine.transition(ticket.id, Transition::Call).await.unwrap();
        let no_show = h.machine.transition(ticket.id, Transition::MarkNoShow).await.unwrap();
        assert_eq!(no_show.state, TicketState::NoShow);
        assert!(no_show.served_at.is_none());

        for transition in [Transition::Call, Transition::StartService, Transition::CompleteService, Transition::MarkNoShow] {
            let err = h.machine.transition(ticket.id, transition).await.unwrap_err();
            assert!(matches!(err, QueueError::InvalidTransition { from: TicketState::NoShow, .. }));
        }
    }

    #[tokio::test]
    async fn stale_expectation_rechecks_guard() {
        let h = harness();
        let service = service(&h).await;
        let ticket = h.machine.create(service.id, Priority::Normal, None).await.unwrap();
        h.machine.transition(ticket.id, Transition::Call).await.unwrap();

        // A terminal read the ticket while it was still waiting.
        let err = h
            .machine
            .transition_from(ticket.id, TicketState::Waiting, Transition::Call)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: TicketState::Called, .. }));

        h.machine.transition(ticket.id, Transition::StartService).await.unwrap();

        // Completion read the ticket as called; it is serving now, which is still allowed.
        let served = h
            .machine
            .transition_from(ticket.id, TicketState::Called, Transition::CompleteService)
            .await
            .unwrap();
        assert_eq!(served.state, TicketState::Served);
    }

    #[tokio::test]
    async fn feedback_only_on_served() {
        let h = harness();
        let service = service(&h).await;
        let ticket = h.machine.create(service.id, Priority::Normal, None).await.unwrap();

        let err = h.machine.submit_feedback(ticket.id, 4, None).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: TicketState::Waiting, .. }));

        h.machine.transition(ticket.id, Transition::Call).await.unwrap();
        h.machine.transition(ticket.id, Transition::CompleteService).await.unwrap();

        assert!(matches!(
            h.machine.submit_feedback(ticket.id, 6, None).await,
            Err(QueueError::InvalidRating(6))
        ));
        let rated = h
            .machine
            .submit_feedback(ticket.id, 5, Some("quick".into()))
            .await
            .unwrap();
        assert_eq!(rated.feedback.unwrap().rating.value(), 5);
    }
}
