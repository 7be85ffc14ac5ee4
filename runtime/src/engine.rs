//! `QueueEngine`: the facade the surrounding application calls.
//!
//! The engine owns no state of its own beyond the in-process rate limiter;
//! everything durable lives behind the [`QueueStore`]. It is cheap to share in an
//! `Arc` across request handlers.

use crate::cancellation::{BulkCancelReport, CancelRequest, CancellationCoordinator, CancellationPolicy};
use crate::config::EngineConfig;
use crate::hooks::SideEffects;
use crate::lifecycle::TicketStateMachine;
use crate::metrics::{QueueMetrics, SweepMetrics};
use crate::ranking::{QueueRanker, estimated_wait, sort_by_rank};
use crate::rate_limit::RateLimiter;
use crate::reference::ReferenceCodec;
use crate::retry::RetryPolicy;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use queueline_core::environment::{Auditor, Clock, NoopAuditor, NoopNotifier, Notifier, SystemClock};
use queueline_core::error::{Missing, QueueError, StoreError};
use queueline_core::schedule::Availability;
use queueline_core::store::QueueStore;
use queueline_core::transition::Transition;
use queueline_core::types::{ContactInfo, Priority, Service, ServiceId, Ticket, TicketId, TicketState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// What a customer sees when checking a ticket.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TicketStatus {
    /// The ticket.
    pub ticket: Ticket,
    /// 1-based position, 0 once no longer waiting.
    pub position: usize,
    /// Minutes until called, while waiting.
    pub estimated_wait_minutes: Option<u64>,
    /// Number most recently called at the ticket's service.
    pub current_ticket_number: u64,
}

/// One row of a queue snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    /// Ticket id.
    pub ticket_id: TicketId,
    /// Ticket number.
    pub ticket_number: u64,
    /// Short code shown on the display board.
    pub short_code: String,
    /// Tier.
    pub priority: Priority,
    /// 1-based position.
    pub position: usize,
    /// Estimated minutes until called.
    pub estimated_wait_minutes: u64,
}

/// Snapshot of one service's queue.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Service.
    pub service_id: ServiceId,
    /// Display name.
    pub name: String,
    /// Administrative switch.
    pub is_open: bool,
    /// Whether tickets can be taken right now, and if not why.
    pub availability: Availability,
    /// Number most recently called.
    pub current_ticket_number: u64,
    /// Tickets waiting.
    pub waiting_count: usize,
    /// Tickets called but not yet at the counter.
    pub called_count: usize,
    /// Tickets being served.
    pub serving_count: usize,
    /// The first waiting tickets in calling order.
    pub next_up: Vec<QueueEntry>,
    /// Mean estimated wait across all waiting tickets, in minutes.
    pub average_wait_minutes: f64,
}

/// Cancellations in a time range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CancellationStats {
    /// All cancellations.
    pub total: u64,
    /// Per actor kind (`client`, `agent`, `system`, `timeout`).
    pub by_actor: BTreeMap<&'static str, u64>,
    /// Per service.
    pub by_service: BTreeMap<ServiceId, u64>,
}

/// Activity of one service over a period, by ticket creation time.
///
/// Waiting and service averages cover served tickets only; a ticket that never
/// reached the counter has no service time to contribute.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServiceStatistics {
    /// Tickets created in the period.
    pub total: u64,
    /// Still waiting.
    pub waiting: u64,
    /// Called and not yet at the counter.
    pub called: u64,
    /// At the counter.
    pub serving: u64,
    /// Served.
    pub served: u64,
    /// Cancelled by anyone.
    pub cancelled: u64,
    /// Called but never showed up.
    pub no_show: u64,
    /// Mean minutes from creation to call, over served tickets.
    pub average_waiting_minutes: f64,
    /// Mean minutes at the counter, over served tickets.
    pub average_service_minutes: f64,
    /// Mean feedback rating, if any ticket was rated.
    pub average_rating: Option<f64>,
    /// Share of tickets served, as a percentage.
    pub served_percent: f64,
}

impl ServiceStatistics {
    /// Aggregate `tickets`; `now` closes the open intervals of unfinished tickets.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_tickets(tickets: &[Ticket], now: DateTime<Utc>) -> Self {
        let mut stats = Self::default();
        let (mut waited, mut served_for) = (0.0, 0.0);
        let mut ratings = Vec::new();

        for ticket in tickets {
            stats.total += 1;
            match ticket.state {
                TicketState::Waiting => stats.waiting += 1,
                TicketState::Called => stats.called += 1,
                TicketState::Serving => stats.serving += 1,
                TicketState::Served => {
                    stats.served += 1;
                    waited += ticket.waiting_minutes(now);
                    served_for += ticket.service_minutes(now);
                }
                TicketState::Cancelled => stats.cancelled += 1,
                TicketState::NoShow => stats.no_show += 1,
            }
            if let Some(feedback) = &ticket.feedback {
                ratings.push(f64::from(feedback.rating.value()));
            }
        }

        if stats.served > 0 {
            let served = stats.served as f64;
            stats.average_waiting_minutes = waited / served;
            stats.average_service_minutes = served_for / served;
            stats.served_percent = served / stats.total as f64 * 100.0;
        }
        if !ratings.is_empty() {
            stats.average_rating = Some(ratings.iter().sum::<f64>() / ratings.len() as f64);
        }
        stats
    }
}

/// Outcome of one call-timeout sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Called tickets past the timeout.
    pub examined: usize,
    /// Tickets cancelled with actor `timeout`.
    pub cancelled: Vec<TicketId>,
    /// Tickets left alone, usually because staff acted first.
    pub skipped: Vec<(TicketId, QueueError)>,
}

/// Builder for [`QueueEngine`].
pub struct QueueEngineBuilder {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    auditor: Arc<dyn Auditor>,
    config: EngineConfig,
    rng_seed: Option<u64>,
}

impl QueueEngineBuilder {
    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver notifications through `notifier`.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Record history through `auditor`.
    #[must_use]
    pub fn auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = auditor;
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed the code generator for reproducible short codes.
    #[must_use]
    pub const fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Assemble the engine.
    #[must_use]
    pub fn build(self) -> QueueEngine {
        let config = self.config;
        let retry = RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(config.retry_delay_ms))
            .build();
        let effects = SideEffects::new(self.notifier, self.auditor, config.side_effect_timeout());
        let offset = config.local_offset();

        let mut codec = ReferenceCodec::new(
            Arc::clone(&self.store),
            config.token_secret.clone(),
            config.short_code_attempts,
            config.reference_attempts,
        );
        if let Some(seed) = self.rng_seed {
            codec = codec.with_seed(seed);
        }
        let codec = Arc::new(codec);

        let lifecycle = TicketStateMachine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&codec),
            effects.clone(),
            retry.clone(),
            offset,
        );
        let limiter = Arc::new(RateLimiter::new(
            config.cancellation_rate_limit,
            config.cancellation_rate_window(),
        ));
        let cancellation = CancellationCoordinator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&limiter),
            effects,
            retry,
            CancellationPolicy {
                client_window: config.client_cancellation_window(),
                allow_client_cancellation: config.allow_client_cancellation,
                lock_ttl: config.cancellation_lock_ttl(),
            },
        );

        QueueEngine {
            ranker: QueueRanker::new(Arc::clone(&self.store)),
            store: self.store,
            clock: self.clock,
            codec,
            lifecycle,
            cancellation,
            limiter,
            offset,
            config,
        }
    }
}

/// Ticket lifecycle engine.
///
/// # Example
///
/// ```ignore
/// let engine = QueueEngine::builder(Arc::new(store)).config(EngineConfig::from_env()).build();
/// let service = engine.register_service(Service::new("Passports", "PAS")).await?;
/// let ticket = engine.create_ticket(service.id, Priority::Normal, None).await?;
/// let called = engine.call_next(service.id).await?;
/// ```
pub struct QueueEngine {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    codec: Arc<ReferenceCodec>,
    lifecycle: TicketStateMachine,
    cancellation: CancellationCoordinator,
    limiter: Arc<RateLimiter>,
    ranker: QueueRanker,
    offset: FixedOffset,
    config: EngineConfig,
}

impl QueueEngine {
    /// Start building an engine over `store` with default collaborators.
    #[must_use]
    pub fn builder(store: Arc<dyn QueueStore>) -> QueueEngineBuilder {
        QueueEngineBuilder {
            store,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(NoopNotifier),
            auditor: Arc::new(NoopAuditor),
            config: EngineConfig::default(),
            rng_seed: None,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current local time.
    #[must_use]
    pub fn local_now(&self) -> NaiveDateTime {
        self.clock.now().with_timezone(&self.offset).naive_local()
    }

    // ---------------------------------------------------------------------
    // Services
    // ---------------------------------------------------------------------

    /// Register a service after validating its hours.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidSchedule`] for inconsistent hours
    /// - [`QueueError::Storage`] for a duplicate id or backend failure
    #[tracing::instrument(skip_all, fields(service_id = %service.id, prefix = %service.ticket_prefix))]
    pub async fn register_service(&self, service: Service) -> Result<Service, QueueError> {
        service.hours.validate()?;
        self.store.insert_service(service.clone()).await?;
        tracing::info!(name = %service.name, "service_registered");
        Ok(service)
    }

    /// Open or close a service for new tickets.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    #[tracing::instrument(skip(self))]
    pub async fn set_service_open(&self, service_id: ServiceId, open: bool) -> Result<(), QueueError> {
        self.store
            .set_service_open(service_id, open)
            .await
            .map_err(|error| match error {
                StoreError::ServiceNotFound(id) => QueueError::NotFound(Missing::Service(id)),
                other => QueueError::Storage(other),
            })?;
        tracing::info!(open, "service_open_changed");
        Ok(())
    }

    /// Load a service.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    pub async fn service(&self, service_id: ServiceId) -> Result<Service, QueueError> {
        self.store
            .service(service_id)
            .await?
            .ok_or(QueueError::NotFound(Missing::Service(service_id)))
    }

    /// Repair a service's ticket counter from persisted tickets.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    #[tracing::instrument(skip(self))]
    pub async fn resync_counter(&self, service_id: ServiceId) -> Result<u64, QueueError> {
        self.lifecycle.allocator().resync(service_id).await
    }

    /// Reset every service's current ticket display to zero.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Storage`] for backend failures
    #[tracing::instrument(skip(self))]
    pub async fn reset_daily_counters(&self) -> Result<u64, QueueError> {
        let services = self.store.reset_current_ticket_numbers().await?;
        tracing::info!(services, "daily_counters_reset");
        Ok(services)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Issue a ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    /// - [`QueueError::ServiceUnavailable`] when closed, outside hours or on a break
    /// - [`QueueError::CapacityExceeded`] when the daily limit is reached
    /// - [`QueueError::AllocationFailure`] when numbering or code generation fails
    #[tracing::instrument(skip(self, contact))]
    pub async fn create_ticket(
        &self,
        service_id: ServiceId,
        priority: Priority,
        contact: Option<ContactInfo>,
    ) -> Result<Ticket, QueueError> {
        self.lifecycle.create(service_id, priority, contact).await
    }

    /// Call a specific waiting ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::InvalidTransition`] unless the ticket is waiting
    #[tracing::instrument(skip(self))]
    pub async fn call(&self, ticket_id: TicketId) -> Result<Ticket, QueueError> {
        self.lifecycle.transition(ticket_id, Transition::Call).await
    }

    /// Call the highest-ranked waiting ticket, or return `None` for an empty queue.
    ///
    /// When another terminal calls the same ticket first, the next one is tried.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidTransition`] if every attempt lost a race
    /// - [`QueueError::Storage`] for backend failures
    #[tracing::instrument(skip(self))]
    pub async fn call_next(&self, service_id: ServiceId) -> Result<Option<Ticket>, QueueError> {
        let attempts = self.config.call_next_attempts.max(1);
        let mut last_race = None;
        for attempt in 1..=attempts {
            let Some(next) = self.ranker.next_to_call(service_id).await? else {
                return Ok(None);
            };
            match self
                .lifecycle
                .transition_from(next.id, TicketState::Waiting, Transition::Call)
                .await
            {
                Ok(ticket) => return Ok(Some(ticket)),
                Err(error @ QueueError::InvalidTransition { .. }) => {
                    tracing::debug!(ticket_id = %next.id, attempt, "call_next_lost_race");
                    last_race = Some(error);
                }
                Err(other) => return Err(other),
            }
        }
        match last_race {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }

    /// Move a called ticket to the counter.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::InvalidTransition`] unless the ticket is called
    #[tracing::instrument(skip(self))]
    pub async fn start_service(&self, ticket_id: TicketId) -> Result<Ticket, QueueError> {
        self.lifecycle.transition(ticket_id, Transition::StartService).await
    }

    /// Finish serving a called or serving ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::InvalidTransition`] unless the ticket is called or serving
    #[tracing::instrument(skip(self))]
    pub async fn complete_service(&self, ticket_id: TicketId) -> Result<Ticket, QueueError> {
        self.lifecycle.transition(ticket_id, Transition::CompleteService).await
    }

    /// Record that a called customer did not show up.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    /// - [`QueueError::InvalidTransition`] unless the ticket is called
    #[tracing::instrument(skip(self))]
    pub async fn mark_no_show(&self, ticket_id: TicketId) -> Result<Ticket, QueueError> {
        self.lifecycle.transition(ticket_id, Transition::MarkNoShow).await
    }

    /// Cancel a ticket through the guarded pipeline.
    ///
    /// # Errors
    ///
    /// See [`CancellationCoordinator::cancel`].
    #[tracing::instrument(skip(self, request), fields(actor = %request.actor))]
    pub async fn cancel(&self, ticket_id: TicketId, request: CancelRequest) -> Result<Ticket, QueueError> {
        self.cancellation.cancel(ticket_id, &request).await
    }

    /// Cancel many tickets, reporting each outcome.
    #[tracing::instrument(skip_all, fields(count = ticket_ids.len(), actor = %request.actor))]
    pub async fn bulk_cancel(&self, ticket_ids: &[TicketId], request: CancelRequest) -> BulkCancelReport {
        self.cancellation.bulk_cancel(ticket_ids, &request).await
    }

    /// Rate a served ticket.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidRating`] outside `1..=5`
    /// - [`QueueError::InvalidTransition`] unless the ticket is served
    #[tracing::instrument(skip(self, comment))]
    pub async fn submit_feedback(
        &self,
        ticket_id: TicketId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Ticket, QueueError> {
        self.lifecycle.submit_feedback(ticket_id, rating, comment).await
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Find a ticket by reference, short code or security token.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] when nothing matches
    pub async fn lookup_by_code(&self, code: &str) -> Result<Ticket, QueueError> {
        self.codec.lookup(code).await
    }

    /// 1-based queue position, 0 when not waiting.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    pub async fn position(&self, ticket_id: TicketId) -> Result<usize, QueueError> {
        self.ranker.position(ticket_id).await
    }

    /// Estimated minutes until called, `None` when not waiting.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown ticket
    pub async fn estimated_wait(&self, ticket_id: TicketId) -> Result<Option<u64>, QueueError> {
        self.ranker.estimated_wait_minutes(ticket_id).await
    }

    /// The ticket `call_next` would pick.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Storage`] for backend failures
    pub async fn next_to_call(&self, service_id: ServiceId) -> Result<Option<Ticket>, QueueError> {
        self.ranker.next_to_call(service_id).await
    }

    /// Customer-facing status by any of the ticket's codes.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] when nothing matches
    pub async fn ticket_status(&self, code: &str) -> Result<TicketStatus, QueueError> {
        let ticket = self.codec.lookup(code).await?;
        let service = self.service(ticket.service_id).await?;
        let position = self.ranker.position_of(&ticket).await?;
        let estimated_wait_minutes =
            (position > 0).then(|| estimated_wait(position, service.estimated_service_minutes));
        Ok(TicketStatus {
            ticket,
            position,
            estimated_wait_minutes,
            current_ticket_number: service.current_ticket_number,
        })
    }

    /// Display-board snapshot of a service.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    pub async fn queue_status(&self, service_id: ServiceId) -> Result<QueueStatus, QueueError> {
        let service = self.service(service_id).await?;
        let mut waiting = self.store.waiting_tickets(service_id).await?;
        sort_by_rank(&mut waiting);
        let called_count = self.store.tickets_in_state(service_id, TicketState::Called).await?.len();
        let serving_count = self.store.tickets_in_state(service_id, TicketState::Serving).await?.len();

        let minutes = service.estimated_service_minutes;
        let next_up = waiting
            .iter()
            .take(self.config.queue_preview_len)
            .enumerate()
            .map(|(index, ticket)| QueueEntry {
                ticket_id: ticket.id,
                ticket_number: ticket.ticket_number,
                short_code: ticket.short_code.clone(),
                priority: ticket.priority,
                position: index + 1,
                estimated_wait_minutes: estimated_wait(index + 1, minutes),
            })
            .collect();

        QueueMetrics::record_waiting(&service.name, waiting.len());
        Ok(QueueStatus {
            service_id,
            availability: service.availability(self.local_now()),
            name: service.name,
            is_open: service.is_open,
            current_ticket_number: service.current_ticket_number,
            waiting_count: waiting.len(),
            called_count,
            serving_count,
            next_up,
            average_wait_minutes: average_wait(waiting.len(), minutes),
        })
    }

    /// Cancellations whose time falls in `[from, to)`.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Storage`] for backend failures
    pub async fn cancellation_stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<CancellationStats, QueueError> {
        let mut stats = CancellationStats::default();
        for ticket in self.store.cancelled_between(from, to).await? {
            let Some(record) = ticket.cancellation else {
                continue;
            };
            stats.total += 1;
            *stats.by_actor.entry(record.by.kind()).or_default() += 1;
            *stats.by_service.entry(ticket.service_id).or_default() += 1;
        }
        Ok(stats)
    }

    /// Counts and averages for tickets of one service created in `[from, to)`.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    /// - [`QueueError::Storage`] for backend failures
    pub async fn service_statistics(
        &self,
        service_id: ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ServiceStatistics, QueueError> {
        self.service(service_id).await?;
        let tickets = self.store.tickets_created_between(service_id, from, to).await?;
        Ok(ServiceStatistics::from_tickets(&tickets, self.clock.now()))
    }

    // ---------------------------------------------------------------------
    // Housekeeping
    // ---------------------------------------------------------------------

    /// Drop rate-limit state for sources with no cancellation inside the window.
    /// Returns how many sources were forgotten.
    pub fn prune_rate_limits(&self) -> usize {
        let pruned = self.limiter.prune(self.clock.now());
        if pruned > 0 {
            tracing::debug!(pruned, "rate_limit_sources_pruned");
        }
        pruned
    }

    /// Cancel called tickets nobody acted on within the call timeout.
    ///
    /// Goes through the same guarded pipeline as every other cancellation, so
    /// a ticket staff started serving in the meantime is skipped.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Storage`] if the stale tickets cannot be listed
    #[tracing::instrument(skip(self))]
    pub async fn sweep_call_timeouts(&self) -> Result<SweepReport, QueueError> {
        let timeout = chrono::Duration::from_std(self.config.call_timeout()).unwrap_or(chrono::Duration::MAX);
        let cutoff = self.clock.now() - timeout;
        let stale = self.store.called_before(cutoff).await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };
        let request = CancelRequest::timeout().with_reason("no staff action after call");
        for ticket in stale {
            match self.cancellation.cancel(ticket.id, &request).await {
                Ok(_) => report.cancelled.push(ticket.id),
                Err(error) => {
                    tracing::debug!(ticket_id = %ticket.id, %error, "call_timeout_skipped");
                    report.skipped.push((ticket.id, error));
                }
            }
        }

        SweepMetrics::record_cancelled(report.cancelled.len());
        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                cancelled = report.cancelled.len(),
                "call_timeout_sweep_finished"
            );
        }
        Ok(report)
    }
}

#[allow(clippy::cast_precision_loss)]
fn average_wait(waiting: usize, minutes_per_customer: u32) -> f64 {
    if waiting == 0 {
        return 0.0;
    }
    // Mean of 1..=n is (n + 1) / 2.
    (waiting as f64 + 1.0) / 2.0 * f64::from(minutes_per_customer)
}
