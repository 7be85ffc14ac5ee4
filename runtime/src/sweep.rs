//! Periodic housekeeping: the call-timeout sweep, rate-limit pruning and the
//! daily reset.

use crate::engine::QueueEngine;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::sync::watch;

/// What one housekeeping tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    /// Tickets cancelled by the call-timeout sweep.
    pub timed_out: usize,
    /// Whether the daily reset ran on this tick.
    pub daily_reset: bool,
    /// Client sources whose rate-limit window had emptied.
    pub pruned_sources: usize,
}

/// Drives [`QueueEngine::sweep_call_timeouts`] on an interval and runs
/// [`QueueEngine::reset_daily_counters`] whenever the local date changes.
pub struct Housekeeper {
    engine: Arc<QueueEngine>,
    last_day: Option<NaiveDate>,
}

impl Housekeeper {
    /// Housekeeping for `engine`.
    #[must_use]
    pub const fn new(engine: Arc<QueueEngine>) -> Self {
        Self { engine, last_day: None }
    }

    /// Run one tick. The first tick only records today's date; the reset runs
    /// on the first tick of each following day.
    ///
    /// Failures are logged and the tick carries on.
    pub async fn tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        match self.engine.sweep_call_timeouts().await {
            Ok(report) => outcome.timed_out = report.cancelled.len(),
            Err(error) => tracing::error!(%error, "call_timeout_sweep_failed"),
        }

        outcome.pruned_sources = self.engine.prune_rate_limits();

        let today = self.engine.local_now().date();
        match self.last_day {
            Some(day) if day != today => match self.engine.reset_daily_counters().await {
                Ok(_) => {
                    outcome.daily_reset = true;
                    self.last_day = Some(today);
                }
                Err(error) => tracing::error!(%error, %today, "daily_reset_failed"),
            },
            Some(_) => {}
            None => self.last_day = Some(today),
        }
        outcome
    }

    /// Tick every `sweep_interval` until `shutdown` flips to `true` or its sender
    /// is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.engine.config().sweep_interval().max(std::time::Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.engine.config().sweep_interval_secs,
            "housekeeper_started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("housekeeper_stopped");
    }
}
