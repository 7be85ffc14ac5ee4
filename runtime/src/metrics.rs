//! Prometheus metrics for the queue engine.
//!
//! Recorder structs wrap the `metrics` facade so call sites stay one line. Nothing
//! is exported until a [`MetricsServer`] installs the Prometheus recorder; before
//! that the facade discards everything.
//!
//! # Example
//!
//! ```rust,no_run
//! use queueline_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// [`start`](MetricsServer::start) only installs the recorder and leaves scraping
/// to the host; [`serve`](MetricsServer::serve) also listens on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        register_metrics();
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Register descriptions and install the Prometheus recorder.
    ///
    /// The host application is expected to expose [`render`](Self::render).
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a warning and
    /// succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "metrics_recorder_installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("metrics_recorder_already_initialized");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install the recorder and serve it over HTTP at `addr` on the current runtime.
    ///
    /// Any path on the listener answers with the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot bind or another recorder is already installed.
    pub async fn serve(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = Self::builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "metrics_listener_failed");
            }
        });
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "metrics_listener_started");
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't installed its own recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!("queue_tickets_issued_total", "Tickets issued");
    describe_histogram!(
        "queue_allocation_duration_seconds",
        "Time taken to allocate a ticket number and codes"
    );
    describe_counter!(
        "queue_allocation_failures_total",
        "Ticket allocations that failed after the retry"
    );
    describe_counter!("queue_transitions_total", "Staff transitions applied, by transition");
    describe_counter!(
        "queue_transitions_rejected_total",
        "Staff transitions rejected by a guard, by transition"
    );
    describe_counter!("queue_cancellations_total", "Cancellations applied, by actor kind");
    describe_counter!(
        "queue_cancellations_rejected_total",
        "Cancellations refused, by reason"
    );
    describe_histogram!(
        "queue_cancellation_duration_seconds",
        "Time taken by the cancellation pipeline"
    );
    describe_counter!(
        "queue_side_effect_failures_total",
        "Notifier or auditor calls that failed or timed out, by kind"
    );
    describe_counter!(
        "queue_sweep_cancelled_total",
        "Called tickets cancelled by the timeout sweep"
    );
    describe_gauge!("queue_waiting_tickets", "Waiting tickets at the last snapshot, by service");
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Ticket issuance metrics.
pub struct AllocationMetrics;

impl AllocationMetrics {
    /// A ticket was issued.
    pub fn record_issued(duration: Duration) {
        counter!("queue_tickets_issued_total").increment(1);
        histogram!("queue_allocation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Allocation failed for good.
    pub fn record_failure() {
        counter!("queue_allocation_failures_total").increment(1);
    }
}

/// State machine metrics.
pub struct TransitionMetrics;

impl TransitionMetrics {
    /// A transition was applied.
    pub fn record_applied(transition: &'static str) {
        counter!("queue_transitions_total", "transition" => transition).increment(1);
    }

    /// A guard rejected a transition.
    pub fn record_rejected(transition: &'static str) {
        counter!("queue_transitions_rejected_total", "transition" => transition).increment(1);
    }
}

/// Cancellation pipeline metrics.
pub struct CancellationMetrics;

impl CancellationMetrics {
    /// A cancellation was applied.
    pub fn record_applied(actor: &'static str, duration: Duration) {
        counter!("queue_cancellations_total", "actor" => actor).increment(1);
        histogram!("queue_cancellation_duration_seconds").record(duration.as_secs_f64());
    }

    /// A cancellation was refused.
    pub fn record_rejected(reason: &'static str) {
        counter!("queue_cancellations_rejected_total", "reason" => reason).increment(1);
    }
}

/// Best-effort collaborator metrics.
pub struct SideEffectMetrics;

impl SideEffectMetrics {
    /// A notifier or auditor call failed or timed out.
    pub fn record_failure(kind: &'static str) {
        counter!("queue_side_effect_failures_total", "kind" => kind).increment(1);
    }
}

/// Housekeeping metrics.
pub struct SweepMetrics;

impl SweepMetrics {
    /// Tickets cancelled by one timeout sweep.
    pub fn record_cancelled(count: usize) {
        counter!("queue_sweep_cancelled_total").increment(u64::try_from(count).unwrap_or(u64::MAX));
    }
}

/// Queue snapshot metrics.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Waiting tickets for one service.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_waiting(service: &str, waiting: usize) {
        gauge!("queue_waiting_tickets", "service" => service.to_string()).set(waiting as f64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
