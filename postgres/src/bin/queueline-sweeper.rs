//! Housekeeping worker.
//!
//! Connects to `DATABASE_URL`, applies migrations and runs the call-timeout
//! sweep and the daily reset until interrupted. Engine settings come from the
//! `QUEUE_*` environment variables. Prometheus metrics are served on
//! `METRICS_ADDR` (default `0.0.0.0:9090`).
//!
//! Run with: `DATABASE_URL=postgres://localhost/queueline cargo run --bin queueline-sweeper`

use anyhow::Context;
use queueline_postgres::PostgresQueueStore;
use queueline_runtime::metrics::MetricsServer;
use queueline_runtime::{EngineConfig, Housekeeper, QueueEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics_addr: SocketAddr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
        .parse()
        .context("METRICS_ADDR must be a socket address")?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.serve().await.context("failed to start metrics listener")?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let store = PostgresQueueStore::with_max_connections(&database_url, max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store.migrate().await.context("failed to run migrations")?;

    let config = EngineConfig::from_env();
    tracing::info!(
        sweep_interval_secs = config.sweep_interval_secs,
        call_timeout_minutes = config.call_timeout_minutes,
        max_connections,
        "sweeper_starting"
    );

    let engine = Arc::new(QueueEngine::builder(Arc::new(store)).config(config).build());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(Housekeeper::new(engine).run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown_requested");
    let _ = shutdown_tx.send(true);
    worker.await.context("housekeeper task panicked")?;
    Ok(())
}
