//! Per-service ticket number allocation.
//!
//! The counter lives in the store; the store guarantees the read-increment-write
//! is one atomic step. This layer adds the single transient retry and maps
//! store failures onto the caller-facing taxonomy.

use crate::retry::{RetryPolicy, retry_transient};
use chrono::NaiveDate;
use queueline_core::error::{Missing, QueueError, StoreError};
use queueline_core::store::{Allocation, QueueStore};
use queueline_core::types::ServiceId;
use std::sync::Arc;

/// Hands out unique, strictly increasing ticket numbers per service.
#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<dyn QueueStore>,
    retry: RetryPolicy,
}

impl SequenceAllocator {
    /// Allocate through `store`, retrying transient failures per `retry`.
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Allocate the next ticket number for `service_id`, counted against local `day`.
    ///
    /// # Errors
    ///
    /// - [`QueueError::CapacityExceeded`] when the daily limit is reached
    /// - [`QueueError::NotFound`] for an unknown service
    /// - [`QueueError::AllocationFailure`] when the store fails (after one retry
    ///   for transient failures); the counter is not advanced
    pub async fn allocate(&self, service_id: ServiceId, day: NaiveDate) -> Result<Allocation, QueueError> {
        retry_transient(&self.retry, "allocate_ticket_number", || {
            self.store.allocate_ticket_number(service_id, day)
        })
        .await
        .map_err(|error| match error {
            StoreError::CapacityReached { limit } => QueueError::CapacityExceeded { service_id, limit },
            StoreError::ServiceNotFound(id) => QueueError::NotFound(Missing::Service(id)),
            other => QueueError::AllocationFailure {
                service_id,
                reason: other.to_string(),
            },
        })
    }

    /// Repair a drifted counter from the highest persisted ticket number.
    /// Safe to run concurrently with [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for an unknown service
    /// - [`QueueError::Storage`] for backend failures
    pub async fn resync(&self, service_id: ServiceId) -> Result<u64, QueueError> {
        let counter = self
            .store
            .resync_ticket_number(service_id)
            .await
            .map_err(|error| match error {
                StoreError::ServiceNotFound(id) => QueueError::NotFound(Missing::Service(id)),
                other => QueueError::Storage(other),
            })?;
        tracing::info!(%service_id, counter, "ticket_counter_resynced");
        Ok(counter)
    }
}
