//! `PostgreSQL` queue store for queueline.
//!
//! This crate implements the [`QueueStore`](queueline_core::store::QueueStore) trait
//! from `queueline-core` over a sqlx connection pool and ships the
//! `queueline-sweeper` worker binary. It provides:
//!
//! - Per-service ticket number allocation under a row lock
//! - Unique indexes on reference, short code and security token
//! - Compare-and-set staff transitions in explicit transactions
//! - A lease column for the per-ticket cancellation lock
//! - Bundled migrations
//!
//! # Example
//!
//! ```ignore
//! use queueline_postgres::PostgresQueueStore;
//! use queueline_runtime::QueueEngine;
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresQueueStore::new("postgres://localhost/queueline").await?;
//!     store.migrate().await?;
//!     let engine = QueueEngine::builder(Arc::new(store)).build();
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Row decoding and sqlx error mapping
pub mod rows;

/// The store implementation
pub mod store;

pub use store::PostgresQueueStore;
