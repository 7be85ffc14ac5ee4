//! # Queueline Testing
//!
//! Testing utilities for the queueline engine.
//!
//! This crate provides:
//! - Deterministic clocks
//! - An in-memory [`QueueStore`](queueline_core::store::QueueStore) with fault injection
//! - Recording and failing notifier/auditor doubles
//! - Service fixtures and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use queueline_testing::{InMemoryQueueStore, ManualClock, fixtures};
//!
//! #[tokio::test]
//! async fn issues_first_ticket() {
//!     let store = Arc::new(InMemoryQueueStore::new());
//!     let clock = Arc::new(ManualClock::at_test_time());
//!     let engine = QueueEngine::builder(store.clone()).clock(clock).build();
//!
//!     let service = engine.register_service(fixtures::open_service("Passports", "PAS")).await?;
//!     let ticket = engine.create_ticket(service.id, Priority::Normal, None).await?;
//!     assert_eq!(ticket.ticket_number, 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use queueline_core::environment::Clock;

pub mod collaborators;
pub mod memory_store;

/// Deterministic clocks.
pub mod mocks {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_panics_doc)]

    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use queueline_testing::mocks::FixedClock;
    /// use queueline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to. Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use queueline_testing::mocks::ManualClock;
    /// use queueline_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::at_test_time();
    /// let start = clock.now();
    /// clock.advance(Duration::minutes(35));
    /// assert_eq!(clock.now() - start, Duration::minutes(35));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Start at [`test_time`].
        #[must_use]
        pub fn at_test_time() -> Self {
            Self::new(test_time())
        }

        /// Move forward.
        pub fn advance(&self, by: Duration) {
            *self.time.write().unwrap() += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// 2025-01-01 10:00:00 UTC, a Wednesday morning inside default opening hours.
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T10:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// Create a default fixed clock for tests at [`test_time`].
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_time())
    }
}

/// Service fixtures.
pub mod fixtures {
    use chrono::{DateTime, Datelike, Utc};
    use queueline_core::schedule::OperatingHours;
    use queueline_core::types::{
        ContactInfo, Priority, Service, Ticket, TicketId, TicketReference, TicketState,
    };

    /// Open around the clock, five minutes per customer, default capacity.
    #[must_use]
    pub fn open_service(name: &str, prefix: &str) -> Service {
        Service::new(name, prefix)
            .with_hours(OperatingHours::always())
            .with_service_minutes(5)
    }

    /// Like [`open_service`] with a daily limit.
    #[must_use]
    pub fn limited_service(name: &str, prefix: &str, limit: u32) -> Service {
        open_service(name, prefix).with_daily_limit(limit)
    }

    /// A waiting ticket with codes derived from the number, for exercising stores
    /// directly without the engine.
    #[must_use]
    pub fn waiting_ticket(service: &Service, number: u64, created_at: DateTime<Utc>) -> Ticket {
        let sequence = u32::try_from(number).unwrap_or(u32::MAX);
        Ticket {
            id: TicketId::new(),
            service_id: service.id,
            ticket_number: number,
            reference: TicketReference::new(service.ticket_prefix.clone(), created_at.year(), sequence),
            short_code: format!("{:X<3.3}{:02}ZZ", service.ticket_prefix, number % 100),
            security_token: format!("token-{}-{number}", service.id),
            priority: Priority::Normal,
            state: TicketState::Waiting,
            contact: ContactInfo::default(),
            created_at,
            called_at: None,
            served_at: None,
            completed_at: None,
            cancellation: None,
            feedback: None,
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use queueline_core::types::Priority;

    /// Any priority tier.
    pub fn priority() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::Normal), Just(Priority::High), Just(Priority::Urgent)]
    }

    /// Arrival order of up to `max` tickets, each with a tier.
    pub fn arrivals(max: usize) -> impl Strategy<Value = Vec<Priority>> {
        proptest::collection::vec(priority(), 1..=max)
    }
}

// Re-export commonly used items
pub use collaborators::{FailingCollaborator, HangingNotifier, RecordingAuditor, RecordingNotifier};
pub use memory_store::InMemoryQueueStore;
pub use mocks::{FixedClock, ManualClock, test_clock, test_time};
