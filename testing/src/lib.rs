//! # Bidstream Testing
//!
//! In-memory infrastructure for exercising event propagation without a broker
//! or a database.
//!
//! This crate provides:
//! - [`InMemoryOutbox`]: write-side outbox and unit of work
//! - [`InMemoryMessageBus`]: consumer groups, redelivery and dead-lettering
//! - [`InMemorySearchItemStore`]: search read model with failure injection
//! - [`InMemoryFaultStore`]: fault entries keyed by envelope id
//! - A controllable clock, envelope fixtures and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use bidstream_testing::{fixtures, test_clock, InMemorySearchItemStore};
//! use bidstream_runtime::SearchProjector;
//!
//! #[tokio::test]
//! async fn created_then_deleted() {
//!     let store = Arc::new(InMemorySearchItemStore::new());
//!     let projector = SearchProjector::new(store.clone(), Arc::new(test_clock()));
//!     let id = AggregateId::new();
//!
//!     projector.apply(&fixtures::created(id, 1)).await.unwrap();
//!     projector.apply(&fixtures::deleted(id, 2)).await.unwrap();
//!
//!     assert!(store.item(id).is_none());
//! }
//! ```

use bidstream_core::environment::Clock;
use chrono::{DateTime, Utc};

/// In-memory message bus
pub mod bus;

/// In-memory fault store
pub mod fault_store;

/// In-memory outbox and unit of work
pub mod outbox;

/// In-memory search read model
pub mod search_store;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, PoisonError, RwLock};

    /// Controllable clock for deterministic tests
    ///
    /// Returns the same time until advanced. Clones share the same time, so a
    /// test can hold one handle while the code under test holds another.
    ///
    /// # Example
    ///
    /// ```
    /// use bidstream_testing::mocks::FixedClock;
    /// use bidstream_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let before = clock.now();
    /// assert_eq!(before, clock.now());
    ///
    /// clock.advance(Duration::seconds(5));
    /// assert_eq!(clock.now() - before, Duration::seconds(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Envelope builders
///
/// Sequence numbers are plain `u64`s to keep scenario tables readable.
pub mod fixtures {
    use bidstream_core::auction::{AuctionCreated, AuctionStatus, AuctionUpdated};
    use bidstream_core::envelope::{AggregateId, EventEnvelope, EventKind, SequenceNumber};
    use chrono::{Duration, TimeZone, Utc};

    /// A complete creation snapshot.
    #[must_use]
    pub fn auction() -> AuctionCreated {
        let created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default();
        AuctionCreated {
            make: "Ford".into(),
            model: "GT".into(),
            year: 2020,
            color: "White".into(),
            mileage: 50_000,
            image_url: "https://cdn.example.com/ford-gt.jpg".into(),
            seller: "bob".into(),
            reserve_price: 20_000,
            current_high_bid: None,
            auction_end: created_at + Duration::days(10),
            status: AuctionStatus::Live,
            created_at,
        }
    }

    /// A `Created` envelope carrying [`auction`].
    #[must_use]
    pub fn created(aggregate_id: AggregateId, sequence: u64) -> EventEnvelope {
        envelope(
            aggregate_id,
            EventKind::Created,
            sequence,
            serde_json::to_value(auction()).unwrap_or_default(),
        )
    }

    /// An `Updated` envelope carrying `patch`.
    #[must_use]
    pub fn updated(aggregate_id: AggregateId, sequence: u64, patch: &AuctionUpdated) -> EventEnvelope {
        envelope(
            aggregate_id,
            EventKind::Updated,
            sequence,
            serde_json::to_value(patch).unwrap_or_default(),
        )
    }

    /// An `Updated` envelope that only changes the mileage.
    #[must_use]
    pub fn mileage(aggregate_id: AggregateId, sequence: u64, mileage: i32) -> EventEnvelope {
        updated(
            aggregate_id,
            sequence,
            &AuctionUpdated {
                mileage: Some(mileage),
                ..AuctionUpdated::default()
            },
        )
    }

    /// A `Deleted` envelope.
    #[must_use]
    pub fn deleted(aggregate_id: AggregateId, sequence: u64) -> EventEnvelope {
        envelope(aggregate_id, EventKind::Deleted, sequence, serde_json::json!({}))
    }

    /// An envelope with an arbitrary payload.
    #[must_use]
    pub fn envelope(
        aggregate_id: AggregateId,
        kind: EventKind,
        sequence: u64,
        payload: serde_json::Value,
    ) -> EventEnvelope {
        let occurred_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default()
            + Duration::seconds(i64::try_from(sequence).unwrap_or(i64::MAX));
        EventEnvelope::new(
            aggregate_id,
            kind,
            SequenceNumber::new(sequence),
            occurred_at,
            payload,
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Delivery orders for an aggregate with sequences `1..=n`, `n` up to
    /// `max_len`: every sequence at least once, some duplicated, shuffled.
    pub fn delivery_order(max_len: u64) -> impl Strategy<Value = Vec<u64>> {
        (1..=max_len.max(1))
            .prop_flat_map(|n| {
                let duplicates = usize::try_from(n).unwrap_or(usize::MAX);
                (Just(n), prop::collection::vec(1..=n, 0..=duplicates))
            })
            .prop_flat_map(|(n, duplicates)| {
                let mut order: Vec<u64> = (1..=n).collect();
                order.extend(duplicates);
                Just(order).prop_shuffle()
            })
    }
}

/// Async test helpers
pub mod helpers {
    use std::time::Duration;

    /// Poll `condition` every few milliseconds until it holds or `timeout`
    /// elapses. Returns whether it held.
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use bus::{GroupStats, InMemoryMessageBus};
pub use fault_store::InMemoryFaultStore;
pub use helpers::wait_until;
pub use mocks::{FixedClock, test_clock};
pub use outbox::{InMemoryOutbox, InMemoryUnitOfWork};
pub use search_store::InMemorySearchItemStore;
