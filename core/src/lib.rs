//! # Bidstream Core
//!
//! Core types and traits for propagating auction state changes from the
//! write-service to downstream read models.
//!
//! This crate has no I/O. It defines the wire format and the seams that the
//! runtime, the storage backends and the bus implementations plug into.
//!
//! ## Core Concepts
//!
//! - **Envelope**: typed, sequenced, versioned event message ([`envelope`])
//! - **Payloads**: kind-specific auction data ([`auction`])
//! - **Outbox**: events recorded in the same unit of work as the mutation ([`outbox`])
//! - **Message bus**: keyed publish, consumer groups, explicit settlement ([`event_bus`])
//! - **Projection**: the search read model and its store ([`projection`])
//! - **Faults**: dead letters and the operator-facing fault store ([`fault`])
//!
//! ## Data Flow
//!
//! ```text
//! mutate aggregate ─┐
//!                   ├─ one transaction ─► outbox ─► relay ─► bus ─┬─► search-service group
//! record_event ─────┘                                             └─► other groups
//!                                                      failures ─► fault store ─► replay
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod auction;
pub mod envelope;
pub mod event_bus;
pub mod fault;
pub mod outbox;
pub mod projection;
pub mod retry;

pub use envelope::{AggregateId, EnvelopeId, EventEnvelope, EventKind, SequenceNumber};

/// Default topic carrying every auction envelope.
pub const AUCTION_EVENTS_TOPIC: &str = "auction-events";

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use bidstream_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
