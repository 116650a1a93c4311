//! Message bus abstraction over a durable pub/sub transport.
//!
//! The [`MessageBus`] trait is what the outbox relay publishes through and what
//! projection consumers subscribe to. Implementations provide:
//!
//! - **Keyed publish**: the aggregate id is the partition key, approximating
//!   per-aggregate FIFO when the transport preserves order per partition
//! - **Consumer groups**: each envelope goes to exactly one subscriber of a
//!   group; every group gets its own full copy of the stream
//! - **At-least-once delivery** with explicit settlement ([`Delivery::ack`] /
//!   [`Delivery::nack`])
//! - **Redelivery** with exponential backoff up to a bounded attempt count
//! - **Dead-letter routing** to a [`DeadLetterSink`] once attempts are
//!   exhausted or a delivery is rejected as permanent
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  publish(key = aggregate id)  ┌───────────────┐
//! │ Outbox relay │ ────────────────────────────► │ auction-events│
//! └──────────────┘                               └───────┬───────┘
//!                                                        │ fan-out per group
//!                                     ┌──────────────────┼─────────────────┐
//!                                     ▼                  ▼                 ▼
//!                              search-service      other read model     ...
//!                               (Delivery)              (Delivery)
//!                                  │ ack / nack
//!                                  ▼
//!                        redeliver w/ backoff ──► DeadLetterSink (fault store)
//! ```
//!
//! # Settlement
//!
//! A [`Delivery`] must be settled exactly once. Dropping it unsettled counts
//! as a transient nack, so an in-flight message can never be silently lost
//! (for example when a worker task is cancelled during shutdown).
//!
//! # Dyn Compatibility
//!
//! The trait returns `Pin<Box<dyn Future>>` so that it can be shared as
//! `Arc<dyn MessageBus>` between the relay, the consumers and the fault
//! handler's replay path.

use crate::envelope::EventEnvelope;
use crate::fault::DeadLetterSink;
use crate::retry::RetryPolicy;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Retryable failure (network blip, broker unavailable, timeout).
    #[error("Transient bus error on '{topic}': {reason}")]
    Transient {
        /// Topic involved
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The envelope can never be accepted (malformed, unsupported schema,
    /// oversized). Callers must not retry; route to the fault path instead.
    #[error("Permanent bus error on '{topic}': {reason}")]
    Permanent {
        /// Topic involved
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to connect to the transport.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe.
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },
}

impl BusError {
    /// Shorthand for a [`BusError::Transient`].
    pub fn transient(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`BusError::Permanent`].
    pub fn permanent(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }
}

/// Why a consumer rejected a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NackReason {
    /// Retry later with backoff.
    Transient(String),
    /// Never retry; dead-letter immediately.
    Permanent(String),
}

impl NackReason {
    /// Human-readable error text.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(m) => write!(f, "transient: {m}"),
            Self::Permanent(m) => write!(f, "permanent: {m}"),
        }
    }
}

/// How a delivery was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; the transport may forget the message for this group.
    Ack,
    /// Not processed.
    Nack(NackReason),
}

/// Transport-specific settlement hook carried by each [`Delivery`].
///
/// Settlement is synchronous: implementations hand the decision to their
/// subscription task (for example through a channel), which then commits
/// offsets, schedules redelivery or dead-letters.
pub trait Acknowledger: Send + Sync {
    /// Settle the delivery this acknowledger belongs to.
    fn settle(self: Box<Self>, settlement: Settlement);
}

/// One envelope handed to one subscriber of a consumer group.
pub struct Delivery {
    envelope: EventEnvelope,
    topic: String,
    consumer_group: String,
    attempt: u32,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// Create a delivery. `attempt` is 1 for the first delivery.
    #[must_use]
    pub fn new(
        envelope: EventEnvelope,
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            envelope,
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            attempt,
            acker: Some(acker),
        }
    }

    /// The delivered envelope.
    #[must_use]
    pub const fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    /// Topic the envelope was read from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group this delivery belongs to.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// 1-based delivery attempt.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledge successful processing.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.settle(Settlement::Ack);
        }
    }

    /// Reject the delivery.
    pub fn nack(mut self, reason: NackReason) {
        if let Some(acker) = self.acker.take() {
            acker.settle(Settlement::Nack(reason));
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.settle(Settlement::Nack(NackReason::Transient(
                "delivery dropped before settlement".to_string(),
            )));
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("topic", &self.topic)
            .field("consumer_group", &self.consumer_group)
            .field("attempt", &self.attempt)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Per-subscription settings.
#[derive(Clone)]
pub struct SubscriptionConfig {
    /// Consumer group; one per downstream read service.
    pub consumer_group: String,
    /// Redelivery backoff and attempt budget.
    pub redelivery: RetryPolicy,
    /// Where exhausted and poison messages go.
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl SubscriptionConfig {
    /// Create a config with the default redelivery policy.
    pub fn new(consumer_group: impl Into<String>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            redelivery: RetryPolicy::default(),
            dead_letters,
        }
    }

    /// Override the redelivery policy.
    #[must_use]
    pub fn with_redelivery(mut self, redelivery: RetryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("consumer_group", &self.consumer_group)
            .field("redelivery", &self.redelivery)
            .finish_non_exhaustive()
    }
}

/// Trait for message bus implementations.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one bus instance is shared by the
/// relay, every consumer and the fault handler.
pub trait MessageBus: Send + Sync {
    /// Publish an envelope, keyed by its aggregate id.
    ///
    /// Returns only after the transport confirmed durable acceptance.
    ///
    /// # Errors
    ///
    /// - [`BusError::Transient`]: retry with backoff
    /// - [`BusError::Permanent`]: the envelope is unacceptable; do not retry
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Subscribe to a topic as a member of `config.consumer_group`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription cannot be
    /// established.
    fn subscribe(
        &self,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::envelope::{AggregateId, EventKind, SequenceNumber};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Settlement>>>);

    impl Acknowledger for Recorder {
        fn settle(self: Box<Self>, settlement: Settlement) {
            self.0.lock().unwrap().push(settlement);
        }
    }

    fn delivery(recorder: &Recorder) -> Delivery {
        let envelope = EventEnvelope::new(
            AggregateId::new(),
            EventKind::Deleted,
            SequenceNumber::FIRST,
            chrono::Utc::now(),
            serde_json::json!({}),
        );
        Delivery::new(envelope, "auction-events", "search", 1, Box::new(recorder.clone()))
    }

    #[test]
    fn ack_settles_once() {
        let recorder = Recorder::default();
        delivery(&recorder).ack();

        assert_eq!(*recorder.0.lock().unwrap(), vec![Settlement::Ack]);
    }

    #[test]
    fn dropped_delivery_is_nacked_transiently() {
        let recorder = Recorder::default();
        drop(delivery(&recorder));

        let settled = recorder.0.lock().unwrap();
        assert_eq!(settled.len(), 1);
        assert!(matches!(
            settled[0],
            Settlement::Nack(NackReason::Transient(_))
        ));
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        assert!(BusError::transient("t", "down").is_transient());
        assert!(!BusError::permanent("t", "bad").is_transient());
        assert!(BusError::ConnectionFailed("x".into()).is_transient());
    }
}
