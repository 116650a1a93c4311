//! Redpanda message bus for Bidstream.
//!
//! [`RedpandaMessageBus`] implements the
//! [`MessageBus`](bidstream_core::event_bus::MessageBus) trait on top of
//! rdkafka, so it works against Redpanda or any Kafka-compatible broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ Outbox relay │
//! └──────┬───────┘
//!        │ publish (key = aggregate id)
//!        ▼
//! ┌─────────────────┐
//! │ auction-events  │  one partition per key hash: per-aggregate order
//! └────────┬────────┘
//!          │ consumer group
//!          ▼
//! ┌─────────────────┐  ack     ┌──────────────────┐
//! │  Subscription   │ ───────► │ offset watermark │ ─► commit
//! │      task       │  nack    └──────────────────┘
//! │                 │ ───────► redeliver (backoff) ─► dead-letter sink
//! └─────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed only after the delivery was acknowledged or
//!   dead-lettered, never on receipt
//! - Deliveries settle out of order; the committed offset stops at the lowest
//!   unsettled one
//! - Redelivery of a nacked message happens in-process with exponential
//!   backoff; a restart redelivers everything past the committed offset
//! - Subscribers MUST be idempotent (the projector dedupes on sequence)
//!
//! # Example
//!
//! ```no_run
//! use bidstream_core::event_bus::{MessageBus, SubscriptionConfig};
//! use bidstream_redpanda::RedpandaMessageBus;
//! use futures::StreamExt;
//! # use bidstream_core::fault::DeadLetterSink;
//! # use std::sync::Arc;
//!
//! # async fn example(sink: Arc<dyn DeadLetterSink>) -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaMessageBus::new("localhost:9092")?;
//!
//! let config = SubscriptionConfig::new("search-service", sink);
//! let mut deliveries = bus.subscribe("auction-events", config).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received {}", delivery.envelope());
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod offsets;
mod subscription;

use bidstream_core::envelope::EventEnvelope;
use bidstream_core::event_bus::{BusError, DeliveryStream, MessageBus, SubscriptionConfig};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Redpanda message bus.
///
/// One instance is shared by the relay, the consumers and the fault
/// handler's replay path. Each [`subscribe`](MessageBus::subscribe) call
/// creates its own consumer in the requested group.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Buffer size**: Deliveries buffered per subscription (default: 1000)
/// - **Offset reset**: Where new groups start reading (default: "earliest")
/// - **Drain timeout**: How long a dropped subscription waits for in-flight
///   deliveries to settle (default: 10 seconds)
///
/// # Example
///
/// ```no_run
/// use bidstream_redpanda::RedpandaMessageBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaMessageBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaMessageBus {
    /// Kafka producer for publishing envelopes
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Delivery buffer size per subscription
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
    drain_timeout: Duration,
}

impl RedpandaMessageBus {
    /// Create a bus with default configuration.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaMessageBusBuilder {
        RedpandaMessageBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`RedpandaMessageBus`].
#[derive(Default)]
pub struct RedpandaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    drain_timeout: Option<Duration>,
}

impl RedpandaMessageBusBuilder {
    /// Set the broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// # Parameters
    ///
    /// - `acks`: "0" (no acks), "1" (leader ack), "all" (all replicas ack)
    ///
    /// Default: "all", so a publish only succeeds once the record is durable.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec.
    ///
    /// # Parameters
    ///
    /// - `compression`: "none", "gzip", "snappy", "lz4", "zstd"
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the delivery buffer size for subscriptions.
    ///
    /// Bounds how many decoded deliveries wait between the consumer task and
    /// the subscriber.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set the auto offset reset policy for new consumer groups.
    ///
    /// - `"earliest"`: Start from the beginning of the topic
    /// - `"latest"`: Start from the end (only new envelopes)
    /// - `"error"`: Fail if no committed offset exists
    ///
    /// Default: "earliest", so a new read model sees the retained history.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// How long a subscription keeps settling in-flight deliveries after
    /// its stream was dropped.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = Some(drain_timeout);
        self
    }

    /// Build the [`RedpandaMessageBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaMessageBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", "true")
            .set("compression.type", compression)
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaMessageBus created successfully"
        );

        Ok(RedpandaMessageBus {
            producer,
            brokers,
            timeout,
            buffer_size,
            auto_offset_reset,
            drain_timeout: self.drain_timeout.unwrap_or(Duration::from_secs(10)),
        })
    }
}

/// Map a producer error onto the bus's retry classification.
///
/// Only errors that resending the same bytes cannot fix are permanent.
fn classify_publish_error(topic: &str, error: &KafkaError) -> BusError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::InvalidTopic
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => BusError::permanent(topic, error.to_string()),
        _ => BusError::transient(topic, error.to_string()),
    }
}

impl MessageBus for RedpandaMessageBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();

        Box::pin(async move {
            let payload = envelope
                .check_schema()
                .and_then(|()| envelope.to_bytes())
                .map_err(|e| BusError::permanent(&topic, e.to_string()))?;
            let key = envelope.partition_key();

            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        envelope_id = %envelope.envelope_id,
                        aggregate_id = %envelope.aggregate_id,
                        sequence = %envelope.sequence,
                        "Envelope published successfully"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    let error = classify_publish_error(&topic, &kafka_error);
                    tracing::error!(
                        topic = %topic,
                        envelope_id = %envelope.envelope_id,
                        error = %kafka_error,
                        permanent = matches!(error, BusError::Permanent { .. }),
                        "Failed to publish envelope"
                    );
                    Err(error)
                }
            }
        })
    }

    fn subscribe(
        &self,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>> {
        let topic = topic.to_string();

        Box::pin(async move {
            // Manual commits only: the watermark decides what is safe to skip on restart.
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &config.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| BusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to subscribe to topic: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                consumer_group = %config.consumer_group,
                buffer_size = self.buffer_size,
                auto_offset_reset = %self.auto_offset_reset,
                max_attempts = config.redelivery.max_attempts(),
                manual_commit = true,
                "Subscribed to topic"
            );

            Ok(subscription::spawn(
                consumer,
                subscription::Subscription {
                    topic,
                    config,
                    buffer_size: self.buffer_size,
                    drain_timeout: self.drain_timeout,
                },
            ))
        })
    }
}
