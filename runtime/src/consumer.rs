//! Projection consumer loop.
//!
//! # Overview
//!
//! The consumer subscribes to the auction topic with the read service's
//! consumer group and feeds every delivery to the [`SearchProjector`]:
//!
//! ```text
//! ┌──────────┐ Delivery ┌──────────────────┐ lock(aggregate) ┌───────────────┐
//! │MessageBus│ ────────►│ProjectionConsumer│ ───────────────►│SearchProjector│
//! └──────────┘ ◄─────── └──────────────────┘                 └───────────────┘
//!                ack / nack   (up to `workers` deliveries in flight)
//! ```
//!
//! # Settlement
//!
//! | Apply result | Settlement |
//! |---|---|
//! | applied, skipped, buffered | `ack` |
//! | [`ApplyError::Transient`] or timeout | `nack(Transient)`: redelivered with backoff |
//! | [`ApplyError::Permanent`] | `nack(Permanent)`: dead-lettered immediately |
//!
//! A delivery is acknowledged only after the store write returned.
//!
//! # Shutdown
//!
//! On shutdown the consumer stops pulling deliveries and waits for the ones
//! in flight to settle. Nothing is left unsettled.

use crate::key_lock::KeyedLocks;
use crate::projector::SearchProjector;
use crate::retry::RetryPolicy;
use bidstream_core::event_bus::{BusError, Delivery, MessageBus, NackReason, SubscriptionConfig};
use bidstream_core::fault::DeadLetterSink;
use bidstream_core::projection::{ApplyError, SearchItemStore};
use bidstream_core::AUCTION_EVENTS_TOPIC;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Default consumer group of the search service.
pub const DEFAULT_CONSUMER_GROUP: &str = "search-service";

/// Consumer tuning.
///
/// # Default Values
///
/// - `topic`: `auction-events`
/// - `consumer_group`: `search-service`
/// - `workers`: 8
/// - `apply_timeout`: 10 seconds
/// - `redelivery`: [`RetryPolicy::default`] (five attempts)
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topic to subscribe to.
    pub topic: String,
    /// Consumer group of this read service.
    pub consumer_group: String,
    /// Deliveries processed concurrently.
    pub workers: usize,
    /// Upper bound on one apply; exceeding it counts as transient.
    pub apply_timeout: Duration,
    /// Redelivery schedule requested from the bus.
    pub redelivery: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: AUCTION_EVENTS_TOPIC.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            workers: 8,
            apply_timeout: Duration::from_secs(10),
            redelivery: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    /// Set the topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the consumer group.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the number of concurrent workers (at least 1).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the apply timeout.
    #[must_use]
    pub const fn apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Set the redelivery policy.
    #[must_use]
    pub fn redelivery(mut self, redelivery: RetryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }
}

/// Subscribes to the bus and applies deliveries to the search read model.
pub struct ProjectionConsumer<S> {
    projector: SearchProjector<S>,
    bus: Arc<dyn MessageBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    locks: KeyedLocks,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S> ProjectionConsumer<S>
where
    S: SearchItemStore + 'static,
{
    /// Create a consumer.
    ///
    /// Returns the consumer and a shutdown sender. Send `true` to stop
    /// [`run`](Self::run) once in-flight deliveries have settled.
    #[must_use]
    pub fn new(
        projector: SearchProjector<S>,
        bus: Arc<dyn MessageBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ConsumerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = Self {
            projector,
            bus,
            dead_letters,
            locks: KeyedLocks::new(),
            config,
            shutdown: shutdown_rx,
        };

        (consumer, shutdown_tx)
    }

    /// Consumer settings.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume until shutdown is signalled or the subscription ends.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the subscription cannot be established.
    #[allow(clippy::cognitive_complexity)]
    pub async fn run(&self) -> Result<(), BusError> {
        tracing::info!(
            topic = %self.config.topic,
            consumer_group = %self.config.consumer_group,
            workers = self.config.workers,
            "Starting projection consumer"
        );

        let subscription = SubscriptionConfig::new(
            self.config.consumer_group.clone(),
            Arc::clone(&self.dead_letters),
        )
        .with_redelivery(self.config.redelivery.clone());
        let mut deliveries = self.bus.subscribe(&self.config.topic, subscription).await?;

        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut in_flight = JoinSet::new();
        let mut shutdown = self.shutdown.clone();

        while !*shutdown.borrow() {
            // Take a worker slot before pulling, so nothing is pulled that
            // cannot be processed right away.
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let next = tokio::select! {
                next = deliveries.next() => next,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            while in_flight.try_join_next().is_some() {}

            match next {
                Some(Ok(delivery)) => {
                    let worker = self.worker();
                    in_flight.spawn(async move {
                        worker.handle(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    tracing::error!(
                        consumer_group = %self.config.consumer_group,
                        error = %e,
                        "Error receiving delivery from bus"
                    );
                }
                None => {
                    tracing::warn!(
                        consumer_group = %self.config.consumer_group,
                        "Subscription ended"
                    );
                    break;
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            tracing::info!(in_flight = draining, "Waiting for in-flight deliveries to settle");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Projection worker failed");
            }
        }

        tracing::info!(consumer_group = %self.config.consumer_group, "Projection consumer stopped");
        Ok(())
    }

    fn worker(&self) -> Worker<S> {
        Worker {
            projector: self.projector.clone(),
            locks: self.locks.clone(),
            apply_timeout: self.config.apply_timeout,
        }
    }
}

impl<S> std::fmt::Debug for ProjectionConsumer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Per-delivery processing, moved into a worker task.
struct Worker<S> {
    projector: SearchProjector<S>,
    locks: KeyedLocks,
    apply_timeout: Duration,
}

impl<S> Worker<S>
where
    S: SearchItemStore,
{
    async fn handle(self, delivery: Delivery) {
        let aggregate_id = delivery.envelope().aggregate_id;
        let sequence = delivery.envelope().sequence;
        let _guard = self.locks.lock(aggregate_id).await;

        let result =
            tokio::time::timeout(self.apply_timeout, self.projector.apply(delivery.envelope()))
                .await
                .unwrap_or_else(|_| Err(ApplyError::Transient("apply timed out".to_string())));

        match result {
            Ok(_) => delivery.ack(),
            Err(ApplyError::Transient(reason)) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    sequence = %sequence,
                    attempt = delivery.attempt(),
                    error = %reason,
                    "Transient apply failure, requesting redelivery"
                );
                delivery.nack(NackReason::Transient(reason));
            }
            Err(ApplyError::Permanent(reason)) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    sequence = %sequence,
                    error = %reason,
                    "Envelope cannot be applied, dead-lettering"
                );
                delivery.nack(NackReason::Permanent(reason));
            }
        }
    }
}
