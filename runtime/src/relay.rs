//! Relay-side half of the transactional outbox.
//!
//! # Overview
//!
//! The relay is a long-lived task independent of request handling. Each pass
//! it fetches due entries in recording order and publishes them:
//!
//! ```text
//! ┌────────┐ fetch_pending ┌────────────┐ publish ┌──────────┐
//! │ outbox │ ─────────────►│ OutboxRelay│ ───────►│MessageBus│
//! └────────┘ ◄───────────── └─────┬──────┘         └──────────┘
//!     mark_published /            │ permanent rejection
//!     record_publish_failure      ▼
//!                           DeadLetterSink
//! ```
//!
//! # Ordering
//!
//! After a transient failure the remaining entries of that aggregate are
//! skipped for the rest of the pass, so a later event never overtakes an
//! earlier one on the bus.
//!
//! # Durability
//!
//! An entry is marked published only after the bus confirmed it. A crash
//! between the confirmation and the mark republishes the entry on restart;
//! consumers absorb the duplicate.

use crate::metrics::OutboxMetrics;
use crate::retry::RetryPolicy;
use bidstream_core::environment::Clock;
use bidstream_core::envelope::AggregateId;
use bidstream_core::event_bus::{BusError, MessageBus};
use bidstream_core::fault::{DeadLetter, DeadLetterSink};
use bidstream_core::outbox::{OutboxEntry, OutboxStore, PersistenceError};
use bidstream_core::AUCTION_EVENTS_TOPIC;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Relay tuning.
///
/// # Default Values
///
/// - `topic`: `auction-events`
/// - `batch_size`: 100
/// - `poll_interval`: 500ms
/// - `publish_timeout`: 10 seconds
/// - `backoff`: [`RetryPolicy::default`]
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Topic every entry is published to.
    pub topic: String,
    /// Entries fetched per pass.
    pub batch_size: usize,
    /// Pause between passes when the outbox is drained.
    pub poll_interval: Duration,
    /// Upper bound on one publish; exceeding it counts as transient.
    pub publish_timeout: Duration,
    /// Delay schedule between attempts of one entry.
    pub backoff: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: AUCTION_EVENTS_TOPIC.to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            publish_timeout: Duration::from_secs(10),
            backoff: RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Set the topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the batch size (at least 1).
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the publish timeout.
    #[must_use]
    pub const fn publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    /// Set the backoff schedule.
    #[must_use]
    pub fn backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries confirmed by the bus.
    pub published: usize,
    /// Entries that failed transiently and were rescheduled.
    pub retried: usize,
    /// Entries rejected permanently and moved to the fault path.
    pub dead_lettered: usize,
    /// Entries held back behind an earlier failure of the same aggregate.
    pub deferred: usize,
}

impl DrainReport {
    /// Entries looked at in this pass.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.published + self.retried + self.dead_lettered + self.deferred
    }
}

/// Drains the outbox to the bus.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxRelay {
    /// Create a relay.
    ///
    /// Returns the relay and a shutdown sender. Send `true` to stop
    /// [`run`](Self::run) after the current pass.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn MessageBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = Self {
            store,
            bus,
            dead_letters,
            clock,
            config,
            shutdown: shutdown_rx,
        };

        (relay, shutdown_tx)
    }

    /// Relay settings.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run passes until shutdown is signalled.
    ///
    /// A failing pass is logged and retried after the poll interval. A full
    /// batch with no failures starts the next pass immediately.
    pub async fn run(&mut self) {
        tracing::info!(
            topic = %self.config.topic,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "Starting outbox relay"
        );

        while !*self.shutdown.borrow() {
            let keep_going = match self.drain_once().await {
                Ok(report) => {
                    if report.total() > 0 {
                        tracing::debug!(
                            published = report.published,
                            retried = report.retried,
                            dead_lettered = report.dead_lettered,
                            deferred = report.deferred,
                            "Outbox drain pass complete"
                        );
                    }
                    report.total() >= self.config.batch_size && report.retried == 0
                }
                Err(e) => {
                    tracing::error!(error = %e, "Outbox drain pass failed");
                    false
                }
            };

            if keep_going {
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    /// Run one pass over the due entries.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the outbox cannot be read or updated.
    /// Entries already handled in the pass keep their new state.
    pub async fn drain_once(&self) -> Result<DrainReport, PersistenceError> {
        let entries = self
            .store
            .fetch_pending(self.clock.now(), self.config.batch_size)
            .await?;

        let mut report = DrainReport::default();
        let mut blocked: HashSet<AggregateId> = HashSet::new();

        for entry in entries {
            let aggregate_id = entry.envelope.aggregate_id;
            if blocked.contains(&aggregate_id) {
                report.deferred += 1;
                continue;
            }

            let started = Instant::now();
            match self.publish(&entry).await {
                Ok(()) => {
                    self.store
                        .mark_published(entry.envelope_id(), self.clock.now())
                        .await?;
                    OutboxMetrics::record_published(started.elapsed());
                    report.published += 1;
                }
                Err(e) if e.is_transient() => {
                    self.reschedule(&entry, &e.to_string()).await?;
                    blocked.insert(aggregate_id);
                    report.retried += 1;
                }
                Err(e) => {
                    if self.dead_letter(&entry, &e).await? {
                        report.dead_lettered += 1;
                    } else {
                        blocked.insert(aggregate_id);
                        report.retried += 1;
                    }
                }
            }
        }

        if let Ok(pending) = self.store.count_pending().await {
            OutboxMetrics::record_pending(pending);
        }

        Ok(report)
    }

    async fn publish(&self, entry: &OutboxEntry) -> Result<(), BusError> {
        let topic = &self.config.topic;
        tokio::time::timeout(
            self.config.publish_timeout,
            self.bus.publish(topic, &entry.envelope),
        )
        .await
        .unwrap_or_else(|_| Err(BusError::transient(topic.clone(), "publish timed out")))
    }

    async fn reschedule(&self, entry: &OutboxEntry, error: &str) -> Result<(), PersistenceError> {
        let delay = self.config.backoff.delay_for_attempt(entry.attempts);
        let retry_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        tracing::warn!(
            envelope_id = %entry.envelope_id(),
            aggregate_id = %entry.envelope.aggregate_id,
            sequence = %entry.envelope.sequence,
            attempts = entry.attempts + 1,
            delay_ms = delay.as_millis(),
            error,
            "Publish failed, entry rescheduled"
        );
        OutboxMetrics::record_publish_failure(false);

        self.store
            .record_publish_failure(entry.envelope_id(), error.to_string(), retry_at)
            .await
    }

    /// Hand a permanently rejected entry to the fault path.
    ///
    /// Returns `false` if the sink failed; the entry then stays pending and is
    /// retried like a transient failure.
    async fn dead_letter(&self, entry: &OutboxEntry, error: &BusError) -> Result<bool, PersistenceError> {
        let now = self.clock.now();
        let letter = DeadLetter::from_envelope(
            &entry.envelope,
            self.config.topic.clone(),
            None,
            entry.attempts + 1,
            error.to_string(),
            now,
        );

        if let Err(sink_error) = self.dead_letters.dead_letter(letter).await {
            tracing::error!(
                envelope_id = %entry.envelope_id(),
                error = %sink_error,
                "Dead-letter sink failed, keeping outbox entry pending"
            );
            self.reschedule(entry, &format!("{error}; dead-letter sink: {sink_error}"))
                .await?;
            return Ok(false);
        }

        tracing::error!(
            envelope_id = %entry.envelope_id(),
            aggregate_id = %entry.envelope.aggregate_id,
            sequence = %entry.envelope.sequence,
            error = %error,
            "Bus rejected outbox entry permanently, dead-lettered"
        );
        OutboxMetrics::record_publish_failure(true);

        self.store
            .mark_dead_lettered(entry.envelope_id(), error.to_string(), now)
            .await?;
        Ok(true)
    }
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
