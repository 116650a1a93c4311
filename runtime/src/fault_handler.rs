//! Fault handler: the dead-letter sink and the operator workflow behind it.
//!
//! The bus hands every message it gives up on to [`FaultHandler`] (through
//! [`DeadLetterSink`]), which persists it in the [`FaultStore`]. Operators then
//! list pending entries and either [`replay`](FaultHandler::replay) them to
//! their original topic or [`discard`](FaultHandler::discard) them with a
//! reason. An entry never disappears without one of the two.

use crate::metrics::FaultMetrics;
use crate::retry::{retry_with_predicate, RetryPolicy};
use bidstream_core::environment::Clock;
use bidstream_core::envelope::{EnvelopeId, EventEnvelope};
use bidstream_core::event_bus::{BusError, MessageBus};
use bidstream_core::fault::{DeadLetter, DeadLetterSink, FaultEntry, FaultError, FaultStatus, FaultStore};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Outcome of a bulk replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries re-published and marked replayed.
    pub replayed: Vec<EnvelopeId>,
    /// Entries that could not be replayed, with the reason. They stay pending.
    pub failed: Vec<(EnvelopeId, FaultError)>,
}

/// Persists dead letters and drives replay and discard.
#[derive(Clone)]
pub struct FaultHandler {
    store: Arc<dyn FaultStore>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    publish_policy: RetryPolicy,
}

impl FaultHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(store: Arc<dyn FaultStore>, bus: Arc<dyn MessageBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            publish_policy: RetryPolicy::default(),
        }
    }

    /// Retry schedule for re-publishing during replay.
    #[must_use]
    pub fn with_publish_policy(mut self, policy: RetryPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Re-publish a fault entry to its original topic and mark it replayed.
    ///
    /// # Errors
    ///
    /// - [`FaultError::NotFound`] if there is no entry
    /// - [`FaultError::Malformed`] if the stored bytes are not a valid
    ///   envelope; the entry stays pending
    /// - [`FaultError::Publish`] if the bus refused it; the entry stays pending
    pub async fn replay(&self, envelope_id: EnvelopeId) -> Result<EventEnvelope, FaultError> {
        let entry = self
            .store
            .get(envelope_id)
            .await?
            .ok_or(FaultError::NotFound(envelope_id))?;

        let envelope = entry.decode()?;

        let bus = &self.bus;
        let topic = entry.original_topic.as_str();
        let to_publish = &envelope;
        retry_with_predicate(
            &self.publish_policy,
            move || bus.publish(topic, to_publish),
            BusError::is_transient,
        )
        .await
        .map_err(|e| FaultError::Publish(e.to_string()))?;

        self.store.mark_replayed(envelope_id, self.clock.now()).await?;

        tracing::info!(
            envelope_id = %envelope_id,
            aggregate_id = %envelope.aggregate_id,
            sequence = %envelope.sequence,
            topic = %entry.original_topic,
            previous_status = entry.status.as_str(),
            "Replayed fault entry"
        );
        FaultMetrics::record_replayed();

        Ok(envelope)
    }

    /// Replay up to `limit` pending entries, oldest first.
    ///
    /// Failures are collected per entry; one bad entry does not stop the rest.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the pending entries cannot be listed.
    pub async fn replay_pending(&self, limit: usize) -> Result<ReplayReport, FaultError> {
        let mut report = ReplayReport::default();

        for entry in self.list_pending(limit).await? {
            match self.replay(entry.envelope_id).await {
                Ok(_) => report.replayed.push(entry.envelope_id),
                Err(e) => {
                    tracing::warn!(envelope_id = %entry.envelope_id, error = %e, "Replay failed");
                    report.failed.push((entry.envelope_id, e));
                }
            }
        }

        Ok(report)
    }

    /// Mark an entry discarded, recording why.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::NotFound`] if there is no entry.
    pub async fn discard(&self, envelope_id: EnvelopeId, reason: impl Into<String>) -> Result<(), FaultError> {
        let reason = reason.into();
        self.store
            .mark_discarded(envelope_id, reason.clone(), self.clock.now())
            .await?;

        tracing::warn!(envelope_id = %envelope_id, reason = %reason, "Discarded fault entry");
        FaultMetrics::record_discarded();
        Ok(())
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the read fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FaultEntry>, FaultError> {
        self.store.list_by_status(FaultStatus::Pending, limit).await
    }

    /// Fetch one entry.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the read fails.
    pub async fn get(&self, envelope_id: EnvelopeId) -> Result<Option<FaultEntry>, FaultError> {
        self.store.get(envelope_id).await
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the read fails.
    pub async fn count_pending(&self) -> Result<u64, FaultError> {
        self.store.count_pending().await
    }
}

impl DeadLetterSink for FaultHandler {
    fn dead_letter(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>> {
        Box::pin(async move {
            let topic = letter.original_topic.clone();
            let entry = self.store.record(letter).await?;

            tracing::warn!(
                envelope_id = %entry.envelope_id,
                topic = %entry.original_topic,
                consumer_group = entry.consumer_group.as_deref().unwrap_or("-"),
                attempts = entry.attempts,
                error = %entry.last_error,
                "Message added to fault store"
            );
            FaultMetrics::record_recorded(&topic);

            Ok(())
        })
    }
}

impl std::fmt::Debug for FaultHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHandler")
            .field("publish_policy", &self.publish_policy)
            .finish_non_exhaustive()
    }
}
