//! Request-side half of the transactional outbox.
//!
//! [`OutboxPublisher::record_event`] runs inside the caller's open unit of
//! work, next to the aggregate mutation. It never talks to the bus: the
//! [`OutboxRelay`](crate::relay::OutboxRelay) does that later.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = PgUnitOfWork::begin(&pool).await?;
//! sqlx::query("UPDATE auctions SET ...").execute(uow.conn()).await?;
//! publisher.record(&mut uow, auction_id, &AuctionUpdated { .. }).await?;
//! uow.commit().await?;
//! ```

use crate::metrics::OutboxMetrics;
use bidstream_core::auction::AuctionEvent;
use bidstream_core::environment::Clock;
use bidstream_core::envelope::{AggregateId, EnvelopeId, EventEnvelope, EventKind};
use bidstream_core::outbox::{OutboxEntry, OutboxTransaction, PersistenceError};
use std::sync::Arc;

/// Records envelopes into the outbox of an open unit of work.
#[derive(Clone)]
pub struct OutboxPublisher {
    clock: Arc<dyn Clock>,
}

impl OutboxPublisher {
    /// Create a publisher stamping envelopes with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Record one event for `aggregate_id` in the same unit of work as the
    /// aggregate mutation.
    ///
    /// Allocates the next sequence number, builds the envelope and appends
    /// the outbox entry. Nothing is visible to the relay until the unit of
    /// work commits; if it never commits, neither the mutation nor the entry
    /// exists.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::Serialization`] if `payload` is not a JSON object
    /// - [`PersistenceError::Database`] if allocation or the insert fails
    pub async fn record_event<T>(
        &self,
        tx: &mut T,
        aggregate_id: AggregateId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<EnvelopeId, PersistenceError>
    where
        T: OutboxTransaction,
    {
        if !payload.is_object() {
            return Err(PersistenceError::Serialization(format!(
                "{kind} payload must be a JSON object"
            )));
        }

        let sequence = tx.next_sequence(aggregate_id).await?;
        let now = self.clock.now();
        let envelope = EventEnvelope::new(aggregate_id, kind, sequence, now, payload);
        let envelope_id = envelope.envelope_id;

        tx.append(&OutboxEntry::pending(envelope, now)).await?;

        tracing::debug!(
            envelope_id = %envelope_id,
            aggregate_id = %aggregate_id,
            kind = %kind,
            sequence = %sequence,
            "Recorded event in outbox"
        );
        OutboxMetrics::record_recorded(kind);

        Ok(envelope_id)
    }

    /// Record a typed auction payload.
    ///
    /// # Errors
    ///
    /// Same as [`record_event`](Self::record_event).
    pub async fn record<T, E>(
        &self,
        tx: &mut T,
        aggregate_id: AggregateId,
        event: &E,
    ) -> Result<EnvelopeId, PersistenceError>
    where
        T: OutboxTransaction,
        E: AuctionEvent + Sync,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        self.record_event(tx, aggregate_id, E::KIND, payload).await
    }
}

impl std::fmt::Debug for OutboxPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPublisher").finish_non_exhaustive()
    }
}
