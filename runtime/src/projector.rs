//! The search projection: applies envelopes to the [`SearchItem`] read model.
//!
//! # Apply Algorithm
//!
//! 1. Check the schema version and decode the payload for the kind.
//!    Failure is permanent.
//! 2. Load the read state of the aggregate.
//! 3. An envelope at or below the last applied sequence is skipped.
//! 4. Dispatch on the kind:
//!    - `Created` builds the record (replacing a live record with a lower
//!      sequence, which is reported as a conflict)
//!    - `Updated` merges the patch if it directly follows the last applied
//!      sequence, and is stashed otherwise
//!    - `Deleted` removes the record and leaves a tombstone
//! 5. Contiguous stashed updates are replayed into the same write, and stash
//!    entries at or below the new sequence are discarded after the write.
//!
//! Every step is idempotent: a crash anywhere leads to a redelivery that
//! either skips or completes the work.
//!
//! # Stash Expiry
//!
//! A stashed update was already acknowledged on the bus, so it is never
//! simply dropped. When its gap stays open past retention,
//! [`SearchProjector::expire_stash`] hands it to the dead-letter sink with an
//! "unreconciled gap" error and only then removes it from the stash.
//! Tombstones are not subject to expiry.

use crate::metrics::ProjectionMetrics;
use bidstream_core::auction::{AuctionCreated, AuctionDeleted, AuctionEvent, AuctionUpdated};
use bidstream_core::environment::Clock;
use bidstream_core::envelope::{EnvelopeError, EventEnvelope, EventKind, SequenceNumber};
use bidstream_core::fault::{DeadLetter, DeadLetterSink, FaultError};
use bidstream_core::projection::{
    ApplyError, ApplyOutcome, ConflictError, ReadState, SearchItem, SearchItemStore, StoreError,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Expired stash entries handled per store round trip.
const EXPIRY_BATCH: usize = 100;

/// Result of one [`SearchProjector::expire_stash`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StashExpiry {
    /// Envelopes handed to the dead-letter sink.
    pub dead_lettered: usize,
    /// Envelopes dropped because the record had already moved past them.
    pub superseded: usize,
}

/// Why a stash expiry pass stopped early. Entries not yet handled stay stashed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpiryError {
    /// The read store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The dead-letter sink refused an entry.
    #[error(transparent)]
    Sink(#[from] FaultError),
}

/// A decoded envelope payload.
#[derive(Debug, Clone)]
enum AuctionChange {
    Created(AuctionCreated),
    Updated(AuctionUpdated),
    Deleted,
}

impl AuctionChange {
    fn decode(envelope: &EventEnvelope) -> Result<Self, EnvelopeError> {
        match envelope.kind {
            EventKind::Created => AuctionCreated::decode(envelope).map(Self::Created),
            EventKind::Updated => AuctionUpdated::decode(envelope).map(Self::Updated),
            EventKind::Deleted => AuctionDeleted::decode(envelope).map(|_| Self::Deleted),
        }
    }
}

/// Applies auction envelopes to a [`SearchItemStore`].
pub struct SearchProjector<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for SearchProjector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> SearchProjector<S>
where
    S: SearchItemStore,
{
    /// Create a projector over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Apply one envelope.
    ///
    /// Callers must serialize calls per aggregate.
    ///
    /// # Errors
    ///
    /// - [`ApplyError::Permanent`] for unsupported schemas, out-of-range
    ///   sequences and malformed payloads
    /// - [`ApplyError::Transient`] for any store failure
    pub async fn apply(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome, ApplyError> {
        let started = Instant::now();
        let result = self.apply_inner(envelope).await;

        match &result {
            Ok(ApplyOutcome::Applied {
                sequence,
                replayed,
                conflict,
            }) => {
                tracing::debug!(
                    aggregate_id = %envelope.aggregate_id,
                    kind = %envelope.kind,
                    sequence = %sequence,
                    replayed,
                    "Applied envelope"
                );
                Self::report_conflict(conflict.as_ref());
                ProjectionMetrics::record_applied(envelope.kind, started.elapsed());
            }
            Ok(ApplyOutcome::Skipped {
                last_applied,
                conflict,
            }) => {
                tracing::debug!(
                    aggregate_id = %envelope.aggregate_id,
                    kind = %envelope.kind,
                    sequence = %envelope.sequence,
                    last_applied = %last_applied,
                    "Skipped duplicate or stale envelope"
                );
                Self::report_conflict(conflict.as_ref());
                ProjectionMetrics::record_skipped(envelope.kind);
            }
            Ok(ApplyOutcome::Buffered { awaiting }) => {
                tracing::info!(
                    aggregate_id = %envelope.aggregate_id,
                    sequence = %envelope.sequence,
                    awaiting = %awaiting,
                    "Stashed out-of-order envelope"
                );
                ProjectionMetrics::record_buffered();
            }
            Err(e) => {
                ProjectionMetrics::record_failure(matches!(e, ApplyError::Permanent(_)));
            }
        }

        result
    }

    /// Dead-letter every envelope stashed before `cutoff`, then unstash it.
    ///
    /// An entry whose sequence the record has already passed is unstashed
    /// without a letter. Safe to run next to the consumer: an entry replayed
    /// at the same moment ends up applied and dead-lettered, and replaying
    /// the letter later is skipped as stale.
    ///
    /// # Errors
    ///
    /// Stops at the first store or sink failure; the remaining entries are
    /// picked up by the next pass.
    pub async fn expire_stash(
        &self,
        cutoff: DateTime<Utc>,
        sink: &dyn DeadLetterSink,
        topic: &str,
        consumer_group: &str,
    ) -> Result<StashExpiry, ExpiryError> {
        let mut report = StashExpiry::default();

        loop {
            let batch = self.store.expired_stash(cutoff, EXPIRY_BATCH).await?;
            let last_batch = batch.len() < EXPIRY_BATCH;

            for envelope in batch {
                let last_applied = self.store.load(envelope.aggregate_id).await?.last_applied();
                if last_applied.is_some_and(|last| envelope.sequence <= last) {
                    self.store
                        .unstash(envelope.aggregate_id, envelope.sequence)
                        .await?;
                    report.superseded += 1;
                    continue;
                }

                let awaiting = last_applied.map_or(SequenceNumber::FIRST, SequenceNumber::next);
                let letter = DeadLetter::from_envelope(
                    &envelope,
                    topic,
                    Some(consumer_group.to_string()),
                    1,
                    format!(
                        "unreconciled gap: sequence {awaiting} never arrived, {} expired from the stash",
                        envelope.sequence
                    ),
                    self.clock.now(),
                );
                sink.dead_letter(letter).await?;
                self.store
                    .unstash(envelope.aggregate_id, envelope.sequence)
                    .await?;

                tracing::warn!(
                    aggregate_id = %envelope.aggregate_id,
                    envelope_id = %envelope.envelope_id,
                    sequence = %envelope.sequence,
                    awaiting = %awaiting,
                    "Dead-lettered stashed envelope with an unreconciled gap"
                );
                ProjectionMetrics::record_stash_expired();
                report.dead_lettered += 1;
            }

            if last_batch {
                break;
            }
        }

        Ok(report)
    }

    async fn apply_inner(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome, ApplyError> {
        envelope.check_schema()?;
        envelope.check_sequence()?;
        let change = AuctionChange::decode(envelope)?;

        let state = self.store.load(envelope.aggregate_id).await?;

        if let Some(last_applied) = state.last_applied() {
            if envelope.sequence <= last_applied {
                let conflict = (envelope.kind == EventKind::Created
                    && envelope.sequence < last_applied)
                    .then(|| conflict_with(envelope, last_applied));
                return Ok(ApplyOutcome::Skipped {
                    last_applied,
                    conflict,
                });
            }
        }

        match change {
            AuctionChange::Created(created) => self.on_created(envelope, created, &state).await,
            AuctionChange::Updated(patch) => self.on_updated(envelope, patch, state).await,
            AuctionChange::Deleted => self.on_deleted(envelope).await,
        }
    }

    async fn on_created(
        &self,
        envelope: &EventEnvelope,
        created: AuctionCreated,
        state: &ReadState,
    ) -> Result<ApplyOutcome, ApplyError> {
        let conflict = match state {
            ReadState::Live(existing) => Some(conflict_with(envelope, existing.last_applied)),
            ReadState::Absent | ReadState::Deleted { .. } => None,
        };

        let mut item = SearchItem::from_created(
            envelope.aggregate_id,
            created,
            envelope.sequence,
            envelope.occurred_at,
        );
        let replayed = self.replay_stash(&mut item).await?;
        self.commit(item, replayed, conflict).await
    }

    async fn on_updated(
        &self,
        envelope: &EventEnvelope,
        patch: AuctionUpdated,
        state: ReadState,
    ) -> Result<ApplyOutcome, ApplyError> {
        match state {
            ReadState::Live(mut item) if envelope.sequence.directly_follows(item.last_applied) => {
                item.apply_patch(patch, envelope.sequence, envelope.occurred_at);
                let replayed = self.replay_stash(&mut item).await?;
                self.commit(item, replayed, None).await
            }
            other => {
                let awaiting = other
                    .last_applied()
                    .map_or(SequenceNumber::FIRST, SequenceNumber::next);
                self.store.stash(envelope, self.clock.now()).await?;
                Ok(ApplyOutcome::Buffered { awaiting })
            }
        }
    }

    async fn on_deleted(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome, ApplyError> {
        self.store
            .remove(envelope.aggregate_id, envelope.sequence, self.clock.now())
            .await?;
        self.store
            .discard_stashed(envelope.aggregate_id, envelope.sequence)
            .await?;

        tracing::info!(
            aggregate_id = %envelope.aggregate_id,
            sequence = %envelope.sequence,
            "Removed search item"
        );

        Ok(ApplyOutcome::Applied {
            sequence: envelope.sequence,
            replayed: 0,
            conflict: None,
        })
    }

    /// Write the item, then drop the stash entries it absorbed.
    async fn commit(
        &self,
        item: SearchItem,
        replayed: usize,
        conflict: Option<ConflictError>,
    ) -> Result<ApplyOutcome, ApplyError> {
        self.store.upsert(&item).await?;
        self.store
            .discard_stashed(item.aggregate_id, item.last_applied)
            .await?;

        Ok(ApplyOutcome::Applied {
            sequence: item.last_applied,
            replayed,
            conflict,
        })
    }

    /// Merge stashed updates that directly follow the item's sequence.
    async fn replay_stash(&self, item: &mut SearchItem) -> Result<usize, ApplyError> {
        let stashed = self.store.stashed(item.aggregate_id).await?;
        let mut replayed = 0;

        for envelope in stashed {
            if envelope.sequence <= item.last_applied {
                continue;
            }
            if !envelope.sequence.directly_follows(item.last_applied) {
                break;
            }
            match AuctionUpdated::decode(&envelope) {
                Ok(patch) => {
                    item.apply_patch(patch, envelope.sequence, envelope.occurred_at);
                    replayed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        aggregate_id = %envelope.aggregate_id,
                        sequence = %envelope.sequence,
                        error = %e,
                        "Stashed envelope is not a replayable update"
                    );
                    break;
                }
            }
        }

        Ok(replayed)
    }

    fn report_conflict(conflict: Option<&ConflictError>) {
        if let Some(conflict) = conflict {
            tracing::warn!(
                aggregate_id = %conflict.aggregate_id,
                kind = %conflict.kind,
                incoming = %conflict.incoming,
                existing = %conflict.existing,
                "{conflict}"
            );
            ProjectionMetrics::record_conflict(conflict.kind);
        }
    }
}

const fn conflict_with(envelope: &EventEnvelope, existing: SequenceNumber) -> ConflictError {
    ConflictError {
        aggregate_id: envelope.aggregate_id,
        kind: envelope.kind,
        incoming: envelope.sequence,
        existing,
    }
}

impl<S> std::fmt::Debug for SearchProjector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchProjector").finish_non_exhaustive()
    }
}
