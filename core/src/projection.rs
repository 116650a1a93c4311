//! Read-model types for the search projection.
//!
//! # Overview
//!
//! The search service keeps a denormalized [`SearchItem`] per auction. It is
//! built exclusively from envelopes delivered by the bus, so it must tolerate
//! duplicates, stale redeliveries and out-of-order arrival.
//!
//! ## Idempotency
//!
//! Each record stores the sequence number of the last envelope applied to it.
//! An envelope at or below that number is a no-op. Deletion leaves a
//! tombstone carrying the deleted sequence so that late envelopes for a
//! deleted auction cannot resurrect it.
//!
//! ## Out-of-order updates
//!
//! An `Updated` envelope whose predecessor has not been applied yet is
//! stashed durably and replayed as soon as the gap closes. A gap that stays
//! open past retention is handed to the fault store; tombstones never expire.
//!
//! ```text
//!  seq 1 Created ──► apply ──► last_applied = 1
//!  seq 3 Updated ──► stash (awaiting 2)
//!  seq 2 Updated ──► apply ──► last_applied = 2 ──► replay 3 ──► last_applied = 3
//! ```

use crate::auction::{AuctionCreated, AuctionStatus, AuctionUpdated};
use crate::envelope::{AggregateId, EnvelopeError, EventEnvelope, EventKind, SequenceNumber};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Denormalized auction record served by the search service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    /// Auction id.
    pub aggregate_id: AggregateId,
    /// Vehicle make.
    pub make: String,
    /// Vehicle model.
    pub model: String,
    /// Model year.
    pub year: i32,
    /// Exterior color.
    pub color: String,
    /// Odometer reading.
    pub mileage: i32,
    /// Listing image.
    pub image_url: String,
    /// Seller username.
    pub seller: String,
    /// Winning bidder once finished.
    pub winner: Option<String>,
    /// Reserve price.
    pub reserve_price: i64,
    /// Final price once finished.
    pub sold_amount: Option<i64>,
    /// Highest bid so far.
    pub current_high_bid: Option<i64>,
    /// When the auction was created on the write side.
    pub created_at: DateTime<Utc>,
    /// Time of the last applied event.
    pub updated_at: DateTime<Utc>,
    /// When bidding closes.
    pub auction_end: DateTime<Utc>,
    /// Lifecycle status.
    pub status: AuctionStatus,
    /// Sequence number of the last envelope applied to this record.
    pub last_applied: SequenceNumber,
}

impl SearchItem {
    /// Build a record from a creation snapshot.
    #[must_use]
    pub fn from_created(
        aggregate_id: AggregateId,
        created: AuctionCreated,
        sequence: SequenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            aggregate_id,
            make: created.make,
            model: created.model,
            year: created.year,
            color: created.color,
            mileage: created.mileage,
            image_url: created.image_url,
            seller: created.seller,
            winner: None,
            reserve_price: created.reserve_price,
            sold_amount: None,
            current_high_bid: created.current_high_bid,
            created_at: created.created_at,
            updated_at: occurred_at,
            auction_end: created.auction_end,
            status: created.status,
            last_applied: sequence,
        }
    }

    /// Merge a patch and advance `last_applied` to `sequence`.
    pub fn apply_patch(
        &mut self,
        patch: AuctionUpdated,
        sequence: SequenceNumber,
        occurred_at: DateTime<Utc>,
    ) {
        if let Some(make) = patch.make {
            self.make = make;
        }
        if let Some(model) = patch.model {
            self.model = model;
        }
        if let Some(year) = patch.year {
            self.year = year;
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(mileage) = patch.mileage {
            self.mileage = mileage;
        }
        if let Some(image_url) = patch.image_url {
            self.image_url = image_url;
        }
        if let Some(bid) = patch.current_high_bid {
            self.current_high_bid = Some(bid);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(winner) = patch.winner {
            self.winner = Some(winner);
        }
        if let Some(amount) = patch.sold_amount {
            self.sold_amount = Some(amount);
        }
        if let Some(end) = patch.auction_end {
            self.auction_end = end;
        }
        self.updated_at = occurred_at;
        self.last_applied = sequence;
    }
}

/// What the read store knows about an aggregate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadState {
    /// Never seen.
    Absent,
    /// Live record.
    Live(SearchItem),
    /// Deleted; the tombstone keeps the deleting sequence.
    Deleted {
        /// Sequence of the `Deleted` envelope.
        last_applied: SequenceNumber,
        /// When the tombstone was written.
        deleted_at: DateTime<Utc>,
    },
}

impl ReadState {
    /// Last applied sequence, `None` when absent.
    #[must_use]
    pub const fn last_applied(&self) -> Option<SequenceNumber> {
        match self {
            Self::Absent => None,
            Self::Live(item) => Some(item.last_applied),
            Self::Deleted { last_applied, .. } => Some(*last_applied),
        }
    }
}

/// Read store failures. All of them are retryable from the consumer's view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the query failed.
    #[error("Read store unavailable: {0}")]
    Unavailable(String),

    /// The write was not acknowledged.
    #[error("Read store did not acknowledge the write: {0}")]
    Unacknowledged(String),

    /// A stored row could not be (de)serialized.
    #[error("Read store serialization error: {0}")]
    Serialization(String),
}

/// Why an envelope could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Retry later (store failure, timeout).
    #[error("Transient apply failure: {0}")]
    Transient(String),

    /// The envelope can never be applied (malformed, unsupported schema).
    #[error("Permanent apply failure: {0}")]
    Permanent(String),
}

impl From<StoreError> for ApplyError {
    fn from(error: StoreError) -> Self {
        Self::Transient(error.to_string())
    }
}

impl From<EnvelopeError> for ApplyError {
    fn from(error: EnvelopeError) -> Self {
        Self::Permanent(error.to_string())
    }
}

/// An ordering anomaly: a `Created` that disagrees with what the store holds.
///
/// Logged and counted. Never fails the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Ordering conflict on {aggregate_id}: {kind} at sequence {incoming} vs stored {existing}")]
pub struct ConflictError {
    /// Aggregate concerned.
    pub aggregate_id: AggregateId,
    /// Kind of the incoming envelope.
    pub kind: EventKind,
    /// Sequence of the incoming envelope.
    pub incoming: SequenceNumber,
    /// Sequence the store held.
    pub existing: SequenceNumber,
}

/// Result of applying one envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The envelope changed the record.
    Applied {
        /// Record's last applied sequence after the write.
        sequence: SequenceNumber,
        /// Stashed envelopes replayed in the same write.
        replayed: usize,
        /// Anomaly detected along the way.
        conflict: Option<ConflictError>,
    },
    /// Duplicate or stale; nothing changed.
    Skipped {
        /// Sequence the store already held.
        last_applied: SequenceNumber,
        /// Anomaly detected along the way.
        conflict: Option<ConflictError>,
    },
    /// Stashed until its predecessor arrives.
    Buffered {
        /// The sequence that must be applied first.
        awaiting: SequenceNumber,
    },
}

/// Storage for search items, tombstones and stashed envelopes.
///
/// Every write must be acknowledged by the backend before it returns `Ok`.
pub trait SearchItemStore: Send + Sync {
    /// Read state of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lookup fails.
    fn load(
        &self,
        aggregate_id: AggregateId,
    ) -> impl Future<Output = Result<ReadState, StoreError>> + Send;

    /// Insert or replace a live record, clearing any tombstone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn upsert(&self, item: &SearchItem) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete the record (if any) and write a tombstone at `sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn remove(
        &self,
        aggregate_id: AggregateId,
        sequence: SequenceNumber,
        deleted_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Keep an envelope for later. Stashing the same sequence twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn stash(
        &self,
        envelope: &EventEnvelope,
        stashed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Stashed envelopes of an aggregate, ascending by sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lookup fails.
    fn stashed(
        &self,
        aggregate_id: AggregateId,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, StoreError>> + Send;

    /// Drop stashed envelopes at or below `through`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    fn discard_stashed(
        &self,
        aggregate_id: AggregateId,
        through: SequenceNumber,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Drop exactly one stashed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    fn unstash(
        &self,
        aggregate_id: AggregateId,
        sequence: SequenceNumber,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Up to `limit` envelopes stashed before `cutoff`, oldest first.
    ///
    /// Nothing is removed; the caller dead-letters each one and then calls
    /// [`SearchItemStore::unstash`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lookup fails.
    fn expired_stash(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> AuctionCreated {
        AuctionCreated {
            make: "Ford".to_string(),
            model: "GT".to_string(),
            year: 2020,
            color: "White".to_string(),
            mileage: 50_000,
            image_url: "https://cdn.example/ford-gt.jpg".to_string(),
            seller: "bob".to_string(),
            reserve_price: 20_000,
            current_high_bid: None,
            auction_end: Utc::now(),
            status: AuctionStatus::Live,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn patch_changes_only_present_fields() {
        let id = AggregateId::new();
        let mut item = SearchItem::from_created(id, created(), SequenceNumber::FIRST, Utc::now());

        let patch = AuctionUpdated {
            color: Some("Red".to_string()),
            status: Some(AuctionStatus::Finished),
            winner: Some("alice".to_string()),
            ..AuctionUpdated::default()
        };
        item.apply_patch(patch, SequenceNumber::new(2), Utc::now());

        assert_eq!(item.color, "Red");
        assert_eq!(item.make, "Ford");
        assert_eq!(item.status, AuctionStatus::Finished);
        assert_eq!(item.winner.as_deref(), Some("alice"));
        assert_eq!(item.last_applied, SequenceNumber::new(2));
    }

    #[test]
    fn read_state_reports_last_applied() {
        assert_eq!(ReadState::Absent.last_applied(), None);

        let deleted = ReadState::Deleted {
            last_applied: SequenceNumber::new(4),
            deleted_at: Utc::now(),
        };
        assert_eq!(deleted.last_applied(), Some(SequenceNumber::new(4)));
    }

    #[test]
    fn store_errors_are_transient_and_envelope_errors_permanent() {
        let transient: ApplyError = StoreError::Unacknowledged("no ack".into()).into();
        assert!(matches!(transient, ApplyError::Transient(_)));

        let permanent: ApplyError = EnvelopeError::UnsupportedSchema {
            found: 2,
            supported: 1,
        }
        .into();
        assert!(matches!(permanent, ApplyError::Permanent(_)));
    }
}
