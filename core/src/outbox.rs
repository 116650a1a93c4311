//! Transactional outbox.
//!
//! The write-service records an [`OutboxEntry`] inside the same unit of work
//! that mutates the aggregate. Either both become durable or neither does. A
//! separate relay later drains pending entries to the [`MessageBus`].
//!
//! Two traits split the concerns:
//!
//! - [`OutboxTransaction`]: the request-side view of an open unit of work
//!   (allocate the next sequence number, append an entry)
//! - [`OutboxStore`]: the relay-side view of the outbox table
//!
//! [`MessageBus`]: crate::event_bus::MessageBus

use crate::envelope::{AggregateId, EnvelopeId, EventEnvelope, SequenceNumber};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while recording events or touching the outbox table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// The envelope could not be serialized for storage.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The unit of work could not commit; nothing was persisted.
    #[error("Commit failed: {0}")]
    CommitFailed(String),
}

/// One row of the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// The envelope to publish.
    pub envelope: EventEnvelope,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
    /// Set once the bus confirmed durable acceptance.
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub attempts: u32,
    /// Most recent publish error.
    pub last_error: Option<String>,
    /// Earliest time the relay may try again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set when the bus rejected the envelope permanently.
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// A fresh, pending entry.
    #[must_use]
    pub const fn pending(envelope: EventEnvelope, created_at: DateTime<Utc>) -> Self {
        Self {
            envelope,
            created_at,
            published_at: None,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            dead_lettered_at: None,
        }
    }

    /// Key of the entry.
    #[must_use]
    pub const fn envelope_id(&self) -> EnvelopeId {
        self.envelope.envelope_id
    }

    /// Neither published nor dead-lettered.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.published_at.is_none() && self.dead_lettered_at.is_none()
    }

    /// Pending and due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// An open unit of work that can record outbox entries.
///
/// Implemented by the write-side transaction type, which also carries the
/// aggregate mutation. Committing is the implementor's concern.
pub trait OutboxTransaction: Send {
    /// Allocate the next sequence number for `aggregate_id`.
    ///
    /// Returns [`SequenceNumber::FIRST`] for an aggregate with no events yet.
    /// Concurrent transactions on the same aggregate are serialized by the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the allocation fails.
    fn next_sequence(
        &mut self,
        aggregate_id: AggregateId,
    ) -> impl Future<Output = Result<SequenceNumber, PersistenceError>> + Send;

    /// Append an entry to the outbox as part of this unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the insert fails.
    fn append(
        &mut self,
        entry: &OutboxEntry,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

/// Relay-side access to the outbox table.
pub trait OutboxStore: Send + Sync {
    /// Pending entries due at `now`, in recording order, at most `limit`.
    ///
    /// Recording order keeps each aggregate's entries in sequence order. An
    /// entry is held back while an earlier pending entry of the same aggregate
    /// is waiting out its backoff, so a retry never lets a later event
    /// overtake it.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the query fails.
    fn fetch_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + '_>>;

    /// Mark an entry published. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the update fails.
    fn mark_published(
        &self,
        envelope_id: EnvelopeId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Record a failed publish attempt and when to try again.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the update fails.
    fn record_publish_failure(
        &self,
        envelope_id: EnvelopeId,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Take an entry out of the pending set after a permanent bus rejection.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the update fails.
    fn mark_dead_lettered(
        &self,
        envelope_id: EnvelopeId,
        error: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the query fails.
    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>>;
}
