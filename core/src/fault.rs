//! Dead letters and the fault store.
//!
//! Messages that exhausted their redelivery budget, or that can never be
//! processed, leave the bus as a [`DeadLetter`] and are persisted as a
//! [`FaultEntry`]. Operators inspect entries and either replay them to their
//! original topic or discard them with a reason. Nothing is dropped silently.

use crate::envelope::{sniff_envelope_id, EnvelopeId, EventEnvelope};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A message leaving the bus for the fault path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Id of the failed envelope, derived from its bus position if the bytes
    /// carried none.
    pub envelope_id: EnvelopeId,
    /// Topic the message was published to.
    pub original_topic: String,
    /// Consumer group that gave up, `None` when the producer side failed.
    pub consumer_group: Option<String>,
    /// Delivery or publish attempts made.
    pub attempts: u32,
    /// Last error observed.
    pub last_error: String,
    /// The message exactly as it travelled.
    pub raw_envelope: Vec<u8>,
    /// When the message was given up on.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Dead letter for a decoded envelope.
    ///
    /// Falls back to an empty body if the envelope cannot be re-encoded, which
    /// keeps the id and error visible to operators.
    #[must_use]
    pub fn from_envelope(
        envelope: &EventEnvelope,
        original_topic: impl Into<String>,
        consumer_group: Option<String>,
        attempts: u32,
        last_error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope_id: envelope.envelope_id,
            original_topic: original_topic.into(),
            consumer_group,
            attempts,
            last_error: last_error.into(),
            raw_envelope: envelope.to_bytes().unwrap_or_default(),
            failed_at,
        }
    }

    /// Dead letter for bytes that may not decode at all.
    ///
    /// `origin` is the message's position on the bus, such as
    /// `topic/partition/offset`. It keys the letter when the bytes carry no
    /// envelope id, so every redelivery of one record folds into one entry.
    #[must_use]
    pub fn from_raw(
        raw: Vec<u8>,
        origin: &str,
        original_topic: impl Into<String>,
        consumer_group: Option<String>,
        attempts: u32,
        last_error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope_id: sniff_envelope_id(&raw).unwrap_or_else(|| EnvelopeId::for_origin(origin)),
            original_topic: original_topic.into(),
            consumer_group,
            attempts,
            last_error: last_error.into(),
            raw_envelope: raw,
            failed_at,
        }
    }
}

/// Resolution state of a fault entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultStatus {
    /// Awaiting an operator.
    Pending,
    /// Re-published to its original topic.
    Replayed,
    /// Dropped on purpose, with a recorded reason.
    Discarded,
}

impl FaultStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replayed => "replayed",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] for unknown statuses.
    pub fn parse(s: &str) -> Result<Self, FaultError> {
        match s {
            "pending" => Ok(Self::Pending),
            "replayed" => Ok(Self::Replayed),
            "discarded" => Ok(Self::Discarded),
            _ => Err(FaultError::Storage(format!("Invalid fault status: {s}"))),
        }
    }
}

/// A persisted dead letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEntry {
    /// Key of the entry.
    pub envelope_id: EnvelopeId,
    /// Topic to replay to.
    pub original_topic: String,
    /// Consumer group that gave up, if any.
    pub consumer_group: Option<String>,
    /// Attempts across all failures of this envelope.
    pub attempts: u32,
    /// Most recent error.
    pub last_error: String,
    /// The message exactly as it travelled.
    pub raw_envelope: Vec<u8>,
    /// First time the envelope was dead-lettered.
    pub first_failed_at: DateTime<Utc>,
    /// Most recent time the envelope was dead-lettered.
    pub last_failed_at: DateTime<Utc>,
    /// Current status.
    pub status: FaultStatus,
    /// When the entry was replayed or discarded.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes (discard reason).
    pub resolution_notes: Option<String>,
}

impl FaultEntry {
    /// A new pending entry for `letter`.
    #[must_use]
    pub fn from_letter(letter: DeadLetter) -> Self {
        Self {
            envelope_id: letter.envelope_id,
            original_topic: letter.original_topic,
            consumer_group: letter.consumer_group,
            attempts: letter.attempts,
            last_error: letter.last_error,
            raw_envelope: letter.raw_envelope,
            first_failed_at: letter.failed_at,
            last_failed_at: letter.failed_at,
            status: FaultStatus::Pending,
            resolved_at: None,
            resolution_notes: None,
        }
    }

    /// Fold a repeat failure of the same envelope into this entry.
    ///
    /// Keeps `first_failed_at`, accumulates attempts and reopens the entry.
    pub fn absorb(&mut self, letter: DeadLetter) {
        self.original_topic = letter.original_topic;
        self.consumer_group = letter.consumer_group;
        self.attempts = self.attempts.saturating_add(letter.attempts);
        self.last_error = letter.last_error;
        self.raw_envelope = letter.raw_envelope;
        self.last_failed_at = letter.failed_at;
        self.status = FaultStatus::Pending;
        self.resolved_at = None;
        self.resolution_notes = None;
    }

    /// Decode the stored envelope.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Malformed`] if the raw bytes are not a valid
    /// envelope of a supported schema.
    pub fn decode(&self) -> Result<EventEnvelope, FaultError> {
        let envelope = EventEnvelope::from_bytes(&self.raw_envelope)
            .map_err(|e| FaultError::Malformed(e.to_string()))?;
        envelope
            .check_schema()
            .map_err(|e| FaultError::Malformed(e.to_string()))?;
        Ok(envelope)
    }
}

/// Errors raised by the fault store and fault handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaultError {
    /// The fault store is unavailable or rejected the write.
    #[error("Fault store error: {0}")]
    Storage(String),

    /// No entry for this envelope id.
    #[error("No fault entry for envelope {0}")]
    NotFound(EnvelopeId),

    /// The stored bytes cannot be replayed.
    #[error("Fault entry is not a replayable envelope: {0}")]
    Malformed(String),

    /// Re-publishing the envelope failed.
    #[error("Replay publish failed: {0}")]
    Publish(String),
}

/// Durable storage for fault entries.
///
/// Uses the boxed-future style so one store can be shared as
/// `Arc<dyn FaultStore>` by the sink side and the operator side.
pub trait FaultStore: Send + Sync {
    /// Insert or fold a dead letter, keyed by envelope id.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the write fails.
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<FaultEntry, FaultError>> + Send + '_>>;

    /// Fetch one entry.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the read fails.
    fn get(
        &self,
        envelope_id: EnvelopeId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FaultEntry>, FaultError>> + Send + '_>>;

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the read fails.
    fn list_by_status(
        &self,
        status: FaultStatus,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FaultEntry>, FaultError>> + Send + '_>>;

    /// Mark an entry replayed.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::NotFound`] if there is no such entry.
    fn mark_replayed(
        &self,
        envelope_id: EnvelopeId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>>;

    /// Mark an entry discarded with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::NotFound`] if there is no such entry.
    fn mark_discarded(
        &self,
        envelope_id: EnvelopeId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>>;

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::Storage`] if the read fails.
    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64, FaultError>> + Send + '_>>;
}

/// Destination for messages the bus gives up on.
pub trait DeadLetterSink: Send + Sync {
    /// Persist a dead letter. The bus keeps the message until this succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError`] if the letter could not be persisted.
    fn dead_letter(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>>;
}
