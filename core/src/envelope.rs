//! The event envelope: the wire-level unit of propagation.
//!
//! Every state change of an auction produces exactly one [`EventEnvelope`]. The
//! envelope carries the aggregate it belongs to, what kind of change happened,
//! a per-aggregate [`SequenceNumber`], and a kind-specific JSON payload.
//!
//! # Ordering
//!
//! The bus gives no cross-message ordering guarantee. The sequence number is
//! the only ordering key the rest of the system relies on:
//!
//! - It starts at 1 for the first event recorded for an aggregate
//! - Each further event for the same aggregate gets `previous + 1`
//! - It is assigned inside the transaction that records the event
//!
//! # Wire Format
//!
//! Envelopes travel as JSON:
//!
//! ```json
//! {
//!   "envelope_id": "6f1c...",
//!   "aggregate_id": "afbee524-5972-4075-8800-7d1f9d7b0a0c",
//!   "kind": "Updated",
//!   "schema_version": 1,
//!   "sequence": 2,
//!   "occurred_at": "2025-01-01T00:00:00Z",
//!   "payload": { "status": "Live" }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use bidstream_core::envelope::{AggregateId, EventEnvelope, EventKind, SequenceNumber};
//! use chrono::Utc;
//!
//! let envelope = EventEnvelope::new(
//!     AggregateId::new(),
//!     EventKind::Deleted,
//!     SequenceNumber::FIRST,
//!     Utc::now(),
//!     serde_json::json!({}),
//! );
//!
//! let bytes = envelope.to_bytes().unwrap();
//! let decoded = EventEnvelope::from_bytes(&bytes).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Schema version written by this build of the write-service.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Errors raised while encoding, decoding or validating envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The envelope could not be encoded.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    /// The bytes are not a valid envelope.
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// The envelope was written with a schema this build does not understand.
    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchema {
        /// Version found in the envelope.
        found: u32,
        /// Version this build understands.
        supported: u32,
    },

    /// The payload does not match the shape required by the event kind.
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload {
        /// Kind of the envelope.
        kind: EventKind,
        /// Decoder message.
        reason: String,
    },

    /// The sequence number is outside the range stores can hold.
    #[error("Sequence {found} exceeds the largest storable sequence {max}")]
    SequenceOutOfRange {
        /// Sequence found in the envelope.
        found: SequenceNumber,
        /// Largest accepted sequence.
        max: SequenceNumber,
    },

    /// Unknown event kind string.
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    /// Identifier string is not a UUID.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

/// Stable identifier of an auction aggregate.
///
/// Owned by the write-service and used as the partition key on the bus and
/// as the primary key of every read model record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

impl AggregateId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AggregateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AggregateId {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EnvelopeError::InvalidId(format!("{s}: {e}")))
    }
}

impl From<Uuid> for AggregateId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Unique identifier of one envelope.
///
/// Keys outbox entries and fault entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Deterministic identifier for a message position such as
    /// `topic/partition/offset`. The same origin always yields the same id.
    #[must_use]
    pub fn for_origin(origin: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, origin.as_bytes()))
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EnvelopeId {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EnvelopeError::InvalidId(format!("{s}: {e}")))
    }
}

/// Per-aggregate, contiguous, monotonically increasing sequence number.
///
/// # Examples
///
/// ```
/// use bidstream_core::envelope::SequenceNumber;
///
/// let first = SequenceNumber::FIRST;
/// assert_eq!(first.value(), 1);
/// assert!(first.next().directly_follows(first));
/// assert!(!SequenceNumber::new(4).directly_follows(first));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Sequence number of the first event recorded for an aggregate.
    pub const FIRST: Self = Self(1);

    /// Largest sequence number accepted anywhere; stores keep it as `BIGINT`.
    pub const MAX: Self = Self(i64::MAX.unsigned_abs());

    /// Create a sequence number from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence number that must follow this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// `true` when `self == previous + 1`.
    #[must_use]
    pub const fn directly_follows(self, previous: Self) -> bool {
        self.0 == previous.0 + 1
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// What happened to the aggregate.
///
/// A closed set: consumers dispatch on it with an exhaustive `match`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The auction was created.
    Created,
    /// Some auction fields changed.
    Updated,
    /// The auction was deleted. Terminal.
    Deleted,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 3] = [Self::Created, Self::Updated, Self::Deleted];

    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Deleted => "Deleted",
        }
    }

    /// Parse the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::UnknownKind`] for anything but the three kinds.
    pub fn parse(s: &str) -> Result<Self, EnvelopeError> {
        match s {
            "Created" => Ok(Self::Created),
            "Updated" => Ok(Self::Updated),
            "Deleted" => Ok(Self::Deleted),
            other => Err(EnvelopeError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, sequenced, versioned event message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id of this envelope.
    pub envelope_id: EnvelopeId,

    /// Aggregate the event belongs to.
    pub aggregate_id: AggregateId,

    /// What happened.
    pub kind: EventKind,

    /// Payload schema version.
    pub schema_version: u32,

    /// Position of this event in the aggregate's history.
    pub sequence: SequenceNumber,

    /// When the write-service recorded the event.
    pub occurred_at: DateTime<Utc>,

    /// Kind-specific fields.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build an envelope with a fresh [`EnvelopeId`] and the current schema version.
    #[must_use]
    pub fn new(
        aggregate_id: AggregateId,
        kind: EventKind,
        sequence: SequenceNumber,
        occurred_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            envelope_id: EnvelopeId::new(),
            aggregate_id,
            kind,
            schema_version: CURRENT_SCHEMA_VERSION,
            sequence,
            occurred_at,
            payload,
        }
    }

    /// Encode to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode from the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }

    /// Check the schema version against [`CURRENT_SCHEMA_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::UnsupportedSchema`] for any other version.
    pub const fn check_schema(&self) -> Result<(), EnvelopeError> {
        if self.schema_version == CURRENT_SCHEMA_VERSION {
            Ok(())
        } else {
            Err(EnvelopeError::UnsupportedSchema {
                found: self.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            })
        }
    }

    /// Check the sequence number against [`SequenceNumber::MAX`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SequenceOutOfRange`] above the maximum.
    pub const fn check_sequence(&self) -> Result<(), EnvelopeError> {
        if self.sequence.value() <= SequenceNumber::MAX.value() {
            Ok(())
        } else {
            Err(EnvelopeError::SequenceOutOfRange {
                found: self.sequence,
                max: SequenceNumber::MAX,
            })
        }
    }

    /// Partition key for the bus: the aggregate id.
    #[must_use]
    pub fn partition_key(&self) -> String {
        self.aggregate_id.to_string()
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventEnvelope {{ id: {}, aggregate: {}, kind: {}, seq: {} }}",
            self.envelope_id, self.aggregate_id, self.kind, self.sequence
        )
    }
}

/// Best-effort extraction of the envelope id from bytes that may not decode.
///
/// Used when dead-lettering malformed messages so the fault entry can still be
/// keyed by the id the producer assigned.
#[must_use]
pub fn sniff_envelope_id(bytes: &[u8]) -> Option<EnvelopeId> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("envelope_id")?
        .as_str()
        .and_then(|s| s.parse().ok())
}
