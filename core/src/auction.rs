//! Auction event payloads.
//!
//! The envelope carries its payload as raw JSON so that the bus and the outbox
//! stay agnostic of the domain. These types are the kind-specific shapes the
//! write-service produces and the projections decode.
//!
//! | Kind | Payload |
//! |---|---|
//! | `Created` | [`AuctionCreated`] (full snapshot) |
//! | `Updated` | [`AuctionUpdated`] (patch: absent fields are unchanged) |
//! | `Deleted` | [`AuctionDeleted`] (empty) |

use crate::envelope::{EnvelopeError, EventEnvelope, EventKind};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an auction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuctionStatus {
    /// Accepting bids.
    Live,
    /// Ended with a sale.
    Finished,
    /// Ended without reaching the reserve.
    ReserveNotMet,
}

impl AuctionStatus {
    /// Wire/database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::Finished => "Finished",
            Self::ReserveNotMet => "ReserveNotMet",
        }
    }

    /// Parse the wire/database representation.
    ///
    /// # Errors
    ///
    /// Returns an error string for unknown statuses.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "Live" => Ok(Self::Live),
            "Finished" => Ok(Self::Finished),
            "ReserveNotMet" => Ok(Self::ReserveNotMet),
            other => Err(format!("Invalid auction status: {other}")),
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload type bound to exactly one [`EventKind`].
pub trait AuctionEvent: Serialize + DeserializeOwned {
    /// The kind envelopes carrying this payload have.
    const KIND: EventKind;

    /// Decode the payload of `envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedPayload`] if the envelope has another
    /// kind or the JSON does not fit this payload.
    fn decode(envelope: &EventEnvelope) -> Result<Self, EnvelopeError> {
        if envelope.kind != Self::KIND {
            return Err(EnvelopeError::MalformedPayload {
                kind: envelope.kind,
                reason: format!("expected a {} payload", Self::KIND),
            });
        }
        serde_json::from_value(envelope.payload.clone()).map_err(|e| {
            EnvelopeError::MalformedPayload {
                kind: envelope.kind,
                reason: e.to_string(),
            }
        })
    }
}

/// Full snapshot of a newly created auction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionCreated {
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
    /// Reserve price in whole currency units.
    pub reserve_price: i64,
    /// Highest bid so far, if any.
    #[serde(default)]
    pub current_high_bid: Option<i64>,
    /// When bidding closes.
    pub auction_end: DateTime<Utc>,
    /// Initial status (normally `Live`).
    pub status: AuctionStatus,
    /// When the auction was created on the write side.
    pub created_at: DateTime<Utc>,
}

impl AuctionEvent for AuctionCreated {
    const KIND: EventKind = EventKind::Created;
}

/// Partial update; only the fields present change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionUpdated {
    /// New make.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    /// New model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// New year.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    /// New color.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// New mileage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mileage: Option<i32>,
    /// New image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// New highest bid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_high_bid: Option<i64>,
    /// New status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AuctionStatus>,
    /// Winning bidder, set when the auction finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    /// Final price, set when the auction finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sold_amount: Option<i64>,
    /// Moved end time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auction_end: Option<DateTime<Utc>>,
}

impl AuctionEvent for AuctionUpdated {
    const KIND: EventKind = EventKind::Updated;
}

impl AuctionUpdated {
    /// `true` if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Deletion marker. Carries no fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionDeleted {}

impl AuctionEvent for AuctionDeleted {
    const KIND: EventKind = EventKind::Deleted;
}
