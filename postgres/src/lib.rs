//! `PostgreSQL` storage for the write side of Bidstream.
//!
//! # Overview
//!
//! - [`PgUnitOfWork`]: one database transaction carrying both the aggregate
//!   mutation and its outbox entries, so they commit or roll back together
//! - [`PostgresOutboxStore`]: the relay's view of the `outbox` table
//! - [`PostgresFaultStore`]: durable dead letters awaiting an operator
//!
//! # Example
//!
//! ```no_run
//! use bidstream_core::envelope::AggregateId;
//! use bidstream_postgres::{PgUnitOfWork, PostgresOutboxStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresOutboxStore::connect("postgres://localhost/auctions").await?;
//! store.migrate().await?;
//!
//! let mut uow = PgUnitOfWork::begin(store.pool()).await?;
//! sqlx::query("UPDATE auctions SET mileage = 61000 WHERE id = $1")
//!     .bind(*AggregateId::new().as_uuid())
//!     .execute(uow.conn())
//!     .await?;
//! // publisher.record(&mut uow, id, &patch).await?;
//! uow.commit().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fault_store;
pub mod outbox;

pub use fault_store::PostgresFaultStore;
pub use outbox::{PgUnitOfWork, PostgresOutboxStore};

use bidstream_core::envelope::SequenceNumber;

/// Database `BIGINT` for a sequence number.
pub(crate) fn sequence_to_db(sequence: SequenceNumber) -> Result<i64, String> {
    i64::try_from(sequence.value()).map_err(|_| format!("sequence {sequence} exceeds BIGINT"))
}

/// Sequence number from a database `BIGINT`.
pub(crate) fn sequence_from_db(value: i64) -> Result<SequenceNumber, String> {
    u64::try_from(value)
        .map(SequenceNumber::new)
        .map_err(|_| format!("negative sequence {value} in database"))
}

/// Database `INTEGER` for an attempt counter, saturating.
pub(crate) fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Attempt counter from a database `INTEGER`, clamping negatives to zero.
pub(crate) fn attempts_from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
