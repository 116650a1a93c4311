//! `PostgreSQL` search read model.
//!
//! # Schema
//!
//! ```text
//! search_items            one row per live auction, with last_applied
//! search_item_tombstones  deleted auctions and the deleting sequence
//! search_item_stash       updates waiting for their predecessor
//! ```
//!
//! The read database can be separate from the write-side one; see
//! [`PostgresSearchItemStore::connect`].
//!
//! # Example
//!
//! ```ignore
//! use bidstream_projections::PostgresSearchItemStore;
//!
//! let store = PostgresSearchItemStore::connect("postgres://localhost/search").await?;
//! store.migrate().await?;
//! let projector = SearchProjector::new(Arc::new(store), clock);
//! ```

use bidstream_core::auction::AuctionStatus;
use bidstream_core::envelope::{AggregateId, EventEnvelope, SequenceNumber};
use bidstream_core::projection::{ReadState, SearchItem, SearchItemStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

fn unavailable(context: &str, e: &sqlx::Error) -> StoreError {
    StoreError::Unavailable(format!("{context}: {e}"))
}

fn unacknowledged(context: &str, e: &sqlx::Error) -> StoreError {
    StoreError::Unacknowledged(format!("{context}: {e}"))
}

fn sequence_to_db(sequence: SequenceNumber) -> Result<i64, StoreError> {
    i64::try_from(sequence.value())
        .map_err(|_| StoreError::Serialization(format!("sequence {sequence} exceeds BIGINT")))
}

fn sequence_from_db(value: i64) -> Result<SequenceNumber, StoreError> {
    u64::try_from(value)
        .map(SequenceNumber::new)
        .map_err(|_| StoreError::Serialization(format!("negative sequence {value}")))
}

/// PostgreSQL-backed [`SearchItemStore`].
///
/// Every method awaits the database's acknowledgement before returning, and
/// multi-statement writes run in one transaction.
#[derive(Clone)]
pub struct PostgresSearchItemStore {
    pool: PgPool,
}

impl PostgresSearchItemStore {
    /// Create a store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store with its own connection to the read database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| unavailable("Failed to connect", &e))?;

        Ok(Self::new(pool))
    }

    /// Create the read-model tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch a live record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn get(&self, aggregate_id: AggregateId) -> Result<Option<SearchItem>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT aggregate_id, make, model, year, color, mileage, image_url, seller,
                   winner, reserve_price, sold_amount, current_high_bid,
                   created_at, updated_at, auction_end, status, last_applied
            FROM search_items
            WHERE aggregate_id = $1
            ",
        )
        .bind(*aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("Failed to load item", &e))?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    fn row_to_item(row: &PgRow) -> Result<SearchItem, StoreError> {
        let get_err = |e: sqlx::Error| StoreError::Serialization(e.to_string());

        let status: String = row.try_get("status").map_err(get_err)?;
        let last_applied: i64 = row.try_get("last_applied").map_err(get_err)?;

        Ok(SearchItem {
            aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(get_err)?),
            make: row.try_get("make").map_err(get_err)?,
            model: row.try_get("model").map_err(get_err)?,
            year: row.try_get("year").map_err(get_err)?,
            color: row.try_get("color").map_err(get_err)?,
            mileage: row.try_get("mileage").map_err(get_err)?,
            image_url: row.try_get("image_url").map_err(get_err)?,
            seller: row.try_get("seller").map_err(get_err)?,
            winner: row.try_get("winner").map_err(get_err)?,
            reserve_price: row.try_get("reserve_price").map_err(get_err)?,
            sold_amount: row.try_get("sold_amount").map_err(get_err)?,
            current_high_bid: row.try_get("current_high_bid").map_err(get_err)?,
            created_at: row.try_get("created_at").map_err(get_err)?,
            updated_at: row.try_get("updated_at").map_err(get_err)?,
            auction_end: row.try_get("auction_end").map_err(get_err)?,
            status: AuctionStatus::parse(&status).map_err(StoreError::Serialization)?,
            last_applied: sequence_from_db(last_applied)?,
        })
    }
}

impl SearchItemStore for PostgresSearchItemStore {
    async fn load(&self, aggregate_id: AggregateId) -> Result<ReadState, StoreError> {
        if let Some(item) = self.get(aggregate_id).await? {
            return Ok(ReadState::Live(item));
        }

        let tombstone: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT last_applied, deleted_at FROM search_item_tombstones WHERE aggregate_id = $1",
        )
        .bind(*aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("Failed to load tombstone", &e))?;

        match tombstone {
            Some((last_applied, deleted_at)) => Ok(ReadState::Deleted {
                last_applied: sequence_from_db(last_applied)?,
                deleted_at,
            }),
            None => Ok(ReadState::Absent),
        }
    }

    async fn upsert(&self, item: &SearchItem) -> Result<(), StoreError> {
        let last_applied = sequence_to_db(item.last_applied)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable("Failed to start transaction", &e))?;

        sqlx::query(
            r"
            INSERT INTO search_items (
                aggregate_id, make, model, year, color, mileage, image_url, seller,
                winner, reserve_price, sold_amount, current_high_bid,
                created_at, updated_at, auction_end, status, last_applied
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (aggregate_id) DO UPDATE SET
                make = EXCLUDED.make,
                model = EXCLUDED.model,
                year = EXCLUDED.year,
                color = EXCLUDED.color,
                mileage = EXCLUDED.mileage,
                image_url = EXCLUDED.image_url,
                seller = EXCLUDED.seller,
                winner = EXCLUDED.winner,
                reserve_price = EXCLUDED.reserve_price,
                sold_amount = EXCLUDED.sold_amount,
                current_high_bid = EXCLUDED.current_high_bid,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                auction_end = EXCLUDED.auction_end,
                status = EXCLUDED.status,
                last_applied = EXCLUDED.last_applied
            ",
        )
        .bind(*item.aggregate_id.as_uuid())
        .bind(&item.make)
        .bind(&item.model)
        .bind(item.year)
        .bind(&item.color)
        .bind(item.mileage)
        .bind(&item.image_url)
        .bind(&item.seller)
        .bind(&item.winner)
        .bind(item.reserve_price)
        .bind(item.sold_amount)
        .bind(item.current_high_bid)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.auction_end)
        .bind(item.status.as_str())
        .bind(last_applied)
        .execute(&mut *tx)
        .await
        .map_err(|e| unacknowledged("Failed to upsert item", &e))?;

        sqlx::query("DELETE FROM search_item_tombstones WHERE aggregate_id = $1")
            .bind(*item.aggregate_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| unacknowledged("Failed to clear tombstone", &e))?;

        tx.commit()
            .await
            .map_err(|e| unacknowledged("Failed to commit upsert", &e))
    }

    async fn remove(
        &self,
        aggregate_id: AggregateId,
        sequence: SequenceNumber,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let last_applied = sequence_to_db(sequence)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable("Failed to start transaction", &e))?;

        sqlx::query("DELETE FROM search_items WHERE aggregate_id = $1")
            .bind(*aggregate_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| unacknowledged("Failed to delete item", &e))?;

        sqlx::query(
            r"
            INSERT INTO search_item_tombstones (aggregate_id, last_applied, deleted_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET last_applied = EXCLUDED.last_applied, deleted_at = EXCLUDED.deleted_at
            ",
        )
        .bind(*aggregate_id.as_uuid())
        .bind(last_applied)
        .bind(deleted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| unacknowledged("Failed to write tombstone", &e))?;

        tx.commit()
            .await
            .map_err(|e| unacknowledged("Failed to commit delete", &e))
    }

    async fn stash(
        &self,
        envelope: &EventEnvelope,
        stashed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sequence = sequence_to_db(envelope.sequence)?;
        let body = serde_json::to_value(envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO search_item_stash (aggregate_id, sequence, envelope, stashed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, sequence) DO NOTHING
            ",
        )
        .bind(*envelope.aggregate_id.as_uuid())
        .bind(sequence)
        .bind(body)
        .bind(stashed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unacknowledged("Failed to stash envelope", &e))?;

        Ok(())
    }

    async fn stashed(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r"
            SELECT envelope
            FROM search_item_stash
            WHERE aggregate_id = $1
            ORDER BY sequence ASC
            ",
        )
        .bind(*aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("Failed to load stash", &e))?;

        rows.into_iter()
            .map(|(body,)| {
                serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn discard_stashed(
        &self,
        aggregate_id: AggregateId,
        through: SequenceNumber,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM search_item_stash WHERE aggregate_id = $1 AND sequence <= $2")
            .bind(*aggregate_id.as_uuid())
            .bind(sequence_to_db(through)?)
            .execute(&self.pool)
            .await
            .map_err(|e| unacknowledged("Failed to discard stash", &e))?;

        Ok(())
    }

    async fn unstash(
        &self,
        aggregate_id: AggregateId,
        sequence: SequenceNumber,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM search_item_stash WHERE aggregate_id = $1 AND sequence = $2")
            .bind(*aggregate_id.as_uuid())
            .bind(sequence_to_db(sequence)?)
            .execute(&self.pool)
            .await
            .map_err(|e| unacknowledged("Failed to unstash envelope", &e))?;

        Ok(())
    }

    async fn expired_stash(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r"
            SELECT envelope
            FROM search_item_stash
            WHERE stashed_at < $1
            ORDER BY stashed_at ASC, aggregate_id ASC, sequence ASC
            LIMIT $2
            ",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("Failed to load expired stash", &e))?;

        if !rows.is_empty() {
            tracing::debug!(count = rows.len(), cutoff = %cutoff, "Loaded expired stash entries");
        }

        rows.into_iter()
            .map(|(body,)| {
                serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn out_of_range_sequences_are_serialization_errors() {
        assert_eq!(sequence_to_db(SequenceNumber::new(9)).unwrap(), 9);
        assert!(matches!(
            sequence_to_db(SequenceNumber::new(u64::MAX)),
            Err(StoreError::Serialization(_))
        ));
        assert!(matches!(sequence_from_db(-1), Err(StoreError::Serialization(_))));
    }
}
