//! Transactional outbox on `PostgreSQL`.
//!
//! The request path opens a [`PgUnitOfWork`], mutates the aggregate through
//! [`PgUnitOfWork::conn`], records events through the publisher and commits.
//! The relay reads the same table through [`PostgresOutboxStore`].
//!
//! ```sql
//! aggregate_sequences (aggregate_id PK, last_sequence)
//! outbox (position BIGSERIAL PK, envelope_id UNIQUE, aggregate_id, sequence, ...)
//! ```
//!
//! `position` is the recording order. Sequence numbers are allocated by
//! upserting `aggregate_sequences`, whose row lock is held until the unit of
//! work ends, so two transactions on the same aggregate cannot interleave.

use crate::{attempts_from_db, attempts_to_db, sequence_from_db, sequence_to_db};
use bidstream_core::envelope::{
    AggregateId, EnvelopeId, EventEnvelope, EventKind, SequenceNumber,
};
use bidstream_core::outbox::{OutboxEntry, OutboxStore, OutboxTransaction, PersistenceError};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;

const ENTRY_COLUMNS: &str = "envelope_id, aggregate_id, kind, schema_version, sequence, \
     occurred_at, payload, created_at, published_at, attempts, last_error, \
     next_attempt_at, dead_lettered_at";

fn db_error(e: &sqlx::Error) -> PersistenceError {
    PersistenceError::Database(e.to_string())
}

/// One write-side database transaction.
///
/// Dropping it without [`commit`](Self::commit) rolls everything back,
/// including allocated sequence numbers.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    /// Start a transaction on `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if no connection is available.
    pub async fn begin(pool: &PgPool) -> Result<Self, PersistenceError> {
        let tx = pool.begin().await.map_err(|e| {
            PersistenceError::Database(format!("Failed to start transaction: {e}"))
        })?;
        Ok(Self { tx })
    }

    /// Connection for the aggregate mutation.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Make the mutation and every recorded entry durable.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::CommitFailed`]; nothing was persisted.
    pub async fn commit(self) -> Result<(), PersistenceError> {
        self.tx
            .commit()
            .await
            .map_err(|e| PersistenceError::CommitFailed(e.to_string()))
    }

    /// Abandon the unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the rollback could not be sent.
    pub async fn rollback(self) -> Result<(), PersistenceError> {
        self.tx.rollback().await.map_err(|e| db_error(&e))
    }
}

impl OutboxTransaction for PgUnitOfWork {
    async fn next_sequence(
        &mut self,
        aggregate_id: AggregateId,
    ) -> Result<SequenceNumber, PersistenceError> {
        let (last,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO aggregate_sequences (aggregate_id, last_sequence)
            VALUES ($1, 1)
            ON CONFLICT (aggregate_id)
            DO UPDATE SET last_sequence = aggregate_sequences.last_sequence + 1
            RETURNING last_sequence
            ",
        )
        .bind(*aggregate_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error(&e))?;

        sequence_from_db(last).map_err(PersistenceError::Database)
    }

    async fn append(&mut self, entry: &OutboxEntry) -> Result<(), PersistenceError> {
        let envelope = &entry.envelope;
        let sequence = sequence_to_db(envelope.sequence).map_err(PersistenceError::Serialization)?;
        let schema_version = i32::try_from(envelope.schema_version)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO outbox (
                envelope_id, aggregate_id, kind, schema_version, sequence,
                occurred_at, payload, created_at, attempts
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(*envelope.envelope_id.as_uuid())
        .bind(*envelope.aggregate_id.as_uuid())
        .bind(envelope.kind.as_str())
        .bind(schema_version)
        .bind(sequence)
        .bind(envelope.occurred_at)
        .bind(&envelope.payload)
        .bind(entry.created_at)
        .bind(attempts_to_db(entry.attempts))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error(&e))?;

        Ok(())
    }
}

/// `PostgreSQL`-backed [`OutboxStore`] used by the relay.
///
/// Run a single relay per outbox table; entries are not claimed between
/// fetch and publish.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| PersistenceError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// The underlying pool, for opening units of work.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox and fault tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PersistenceError::Database(format!("Migration failed: {e}")))
    }

    /// Delete published rows older than `cutoff`. Returns the number removed.
    ///
    /// Dead-lettered rows are kept; their fault entries point back at them.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Database`] if the delete fails.
    pub async fn purge_published(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM outbox WHERE published_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error(&e))?;

        tracing::info!(rows = result.rows_affected(), "Purged published outbox entries");
        Ok(result.rows_affected())
    }

    async fn update(
        &self,
        envelope_id: EnvelopeId,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), PersistenceError> {
        let result = query.execute(&self.pool).await.map_err(|e| db_error(&e))?;
        if result.rows_affected() == 0 {
            tracing::warn!(envelope_id = %envelope_id, "Outbox entry to update not found");
        }
        Ok(())
    }

    fn row_to_entry(row: &PgRow) -> Result<OutboxEntry, PersistenceError> {
        let get_err = |e: sqlx::Error| PersistenceError::Serialization(e.to_string());

        let kind: String = row.try_get("kind").map_err(get_err)?;
        let schema_version: i32 = row.try_get("schema_version").map_err(get_err)?;
        let sequence: i64 = row.try_get("sequence").map_err(get_err)?;
        let attempts: i32 = row.try_get("attempts").map_err(get_err)?;

        let envelope = EventEnvelope {
            envelope_id: EnvelopeId::from_uuid(row.try_get("envelope_id").map_err(get_err)?),
            aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(get_err)?),
            kind: EventKind::parse(&kind)
                .map_err(|e| PersistenceError::Serialization(e.to_string()))?,
            schema_version: u32::try_from(schema_version)
                .map_err(|e| PersistenceError::Serialization(e.to_string()))?,
            sequence: sequence_from_db(sequence).map_err(PersistenceError::Serialization)?,
            occurred_at: row.try_get("occurred_at").map_err(get_err)?,
            payload: row.try_get("payload").map_err(get_err)?,
        };

        Ok(OutboxEntry {
            envelope,
            created_at: row.try_get("created_at").map_err(get_err)?,
            published_at: row.try_get("published_at").map_err(get_err)?,
            attempts: attempts_from_db(attempts),
            last_error: row.try_get("last_error").map_err(get_err)?,
            next_attempt_at: row.try_get("next_attempt_at").map_err(get_err)?,
            dead_lettered_at: row.try_get("dead_lettered_at").map_err(get_err)?,
        })
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn fetch_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Batch sizes are small
            let limit = limit as i64;

            // An entry is skipped while an earlier entry of its aggregate is
            // still backing off.
            let sql = format!(
                r"
                SELECT {ENTRY_COLUMNS}
                FROM outbox o
                WHERE o.published_at IS NULL
                  AND o.dead_lettered_at IS NULL
                  AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= $1)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox earlier
                      WHERE earlier.aggregate_id = o.aggregate_id
                        AND earlier.position < o.position
                        AND earlier.published_at IS NULL
                        AND earlier.dead_lettered_at IS NULL
                        AND earlier.next_attempt_at > $1
                  )
                ORDER BY o.position ASC
                LIMIT $2
                "
            );

            let rows = sqlx::query(&sql)
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error(&e))?;

            rows.iter().map(Self::row_to_entry).collect()
        })
    }

    fn mark_published(
        &self,
        envelope_id: EnvelopeId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox
                SET published_at = COALESCE(published_at, $2)
                WHERE envelope_id = $1
                ",
            )
            .bind(*envelope_id.as_uuid())
            .bind(at);
            self.update(envelope_id, query).await
        })
    }

    fn record_publish_failure(
        &self,
        envelope_id: EnvelopeId,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox
                SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3
                WHERE envelope_id = $1
                ",
            )
            .bind(*envelope_id.as_uuid())
            .bind(error)
            .bind(retry_at);
            self.update(envelope_id, query).await
        })
    }

    fn mark_dead_lettered(
        &self,
        envelope_id: EnvelopeId,
        error: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox
                SET attempts = attempts + 1, last_error = $2, dead_lettered_at = $3
                WHERE envelope_id = $1
                ",
            )
            .bind(*envelope_id.as_uuid())
            .bind(error)
            .bind(at);
            self.update(envelope_id, query).await
        })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM outbox
                WHERE published_at IS NULL AND dead_lettered_at IS NULL
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error(&e))?;

            Ok(u64::try_from(count).unwrap_or(0))
        })
    }
}
