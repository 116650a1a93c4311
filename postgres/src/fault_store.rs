//! `PostgreSQL` fault store.
//!
//! Persists dead letters in the `fault_entries` table, keyed by envelope id.
//! A repeat failure of the same envelope folds into the existing row: attempts
//! accumulate, `first_failed_at` is kept and the entry reopens as pending.

use crate::{attempts_from_db, attempts_to_db};
use bidstream_core::envelope::EnvelopeId;
use bidstream_core::fault::{DeadLetter, FaultEntry, FaultError, FaultStatus, FaultStore};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

const FAULT_COLUMNS: &str = "envelope_id, original_topic, consumer_group, attempts, last_error, \
     raw_envelope, first_failed_at, last_failed_at, status, resolved_at, resolution_notes";

fn storage_error(e: &sqlx::Error) -> FaultError {
    FaultError::Storage(e.to_string())
}

/// `PostgreSQL`-backed [`FaultStore`].
///
/// # Example
///
/// ```no_run
/// use bidstream_core::fault::{FaultStatus, FaultStore};
/// use bidstream_postgres::PostgresFaultStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let faults = PostgresFaultStore::new(pool);
///
/// for entry in faults.list_by_status(FaultStatus::Pending, 100).await? {
///     println!("{} failed {} times: {}", entry.envelope_id, entry.attempts, entry.last_error);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresFaultStore {
    pool: PgPool,
}

impl PostgresFaultStore {
    /// Create a fault store on the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn resolve(
        &self,
        envelope_id: EnvelopeId,
        status: FaultStatus,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), FaultError> {
        let result = sqlx::query(
            r"
            UPDATE fault_entries
            SET status = $2, resolved_at = $3, resolution_notes = $4
            WHERE envelope_id = $1
            ",
        )
        .bind(*envelope_id.as_uuid())
        .bind(status.as_str())
        .bind(at)
        .bind(notes)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&e))?;

        if result.rows_affected() == 0 {
            return Err(FaultError::NotFound(envelope_id));
        }

        tracing::info!(
            envelope_id = %envelope_id,
            status = status.as_str(),
            "Fault entry resolved"
        );
        Ok(())
    }

    fn row_to_entry(row: &PgRow) -> Result<FaultEntry, FaultError> {
        let get_err = |e: sqlx::Error| FaultError::Storage(e.to_string());

        let status: String = row.try_get("status").map_err(get_err)?;
        let attempts: i32 = row.try_get("attempts").map_err(get_err)?;

        Ok(FaultEntry {
            envelope_id: EnvelopeId::from_uuid(row.try_get("envelope_id").map_err(get_err)?),
            original_topic: row.try_get("original_topic").map_err(get_err)?,
            consumer_group: row.try_get("consumer_group").map_err(get_err)?,
            attempts: attempts_from_db(attempts),
            last_error: row.try_get("last_error").map_err(get_err)?,
            raw_envelope: row.try_get("raw_envelope").map_err(get_err)?,
            first_failed_at: row.try_get("first_failed_at").map_err(get_err)?,
            last_failed_at: row.try_get("last_failed_at").map_err(get_err)?,
            status: FaultStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(get_err)?,
            resolution_notes: row.try_get("resolution_notes").map_err(get_err)?,
        })
    }
}

impl FaultStore for PostgresFaultStore {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<FaultEntry, FaultError>> + Send + '_>> {
        Box::pin(async move {
            let sql = format!(
                r"
                INSERT INTO fault_entries (
                    envelope_id, original_topic, consumer_group, attempts, last_error,
                    raw_envelope, first_failed_at, last_failed_at, status
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7, 'pending')
                ON CONFLICT (envelope_id) DO UPDATE SET
                    original_topic = EXCLUDED.original_topic,
                    consumer_group = EXCLUDED.consumer_group,
                    attempts = fault_entries.attempts + EXCLUDED.attempts,
                    last_error = EXCLUDED.last_error,
                    raw_envelope = EXCLUDED.raw_envelope,
                    last_failed_at = EXCLUDED.last_failed_at,
                    status = 'pending',
                    resolved_at = NULL,
                    resolution_notes = NULL
                RETURNING {FAULT_COLUMNS}
                "
            );

            let row = sqlx::query(&sql)
                .bind(*letter.envelope_id.as_uuid())
                .bind(&letter.original_topic)
                .bind(&letter.consumer_group)
                .bind(attempts_to_db(letter.attempts))
                .bind(&letter.last_error)
                .bind(&letter.raw_envelope)
                .bind(letter.failed_at)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            let entry = Self::row_to_entry(&row)?;

            tracing::warn!(
                envelope_id = %entry.envelope_id,
                topic = %entry.original_topic,
                consumer_group = ?entry.consumer_group,
                attempts = entry.attempts,
                error = %entry.last_error,
                "Dead letter stored"
            );

            Ok(entry)
        })
    }

    fn get(
        &self,
        envelope_id: EnvelopeId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FaultEntry>, FaultError>> + Send + '_>> {
        Box::pin(async move {
            let sql = format!("SELECT {FAULT_COLUMNS} FROM fault_entries WHERE envelope_id = $1");
            let row = sqlx::query(&sql)
                .bind(*envelope_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            row.as_ref().map(Self::row_to_entry).transpose()
        })
    }

    fn list_by_status(
        &self,
        status: FaultStatus,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FaultEntry>, FaultError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
            let limit = limit as i64;
            let sql = format!(
                r"
                SELECT {FAULT_COLUMNS}
                FROM fault_entries
                WHERE status = $1
                ORDER BY first_failed_at ASC
                LIMIT $2
                "
            );

            let rows = sqlx::query(&sql)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            rows.iter().map(Self::row_to_entry).collect()
        })
    }

    fn mark_replayed(
        &self,
        envelope_id: EnvelopeId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>> {
        Box::pin(self.resolve(envelope_id, FaultStatus::Replayed, None, at))
    }

    fn mark_discarded(
        &self,
        envelope_id: EnvelopeId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>> {
        Box::pin(self.resolve(envelope_id, FaultStatus::Discarded, Some(reason), at))
    }

    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64, FaultError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM fault_entries
                WHERE status = 'pending'
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            Ok(u64::try_from(count).unwrap_or(0))
        })
    }
}
