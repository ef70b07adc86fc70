//! Durable storage of classified log events in PostgreSQL

use crate::error::Result;
use crate::metrics;
use crate::models::{PersistedRecord, StoredLog};
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    /// A row with the same `log_id` was already there (redelivery)
    Updated,
}

/// Idempotent sink for classified events.
///
/// Writing the same `log_id` twice must leave the store as if written once;
/// any `Err` means the record may not be durable and the event must stay
/// unacknowledged.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn write(&self, record: &PersistedRecord) -> Result<WriteOutcome>;
}

#[derive(Clone)]
pub struct PgLogStore {
    pool: PgPool,
    write_timeout: Duration,
}

impl PgLogStore {
    pub fn new(pool: PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    /// Most recently stored logs, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<StoredLog>> {
        let logs = sqlx::query_as::<_, StoredLog>(
            r#"
            SELECT id, log_id, service, level, message, is_anomaly, created_at
            FROM logs
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    pub async fn find(&self, log_id: &str) -> Result<Option<StoredLog>> {
        let log = sqlx::query_as::<_, StoredLog>(
            r#"
            SELECT id, log_id, service, level, message, is_anomaly, created_at
            FROM logs
            WHERE log_id = $1
            "#,
        )
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(log)
    }

    async fn upsert(&self, record: &PersistedRecord) -> Result<WriteOutcome> {
        // xmax is 0 only for a freshly inserted tuple
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO logs (log_id, service, level, message, is_anomaly)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (log_id) DO UPDATE SET
                service = EXCLUDED.service,
                level = EXCLUDED.level,
                message = EXCLUDED.message,
                is_anomaly = EXCLUDED.is_anomaly
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.log_id)
        .bind(&record.service)
        .bind(&record.level)
        .bind(&record.message)
        .bind(record.is_anomaly)
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Updated
        })
    }
}

#[async_trait]
impl RecordStore for PgLogStore {
    async fn write(&self, record: &PersistedRecord) -> Result<WriteOutcome> {
        let started = Instant::now();
        let result = resilience::with_timeout_result(self.write_timeout, self.upsert(record)).await;
        metrics::observe_write(started.elapsed(), result.is_ok());

        let outcome = result?;
        debug!(
            log_id = %record.log_id,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Log record persisted"
        );
        Ok(outcome)
    }
}
