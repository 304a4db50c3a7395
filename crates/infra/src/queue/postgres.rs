//! Postgres-backed durable queue.
//!
//! ## Claim semantics
//!
//! `claim()` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)`
//! statement, so two workers (threads or processes) can never both move the
//! same row to `processing`. Every later write is guarded by
//! `WHERE id = $1 AND status = 'processing'`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueError |
//! |------------|------------|
//! | Database / Io / PoolTimedOut / PoolClosed / other | `Storage` |
//! | Row decode failures | `Corrupt` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use orderflow_core::{QueueItemId, StagingId};
use orderflow_orders::StagedOrder;

use super::store::{MigrationQueue, QueueError};
use super::types::{CallerIdentity, FailureDisposition, QueueItem, QueueStats, QueueStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS migration_queue (
    id                    UUID PRIMARY KEY,
    staging_id            TEXT NOT NULL,
    payload               JSONB NOT NULL,
    caller_identity       JSONB NULL,
    status                TEXT NOT NULL,
    attempts              INTEGER NOT NULL DEFAULT 0,
    max_attempts          INTEGER NOT NULL DEFAULT 3,
    created_at            TIMESTAMPTZ NOT NULL,
    updated_at            TIMESTAMPTZ NOT NULL,
    processing_started_at TIMESTAMPTZ NULL,
    completed_at          TIMESTAMPTZ NULL,
    next_attempt_at       TIMESTAMPTZ NOT NULL,
    error_message         TEXT NULL,
    correlation_id        TEXT NULL
);
CREATE INDEX IF NOT EXISTS migration_queue_due_idx
    ON migration_queue (status, next_attempt_at, created_at);
"#;

const COLUMNS: &str = "id, staging_id, payload, caller_identity, status, attempts, max_attempts, \
     created_at, updated_at, processing_started_at, completed_at, next_attempt_at, \
     error_message, correlation_id";

#[derive(Debug)]
struct QueueItemRow {
    id: Uuid,
    staging_id: String,
    payload: serde_json::Value,
    caller_identity: Option<serde_json::Value>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    next_attempt_at: DateTime<Utc>,
    error_message: Option<String>,
    correlation_id: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for QueueItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueItemRow {
            id: row.try_get("id")?,
            staging_id: row.try_get("staging_id")?,
            payload: row.try_get("payload")?,
            caller_identity: row.try_get("caller_identity")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processing_started_at: row.try_get("processing_started_at")?,
            completed_at: row.try_get("completed_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            error_message: row.try_get("error_message")?,
            correlation_id: row.try_get("correlation_id")?,
        })
    }
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = QueueError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<QueueStatus>()
            .map_err(QueueError::Corrupt)?;
        let staging_id = row
            .staging_id
            .parse::<StagingId>()
            .map_err(|e| QueueError::Corrupt(e.to_string()))?;
        Ok(QueueItem {
            id: QueueItemId::from_uuid(row.id),
            staging_id,
            payload: row.payload,
            caller_identity: row.caller_identity,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processing_started_at: row.processing_started_at,
            completed_at: row.completed_at,
            next_attempt_at: row.next_attempt_at,
            error_message: row.error_message,
            correlation_id: row.correlation_id,
        })
    }
}

/// Postgres-backed migration queue.
///
/// `Send + Sync`; cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresMigrationQueue {
    pool: Arc<PgPool>,
    max_attempts: u32,
}

impl PostgresMigrationQueue {
    pub fn new(pool: PgPool, max_attempts: u32) -> Self {
        Self {
            pool: Arc::new(pool),
            max_attempts,
        }
    }

    /// Create the queue table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_one_opt(&self, sql: &str, id: QueueItemId) -> Result<Option<QueueItem>, QueueError> {
        let row = sqlx::query_as::<_, QueueItemRow>(sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;
        row.map(QueueItem::try_from).transpose()
    }
}

#[async_trait]
impl MigrationQueue for PostgresMigrationQueue {
    #[instrument(skip(self, order, caller_identity), fields(staging_id = %order.id), err)]
    async fn enqueue(
        &self,
        order: &StagedOrder,
        caller_identity: Option<CallerIdentity>,
    ) -> Result<QueueItemId, QueueError> {
        let item = QueueItem::new(order, caller_identity, self.max_attempts, Utc::now())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO migration_queue (
                id, staging_id, payload, caller_identity, status, attempts, max_attempts,
                created_at, updated_at, next_attempt_at, correlation_id
            )
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $6, $6, $7)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.staging_id.as_str())
        .bind(&item.payload)
        .bind(&item.caller_identity)
        .bind(item.max_attempts as i32)
        .bind(item.created_at)
        .bind(&item.correlation_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(item.id)
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueError> {
        let sql = format!("SELECT {COLUMNS} FROM migration_queue WHERE id = $1");
        self.fetch_one_opt(&sql, id).await
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, QueueError> {
        let sql = format!(
            r#"
            UPDATE migration_queue
            SET status = 'processing',
                attempts = attempts + 1,
                processing_started_at = $1,
                updated_at = $1
            WHERE id = (
                SELECT id
                FROM migration_queue
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, QueueItemRow>(&sql)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;
        row.map(QueueItem::try_from).transpose()
    }

    #[instrument(skip(self), fields(queue_item_id = %id), err)]
    async fn complete(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE migration_queue
            SET status = 'completed', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(queue_item_id = %id), err)]
    async fn fail(
        &self,
        id: QueueItemId,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let (status, next_attempt_at) = match disposition {
            FailureDisposition::RetryAt(at) => (QueueStatus::Pending, Some(at)),
            FailureDisposition::DeadLetter => (QueueStatus::DeadLetter, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE migration_queue
            SET status = $2,
                error_message = $3,
                next_attempt_at = COALESCE($4, next_attempt_at),
                updated_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE migration_queue
            SET status = CASE WHEN attempts >= max_attempts THEN 'dead_letter' ELSE 'pending' END,
                next_attempt_at = $2,
                error_message = 'claim expired before the item was finished',
                updated_at = $2
            WHERE status = 'processing' AND processing_started_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn requeue_dead_letter(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE migration_queue
            SET status = 'pending', attempts = 0, next_attempt_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM migration_queue WHERE status = 'dead_letter' \
             ORDER BY updated_at ASC LIMIT $1"
        );
        let rows = sqlx::query_as::<_, QueueItemRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
        rows.into_iter().map(QueueItem::try_from).collect()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM migration_queue GROUP BY status")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let status = status.parse::<QueueStatus>().map_err(QueueError::Corrupt)?;
            stats.add(status, count.max(0) as usize);
        }
        Ok(stats)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            QueueError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => QueueError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
