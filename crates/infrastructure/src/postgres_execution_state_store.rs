use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::ExecutionStateStore;
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{Bookmark, BookmarkHash, BookmarkInput, ExecutionRecord};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// PostgreSQL-backed execution records and bookmarks.
#[derive(Clone)]
pub struct PostgresExecutionStateStore {
    pool: PgPool,
}

impl PostgresExecutionStateStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct BookmarkRow {
    bookmark_id: Uuid,
    workflow_instance_id: String,
    activity_node_id: String,
    hash: String,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl BookmarkRow {
    fn into_bookmark(self) -> AppResult<Bookmark> {
        Bookmark::restore(
            self.bookmark_id,
            BookmarkInput {
                workflow_instance_id: self.workflow_instance_id,
                activity_node_id: self.activity_node_id,
                hash: BookmarkHash::new(self.hash)?,
                payload: self.payload,
            },
            self.created_at,
        )
    }
}

#[async_trait]
impl ExecutionStateStore for PostgresExecutionStateStore {
    async fn save_execution_result(&self, record: ExecutionRecord) -> AppResult<()> {
        let attempt_count = i32::try_from(record.attempt_count).map_err(|error| {
            AppError::Validation(format!("execution attempt_count out of range: {error}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO execution_records (
                task_id,
                group_key,
                attempt_count,
                status,
                output,
                recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.task_id.as_uuid())
        .bind(record.group_key.as_str())
        .bind(attempt_count)
        .bind(record.status.as_str())
        .bind(&record.output)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to save execution result for task '{}': {error}",
                record.task_id
            ))
        })?;

        Ok(())
    }

    async fn save_bookmark(&self, bookmark: Bookmark) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_bookmarks (
                bookmark_id,
                workflow_instance_id,
                activity_node_id,
                hash,
                payload,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (bookmark_id) DO NOTHING
            "#,
        )
        .bind(bookmark.bookmark_id())
        .bind(bookmark.workflow_instance_id().as_str())
        .bind(bookmark.activity_node_id().as_str())
        .bind(bookmark.hash().as_str())
        .bind(bookmark.payload())
        .bind(bookmark.created_at())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to save bookmark '{}': {error}",
                bookmark.bookmark_id()
            ))
        })?;

        Ok(())
    }

    async fn resolve_bookmark(&self, hash: &BookmarkHash) -> AppResult<Option<Bookmark>> {
        let row = sqlx::query_as::<_, BookmarkRow>(
            r#"
            SELECT
                bookmark_id,
                workflow_instance_id,
                activity_node_id,
                hash,
                payload,
                created_at
            FROM workflow_bookmarks
            WHERE hash = $1
              AND consumed_at IS NULL
            ORDER BY created_at ASC, bookmark_id ASC
            LIMIT 1
            "#,
        )
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to resolve bookmark hash '{hash}': {error}"))
        })?;

        row.map(BookmarkRow::into_bookmark).transpose()
    }

    async fn consume_bookmark(&self, bookmark_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_bookmarks
            SET consumed_at = now()
            WHERE bookmark_id = $1
              AND consumed_at IS NULL
            "#,
        )
        .bind(bookmark_id)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to consume bookmark '{bookmark_id}': {error}"))
        })?;

        Ok(result.rows_affected() > 0)
    }
}
