//! PostgreSQL-backed dead-letter sink and archive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::{DeadLetterArchive, DeadLetterSink};
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{DeadLetterEntry, DeadLetterQuery, DeadLetterReason, TaskId, TaskMessage};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::postgres_lease_queue::insert_dead_letter;

/// PostgreSQL implementation of the dead-letter sink and archive.
///
/// The sink table is the one `PostgresLeaseQueue` escalates into.
#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    task: Value,
    reason: String,
    error_message: Option<String>,
    dead_lettered_at: DateTime<Utc>,
    requeued_as: Option<uuid::Uuid>,
}

impl DeadLetterRow {
    fn into_entry(self) -> AppResult<DeadLetterEntry> {
        let task: TaskMessage = serde_json::from_value(self.task).map_err(|error| {
            AppError::Internal(format!("persisted dead-letter task is invalid: {error}"))
        })?;

        Ok(DeadLetterEntry {
            task,
            reason: DeadLetterReason::parse(self.reason.as_str())?,
            error_message: self.error_message,
            dead_lettered_at: self.dead_lettered_at,
            requeued_as: self.requeued_as.map(TaskId::from_uuid),
        })
    }
}

fn bind_limit(value: usize, name: &str) -> AppResult<i64> {
    i64::try_from(value)
        .map_err(|error| AppError::Validation(format!("invalid dead-letter {name}: {error}")))
}

#[async_trait]
impl DeadLetterSink for PostgresDeadLetterStore {
    async fn push(&self, entry: DeadLetterEntry) -> AppResult<()> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!("failed to start dead-letter push transaction: {error}"))
        })?;
        insert_dead_letter(&mut transaction, &entry).await?;
        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!("failed to commit dead-letter push: {error}"))
        })
    }

    async fn pending(&self, limit: usize) -> AppResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT task, reason, error_message, dead_lettered_at, NULL::UUID AS requeued_as
            FROM dispatch_dead_letters
            ORDER BY dead_lettered_at ASC, task_id ASC
            LIMIT $1
            "#,
        )
        .bind(bind_limit(limit, "limit")?)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load pending dead letters: {error}"))
        })?;

        rows.into_iter().map(DeadLetterRow::into_entry).collect()
    }

    async fn remove(&self, task_id: TaskId, dead_lettered_at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM dispatch_dead_letters WHERE task_id = $1 AND dead_lettered_at = $2",
        )
        .bind(task_id.as_uuid())
        .bind(dead_lettered_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to remove dead letter '{task_id}' from sink: {error}"
            ))
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> AppResult<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM dispatch_dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to count dead letters: {error}"))
            })?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl DeadLetterArchive for PostgresDeadLetterStore {
    async fn save(&self, entry: DeadLetterEntry) -> AppResult<()> {
        let task = serde_json::to_value(&entry.task).map_err(|error| {
            AppError::Internal(format!(
                "failed to serialize archived task '{}': {error}",
                entry.task.id
            ))
        })?;

        sqlx::query(
            r#"
            INSERT INTO dispatch_dead_letter_archive (
                task_id,
                task,
                reason,
                error_message,
                dead_lettered_at,
                requeued_as
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (task_id) DO UPDATE
            SET
                task = EXCLUDED.task,
                reason = EXCLUDED.reason,
                error_message = EXCLUDED.error_message,
                dead_lettered_at = EXCLUDED.dead_lettered_at,
                requeued_as = COALESCE(
                    EXCLUDED.requeued_as,
                    dispatch_dead_letter_archive.requeued_as
                ),
                archived_at = now()
            "#,
        )
        .bind(entry.task.id.as_uuid())
        .bind(task)
        .bind(entry.reason.as_str())
        .bind(entry.error_message.as_deref())
        .bind(entry.dead_lettered_at)
        .bind(entry.requeued_as.map(|task_id| task_id.as_uuid()))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to archive dead letter '{}': {error}",
                entry.task.id
            ))
        })?;

        Ok(())
    }

    async fn list(&self, query: DeadLetterQuery) -> AppResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT task, reason, error_message, dead_lettered_at, requeued_as
            FROM dispatch_dead_letter_archive
            WHERE $1 OR requeued_as IS NULL
            ORDER BY dead_lettered_at DESC, task_id ASC
            LIMIT $2
            OFFSET $3
            "#,
        )
        .bind(query.include_requeued)
        .bind(bind_limit(query.limit, "limit")?)
        .bind(bind_limit(query.offset, "offset")?)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to list dead letters: {error}")))?;

        rows.into_iter().map(DeadLetterRow::into_entry).collect()
    }

    async fn find(&self, task_id: TaskId) -> AppResult<Option<DeadLetterEntry>> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT task, reason, error_message, dead_lettered_at, requeued_as
            FROM dispatch_dead_letter_archive
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to find dead letter '{task_id}': {error}"))
        })?;

        row.map(DeadLetterRow::into_entry).transpose()
    }

    async fn mark_requeued(&self, task_id: TaskId, requeued_as: TaskId) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_dead_letter_archive
            SET requeued_as = $2
            WHERE task_id = $1
              AND requeued_as IS NULL
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(requeued_as.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to mark dead letter '{task_id}' requeued: {error}"
            ))
        })?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.find(task_id).await? {
            Some(entry) => Err(AppError::Conflict(format!(
                "dead-letter entry '{task_id}' was already requeued as '{}'",
                entry
                    .requeued_as
                    .map(|existing| existing.to_string())
                    .unwrap_or_default()
            ))),
            None => Err(AppError::NotFound(format!(
                "dead-letter entry '{task_id}' does not exist"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use lodestar_application::{DeadLetterArchive, DeadLetterSink};
    use lodestar_core::AppError;
    use lodestar_domain::{
        DeadLetterEntry, DeadLetterQuery, DedupKey, GroupKey, NewTask, TaskAttributes, TaskId,
    };
    use serde_json::json;

    use super::PostgresDeadLetterStore;
    use crate::postgres_support::testing::test_pool;

    fn permanent_entry() -> DeadLetterEntry {
        let task = NewTask::new(
            GroupKey::new(format!("wf-{}", uuid::Uuid::new_v4())).unwrap_or_else(|_| unreachable!()),
            DedupKey::new("d1").unwrap_or_else(|_| unreachable!()),
            json!({"step": 3}),
            TaskAttributes::default(),
        )
        .into_message(Utc::now());
        DeadLetterEntry::permanent(task, "schema mismatch", Utc::now())
    }

    #[tokio::test]
    async fn sink_entries_survive_until_removed() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let store = PostgresDeadLetterStore::new(pool);
        let entry = permanent_entry();
        let task_id = entry.task.id;
        let escalated_at = entry.dead_lettered_at;

        assert!(store.push(entry.clone()).await.is_ok());
        assert!(store.push(entry).await.is_ok());

        let pending = store.pending(10_000).await.unwrap_or_default();
        assert_eq!(
            pending.iter().filter(|pending| pending.task.id == task_id).count(),
            1
        );

        let earlier = escalated_at - chrono::Duration::seconds(5);
        assert!(matches!(store.remove(task_id, earlier).await, Ok(false)));
        assert!(matches!(store.remove(task_id, escalated_at).await, Ok(true)));
        let pending = store.pending(10_000).await.unwrap_or_default();
        assert!(pending.iter().all(|pending| pending.task.id != task_id));
    }

    #[tokio::test]
    async fn archive_requeue_is_recorded_once() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let store = PostgresDeadLetterStore::new(pool);
        let entry = permanent_entry();
        let task_id = entry.task.id;
        assert!(store.save(entry.clone()).await.is_ok());

        let replacement = TaskId::new();
        assert!(store.mark_requeued(task_id, replacement).await.is_ok());
        let again = store.mark_requeued(task_id, TaskId::new()).await;
        assert!(matches!(again, Err(AppError::Conflict(_))));

        assert!(store.save(entry).await.is_ok());
        let found = store.find(task_id).await.unwrap_or_default();
        assert_eq!(found.and_then(|entry| entry.requeued_as), Some(replacement));

        let open = store
            .list(DeadLetterQuery {
                include_requeued: false,
                limit: 10_000,
                offset: 0,
            })
            .await
            .unwrap_or_default();
        assert!(open.iter().all(|entry| entry.task.id != task_id));

        let missing = store.mark_requeued(TaskId::new(), TaskId::new()).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}
