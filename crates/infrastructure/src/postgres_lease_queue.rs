//! PostgreSQL-backed grouped lease queue.
//!
//! Lease expiry is evaluated against the database clock so that every worker
//! node agrees on when a lease lapses. Escalated tasks are written to
//! `dispatch_dead_letters` in the same transaction that removes them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::{LeaseQueue, LeaseQueueConfig, LeaseQueueStats, ReapReport};
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{
    DeadLetterEntry, DedupKey, GroupKey, Lease, LeasedTask, NewTask, PublishReceipt, ReceiptToken,
    TaskAttributes, TaskId, TaskMessage,
};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::postgres_support::interval_seconds;

/// Sleep between availability checks while long-polling.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// PostgreSQL implementation of the lease queue.
#[derive(Clone)]
pub struct PostgresLeaseQueue {
    pool: PgPool,
    config: LeaseQueueConfig,
}

impl PostgresLeaseQueue {
    /// Creates a queue over the provided connection pool.
    pub fn new(pool: PgPool, config: LeaseQueueConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    async fn begin(&self, operation: &str) -> AppResult<Transaction<'_, Postgres>> {
        self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to start lease queue {operation} transaction: {error}"
            ))
        })
    }

    async fn reap_in(&self, transaction: &mut Transaction<'_, Postgres>) -> AppResult<ReapReport> {
        let expired = sqlx::query_as::<_, TaskRow>(
            r#"
            WITH expired AS (
                SELECT id
                FROM dispatch_tasks
                WHERE lease_expires_at IS NOT NULL
                  AND lease_expires_at <= now()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dispatch_tasks tasks
            SET
                attempt_count = tasks.attempt_count + 1,
                receipt_token = NULL,
                lease_expires_at = NULL
            FROM expired
            WHERE tasks.id = expired.id
            RETURNING
                tasks.id,
                tasks.group_key,
                tasks.dedup_key,
                tasks.payload,
                tasks.attributes,
                tasks.enqueued_at,
                tasks.attempt_count
            "#,
        )
        .fetch_all(&mut **transaction)
        .await
        .map_err(|error| AppError::Internal(format!("failed to reap expired leases: {error}")))?;

        let mut report = ReapReport::default();
        for row in expired {
            let task = row.into_message()?;
            if task.attempt_count <= self.config.max_receives {
                report.redelivered += 1;
                debug!(
                    task_id = %task.id,
                    attempt_count = task.attempt_count,
                    "lease expired; task visible again"
                );
                continue;
            }

            let task_id = task.id;
            let attempt_count = task.attempt_count;
            let entry = DeadLetterEntry::exhausted(task, Utc::now());
            insert_dead_letter(transaction, &entry).await?;

            sqlx::query("DELETE FROM dispatch_tasks WHERE id = $1")
                .bind(task_id.as_uuid())
                .execute(&mut **transaction)
                .await
                .map_err(|error| {
                    AppError::Internal(format!(
                        "failed to remove escalated task '{task_id}': {error}"
                    ))
                })?;

            report.dead_lettered += 1;
            warn!(
                task_id = %task_id,
                attempt_count,
                max_receives = self.config.max_receives,
                "redelivery budget exhausted; task moved to dead-letter sink"
            );
        }

        let expired_total = report.redelivered + report.dead_lettered;
        if expired_total > 0 {
            bump_counter(transaction, "expired_leases", expired_total).await?;
        }
        if report.dead_lettered > 0 {
            bump_counter(transaction, "dead_lettered", report.dead_lettered).await?;
        }

        Ok(report)
    }

    async fn try_receive(&self, max_count: usize) -> AppResult<Vec<LeasedTask>> {
        let mut transaction = self.begin("receive").await?;
        self.reap_in(&mut transaction).await?;

        let rows = sqlx::query_as::<_, LeasedTaskRow>(
            r#"
            WITH heads AS (
                SELECT DISTINCT ON (group_key) id, lease_expires_at
                FROM dispatch_tasks
                ORDER BY group_key, sequence
            ),
            candidates AS (
                SELECT tasks.id
                FROM dispatch_tasks tasks
                INNER JOIN heads ON heads.id = tasks.id
                WHERE heads.lease_expires_at IS NULL
                ORDER BY tasks.sequence ASC
                LIMIT $1
                FOR UPDATE OF tasks SKIP LOCKED
            )
            UPDATE dispatch_tasks tasks
            SET
                receipt_token = gen_random_uuid()::TEXT,
                lease_expires_at = now() + make_interval(secs => $2::DOUBLE PRECISION)
            FROM candidates
            WHERE tasks.id = candidates.id
              AND tasks.lease_expires_at IS NULL
            RETURNING
                tasks.id,
                tasks.sequence,
                tasks.group_key,
                tasks.dedup_key,
                tasks.payload,
                tasks.attributes,
                tasks.enqueued_at,
                tasks.attempt_count,
                tasks.receipt_token,
                tasks.lease_expires_at
            "#,
        )
        .bind(i64::try_from(max_count).map_err(|error| {
            AppError::Validation(format!("invalid receive max_count: {error}"))
        })?)
        .bind(interval_seconds(self.config.lease_duration))
        .fetch_all(&mut *transaction)
        .await
        .map_err(|error| AppError::Internal(format!("failed to lease queued tasks: {error}")))?;

        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!("failed to commit lease queue receive: {error}"))
        })?;

        let mut rows = rows;
        rows.sort_by_key(|row| row.sequence);
        rows.into_iter().map(LeasedTaskRow::into_leased).collect()
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: uuid::Uuid,
    group_key: String,
    dedup_key: String,
    payload: Value,
    attributes: Value,
    enqueued_at: DateTime<Utc>,
    attempt_count: i32,
}

impl TaskRow {
    fn into_message(self) -> AppResult<TaskMessage> {
        let attributes: TaskAttributes =
            serde_json::from_value(self.attributes).map_err(|error| {
                AppError::Internal(format!(
                    "persisted attributes of task '{}' are invalid: {error}",
                    self.id
                ))
            })?;

        Ok(TaskMessage {
            id: TaskId::from_uuid(self.id),
            group_key: GroupKey::new(self.group_key)?,
            dedup_key: DedupKey::new(self.dedup_key)?,
            payload: self.payload,
            attributes,
            enqueued_at: self.enqueued_at,
            attempt_count: u32::try_from(self.attempt_count).map_err(|error| {
                AppError::Internal(format!("persisted attempt_count is invalid: {error}"))
            })?,
        })
    }
}

#[derive(Debug, FromRow)]
struct LeasedTaskRow {
    id: uuid::Uuid,
    sequence: i64,
    group_key: String,
    dedup_key: String,
    payload: Value,
    attributes: Value,
    enqueued_at: DateTime<Utc>,
    attempt_count: i32,
    receipt_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl LeasedTaskRow {
    fn into_leased(self) -> AppResult<LeasedTask> {
        let (Some(receipt_token), Some(expires_at)) = (self.receipt_token, self.lease_expires_at)
        else {
            return Err(AppError::Internal(format!(
                "leased task '{}' is missing its lease columns",
                self.id
            )));
        };

        let task = TaskRow {
            id: self.id,
            group_key: self.group_key,
            dedup_key: self.dedup_key,
            payload: self.payload,
            attributes: self.attributes,
            enqueued_at: self.enqueued_at,
            attempt_count: self.attempt_count,
        }
        .into_message()?;

        Ok(LeasedTask {
            lease: Lease {
                task_id: task.id,
                receipt_token: ReceiptToken::new(receipt_token)?,
                expires_at,
            },
            task,
        })
    }
}

#[derive(Debug, FromRow)]
struct StatsRow {
    visible: i64,
    in_flight: i64,
    expired_leases: i64,
    dead_lettered: i64,
    dedup_entries: i64,
}

pub(crate) async fn insert_dead_letter(
    transaction: &mut Transaction<'_, Postgres>,
    entry: &DeadLetterEntry,
) -> AppResult<()> {
    let task = serde_json::to_value(&entry.task).map_err(|error| {
        AppError::Internal(format!(
            "failed to serialize dead-lettered task '{}': {error}",
            entry.task.id
        ))
    })?;

    sqlx::query(
        r#"
        INSERT INTO dispatch_dead_letters (
            task_id,
            task,
            reason,
            error_message,
            dead_lettered_at
        )
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (task_id) DO UPDATE
        SET
            task = EXCLUDED.task,
            reason = EXCLUDED.reason,
            error_message = EXCLUDED.error_message,
            dead_lettered_at = EXCLUDED.dead_lettered_at
        "#,
    )
    .bind(entry.task.id.as_uuid())
    .bind(task)
    .bind(entry.reason.as_str())
    .bind(entry.error_message.as_deref())
    .bind(entry.dead_lettered_at)
    .execute(&mut **transaction)
    .await
    .map_err(|error| {
        AppError::Internal(format!(
            "failed to push task '{}' to dead-letter sink: {error}",
            entry.task.id
        ))
    })?;

    Ok(())
}

async fn bump_counter(
    transaction: &mut Transaction<'_, Postgres>,
    name: &str,
    amount: u64,
) -> AppResult<()> {
    sqlx::query("UPDATE dispatch_queue_counters SET value = value + $2 WHERE name = $1")
        .bind(name)
        .bind(i64::try_from(amount).unwrap_or(i64::MAX))
        .execute(&mut **transaction)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to update queue counter '{name}': {error}"))
        })?;

    Ok(())
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[async_trait]
impl LeaseQueue for PostgresLeaseQueue {
    async fn publish(&self, task: NewTask) -> AppResult<PublishReceipt> {
        let mut transaction = self.begin("publish").await?;
        let dedup_key = task.dedup_key.as_str().to_owned();

        sqlx::query("DELETE FROM dispatch_dedup_keys WHERE dedup_key = $1 AND expires_at <= now()")
            .bind(dedup_key.as_str())
            .execute(&mut *transaction)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to purge dedup key '{dedup_key}': {error}"
                ))
            })?;

        let claimed = sqlx::query_scalar::<_, uuid::Uuid>(
            r#"
            INSERT INTO dispatch_dedup_keys (dedup_key, task_id, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3::DOUBLE PRECISION))
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING task_id
            "#,
        )
        .bind(dedup_key.as_str())
        .bind(task.id.as_uuid())
        .bind(interval_seconds(self.config.dedup_window))
        .fetch_optional(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to claim dedup key '{dedup_key}': {error}"))
        })?;

        if claimed.is_none() {
            let existing = sqlx::query_scalar::<_, uuid::Uuid>(
                "SELECT task_id FROM dispatch_dedup_keys WHERE dedup_key = $1",
            )
            .bind(dedup_key.as_str())
            .fetch_one(&mut *transaction)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to load dedup key '{dedup_key}': {error}"))
            })?;

            transaction.commit().await.map_err(|error| {
                AppError::Internal(format!("failed to commit duplicate publish: {error}"))
            })?;

            debug!(dedup_key = %dedup_key, task_id = %existing, "duplicate publish suppressed");
            return Ok(PublishReceipt::duplicate(TaskId::from_uuid(existing)));
        }

        let attributes = serde_json::to_value(&task.attributes).map_err(|error| {
            AppError::Internal(format!("failed to serialize task attributes: {error}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO dispatch_tasks (
                id,
                group_key,
                dedup_key,
                payload,
                attributes,
                enqueued_at,
                attempt_count
            )
            VALUES ($1, $2, $3, $4, $5, now(), 0)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.group_key.as_str())
        .bind(dedup_key.as_str())
        .bind(&task.payload)
        .bind(attributes)
        .execute(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to enqueue task '{}': {error}", task.id))
        })?;

        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!("failed to commit publish of '{}': {error}", task.id))
        })?;

        Ok(PublishReceipt::enqueued(task.id))
    }

    async fn receive(&self, max_count: usize, wait: Duration) -> AppResult<Vec<LeasedTask>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            let leased = self.try_receive(max_count).await?;
            let now = Instant::now();
            if !leased.is_empty() || now >= deadline {
                return Ok(leased);
            }

            tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, receipt_token: &ReceiptToken) -> AppResult<()> {
        let result = sqlx::query(
            "DELETE FROM dispatch_tasks WHERE receipt_token = $1 AND lease_expires_at > now()",
        )
        .bind(receipt_token.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to acknowledge receipt '{receipt_token}': {error}"
            ))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseExpired(format!(
                "receipt '{receipt_token}' does not match a live lease"
            )));
        }

        Ok(())
    }

    async fn extend_lease(
        &self,
        receipt_token: &ReceiptToken,
        extension: Duration,
    ) -> AppResult<Lease> {
        if extension.is_zero() {
            return Err(AppError::Validation(
                "lease extension must be greater than zero".to_owned(),
            ));
        }

        let row = sqlx::query_as::<_, (uuid::Uuid, DateTime<Utc>)>(
            r#"
            UPDATE dispatch_tasks
            SET lease_expires_at = now() + make_interval(secs => $2::DOUBLE PRECISION)
            WHERE receipt_token = $1
              AND lease_expires_at > now()
            RETURNING id, lease_expires_at
            "#,
        )
        .bind(receipt_token.as_str())
        .bind(interval_seconds(extension))
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to extend lease for receipt '{receipt_token}': {error}"
            ))
        })?;

        let Some((task_id, expires_at)) = row else {
            return Err(AppError::LeaseExpired(format!(
                "receipt '{receipt_token}' does not match a live lease"
            )));
        };

        Ok(Lease {
            task_id: TaskId::from_uuid(task_id),
            receipt_token: receipt_token.clone(),
            expires_at,
        })
    }

    async fn reap_expired(&self) -> AppResult<ReapReport> {
        let mut transaction = self.begin("reap").await?;
        let report = self.reap_in(&mut transaction).await?;
        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!("failed to commit lease reaping: {error}"))
        })?;

        Ok(report)
    }

    async fn stats(&self) -> AppResult<LeaseQueueStats> {
        self.reap_expired().await?;

        sqlx::query("DELETE FROM dispatch_dedup_keys WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to purge expired dedup keys: {error}"))
            })?;

        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                (SELECT count(*) FROM dispatch_tasks WHERE lease_expires_at IS NULL) AS visible,
                (SELECT count(*) FROM dispatch_tasks WHERE lease_expires_at IS NOT NULL) AS in_flight,
                COALESCE(
                    (SELECT value FROM dispatch_queue_counters WHERE name = 'expired_leases'),
                    0
                ) AS expired_leases,
                COALESCE(
                    (SELECT value FROM dispatch_queue_counters WHERE name = 'dead_lettered'),
                    0
                ) AS dead_lettered,
                (SELECT count(*) FROM dispatch_dedup_keys) AS dedup_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to load queue stats: {error}")))?;

        Ok(LeaseQueueStats {
            visible: non_negative(row.visible),
            in_flight: non_negative(row.in_flight),
            expired_leases: non_negative(row.expired_leases),
            dead_lettered: non_negative(row.dead_lettered),
            dedup_entries: non_negative(row.dedup_entries),
        })
    }
}
