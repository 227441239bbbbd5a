use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::ScheduleRepository;
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{ScheduleDefinition, ScheduleDefinitionInput, TaskAttributes};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

/// PostgreSQL-backed schedule repository.
#[derive(Clone)]
pub struct PostgresScheduleRepository {
    pool: PgPool,
}

impl PostgresScheduleRepository {
    /// Creates a schedule repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ScheduleRow {
    schedule_id: String,
    group_key: String,
    payload: Value,
    attributes: Value,
    interval_seconds: i32,
    next_due_at: DateTime<Utc>,
    is_enabled: bool,
}

impl ScheduleRow {
    fn into_definition(self) -> AppResult<ScheduleDefinition> {
        let attributes: TaskAttributes =
            serde_json::from_value(self.attributes).map_err(|error| {
                AppError::Internal(format!(
                    "persisted attributes of schedule '{}' are invalid: {error}",
                    self.schedule_id
                ))
            })?;

        ScheduleDefinition::new(ScheduleDefinitionInput {
            interval_seconds: u32::try_from(self.interval_seconds).map_err(|error| {
                AppError::Internal(format!("persisted interval_seconds is invalid: {error}"))
            })?,
            schedule_id: self.schedule_id,
            group_key: self.group_key,
            payload: self.payload,
            attributes,
            next_due_at: self.next_due_at,
            is_enabled: self.is_enabled,
        })
    }
}

#[async_trait]
impl ScheduleRepository for PostgresScheduleRepository {
    async fn save_schedule(&self, definition: ScheduleDefinition) -> AppResult<()> {
        let attributes = serde_json::to_value(definition.attributes()).map_err(|error| {
            AppError::Internal(format!("failed to serialize schedule attributes: {error}"))
        })?;
        let interval_seconds = i32::try_from(definition.interval_seconds()).map_err(|error| {
            AppError::Validation(format!("schedule interval_seconds out of range: {error}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO dispatch_schedules (
                schedule_id,
                group_key,
                payload,
                attributes,
                interval_seconds,
                next_due_at,
                is_enabled,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (schedule_id) DO UPDATE
            SET
                group_key = EXCLUDED.group_key,
                payload = EXCLUDED.payload,
                attributes = EXCLUDED.attributes,
                interval_seconds = EXCLUDED.interval_seconds,
                next_due_at = EXCLUDED.next_due_at,
                is_enabled = EXCLUDED.is_enabled,
                updated_at = now()
            "#,
        )
        .bind(definition.schedule_id().as_str())
        .bind(definition.group_key().as_str())
        .bind(definition.payload())
        .bind(attributes)
        .bind(interval_seconds)
        .bind(definition.next_due_at())
        .bind(definition.is_enabled())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to save schedule '{}': {error}",
                definition.schedule_id()
            ))
        })?;

        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> AppResult<Vec<ScheduleDefinition>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT
                schedule_id,
                group_key,
                payload,
                attributes,
                interval_seconds,
                next_due_at,
                is_enabled
            FROM dispatch_schedules
            WHERE is_enabled
              AND next_due_at <= $1
            ORDER BY next_due_at ASC, schedule_id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to list due schedules: {error}")))?;

        rows.into_iter().map(ScheduleRow::into_definition).collect()
    }

    async fn advance(
        &self,
        schedule_id: &str,
        fired_for: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_schedules
            SET next_due_at = $3, updated_at = now()
            WHERE schedule_id = $1
              AND next_due_at = $2
            "#,
        )
        .bind(schedule_id)
        .bind(fired_for)
        .bind(next_due_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to advance schedule '{schedule_id}': {error}"))
        })?;

        Ok(result.rows_affected() > 0)
    }
}
