//! PostgreSQL-backed lock manager.
//!
//! Released rows are kept with a null holder so the fencing sequence of a
//! resource never restarts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::LockManager;
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{DistributedLock, FencingToken, HolderId, LockAcquisition, ResourceName};
use sqlx::{FromRow, PgPool};

use crate::postgres_support::interval_seconds;

/// PostgreSQL implementation of the lock manager.
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl PostgresLockManager {
    /// Creates a lock manager with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct LockRow {
    fencing_token: i64,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct HolderRow {
    holder_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

fn validate_ttl(ttl: Duration) -> AppResult<()> {
    if ttl.is_zero() {
        return Err(AppError::Validation(
            "lock ttl must be greater than zero".to_owned(),
        ));
    }

    Ok(())
}

fn fencing_token_from(value: i64) -> AppResult<FencingToken> {
    u64::try_from(value)
        .map(FencingToken::new)
        .map_err(|error| AppError::Internal(format!("persisted fencing token is invalid: {error}")))
}

fn bind_token(fencing_token: FencingToken) -> AppResult<i64> {
    i64::try_from(fencing_token.value())
        .map_err(|error| AppError::Validation(format!("fencing token out of range: {error}")))
}

fn lock_from_row(
    resource_name: &ResourceName,
    holder_id: &HolderId,
    row: LockRow,
) -> AppResult<DistributedLock> {
    Ok(DistributedLock {
        resource_name: resource_name.clone(),
        holder_id: holder_id.clone(),
        fencing_token: fencing_token_from(row.fencing_token)?,
        acquired_at: row.acquired_at,
        expires_at: row.expires_at,
    })
}

#[async_trait]
impl LockManager for PostgresLockManager {
    async fn acquire(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        ttl: Duration,
    ) -> AppResult<LockAcquisition> {
        validate_ttl(ttl)?;

        let acquired = sqlx::query_as::<_, LockRow>(
            r#"
            INSERT INTO dispatch_locks (
                resource_name,
                holder_id,
                fencing_token,
                acquired_at,
                expires_at
            )
            VALUES ($1, $2, 1, now(), now() + make_interval(secs => $3::DOUBLE PRECISION))
            ON CONFLICT (resource_name) DO UPDATE
            SET
                holder_id = EXCLUDED.holder_id,
                fencing_token = dispatch_locks.fencing_token + 1,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE dispatch_locks.holder_id IS NULL
               OR dispatch_locks.expires_at <= now()
            RETURNING fencing_token, acquired_at, expires_at
            "#,
        )
        .bind(resource_name.as_str())
        .bind(holder_id.as_str())
        .bind(interval_seconds(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to acquire lock '{resource_name}' for holder '{holder_id}': {error}"
            ))
        })?;

        if let Some(row) = acquired {
            return lock_from_row(resource_name, holder_id, row).map(LockAcquisition::Acquired);
        }

        let holder = sqlx::query_as::<_, HolderRow>(
            "SELECT holder_id, expires_at FROM dispatch_locks WHERE resource_name = $1",
        )
        .bind(resource_name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load holder of lock '{resource_name}': {error}"
            ))
        })?;

        let (holder_id, expires_at) = match holder {
            Some(row) => (
                row.holder_id.map(HolderId::new).transpose()?,
                row.expires_at,
            ),
            None => (None, None),
        };

        Ok(LockAcquisition::AlreadyHeld {
            holder_id,
            expires_at,
        })
    }

    async fn release(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_locks
            SET holder_id = NULL, expires_at = NULL
            WHERE resource_name = $1
              AND holder_id = $2
              AND fencing_token = $3
              AND expires_at > now()
            "#,
        )
        .bind(resource_name.as_str())
        .bind(holder_id.as_str())
        .bind(bind_token(fencing_token)?)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to release lock '{resource_name}': {error}"))
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::StaleLockHolder(format!(
                "holder '{holder_id}' with token {fencing_token} no longer owns lock '{resource_name}'"
            )));
        }

        Ok(())
    }

    async fn refresh(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
        ttl: Duration,
    ) -> AppResult<DistributedLock> {
        validate_ttl(ttl)?;

        let row = sqlx::query_as::<_, LockRow>(
            r#"
            UPDATE dispatch_locks
            SET expires_at = now() + make_interval(secs => $4::DOUBLE PRECISION)
            WHERE resource_name = $1
              AND holder_id = $2
              AND fencing_token = $3
              AND expires_at > now()
            RETURNING fencing_token, acquired_at, expires_at
            "#,
        )
        .bind(resource_name.as_str())
        .bind(holder_id.as_str())
        .bind(bind_token(fencing_token)?)
        .bind(interval_seconds(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to refresh lock '{resource_name}': {error}"))
        })?;

        let Some(row) = row else {
            return Err(AppError::StaleLockHolder(format!(
                "holder '{holder_id}' with token {fencing_token} no longer owns lock '{resource_name}'"
            )));
        };

        lock_from_row(resource_name, holder_id, row)
    }
}
