//! Redis-backed lock manager with fencing tokens.
//!
//! The lock key holds `holder|token` with a millisecond TTL. A sibling counter
//! key issues fencing tokens and is never expired, so tokens keep growing
//! across releases and lapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lodestar_application::LockManager;
use lodestar_core::{AppError, AppResult, Clock, expiry_after};
use lodestar_domain::{DistributedLock, FencingToken, HolderId, LockAcquisition, ResourceName};
use redis::Script;
use tracing::debug;

const ACQUIRE_LOCK_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  return {0, current, redis.call('PTTL', KEYS[1])}
end
local token = redis.call('INCR', KEYS[2])
local value = ARGV[1] .. '|' .. token
redis.call('SET', KEYS[1], value, 'PX', ARGV[2])
return {1, value, tonumber(ARGV[2])}
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const REFRESH_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Redis implementation of the lock manager.
#[derive(Clone)]
pub struct RedisLockManager {
    client: redis::Client,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl RedisLockManager {
    /// Creates one lock manager adapter.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            clock,
        }
    }

    fn lock_key(&self, resource_name: &ResourceName) -> String {
        format!("{}:lock:{resource_name}", self.key_prefix)
    }

    fn fence_key(&self, resource_name: &ResourceName) -> String {
        format!("{}:fence:{resource_name}", self.key_prefix)
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))
    }

    fn lock_record(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
        ttl: Duration,
    ) -> AppResult<DistributedLock> {
        let acquired_at = self.clock.now();
        Ok(DistributedLock {
            resource_name: resource_name.clone(),
            holder_id: holder_id.clone(),
            fencing_token,
            acquired_at,
            expires_at: expiry_after(acquired_at, ttl)?,
        })
    }
}

fn ttl_millis(ttl: Duration) -> AppResult<u64> {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Err(AppError::Validation(
            "lock ttl must be at least one millisecond".to_owned(),
        ));
    }

    Ok(millis)
}

fn lock_value(holder_id: &HolderId, fencing_token: FencingToken) -> String {
    format!("{holder_id}|{fencing_token}")
}

fn parse_lock_value(value: &str) -> AppResult<(HolderId, FencingToken)> {
    let (holder_id, token) = value.rsplit_once('|').ok_or_else(|| {
        AppError::Internal(format!("redis lock value '{value}' is malformed"))
    })?;
    let token = token.parse::<u64>().map_err(|error| {
        AppError::Internal(format!("redis lock token '{token}' is malformed: {error}"))
    })?;

    Ok((HolderId::new(holder_id)?, FencingToken::new(token)))
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        ttl: Duration,
    ) -> AppResult<LockAcquisition> {
        let millis = ttl_millis(ttl)?;
        let mut connection = self.connection().await?;

        let (acquired, value, remaining_millis): (i64, String, i64) =
            Script::new(ACQUIRE_LOCK_SCRIPT)
                .key(self.lock_key(resource_name))
                .key(self.fence_key(resource_name))
                .arg(holder_id.as_str())
                .arg(millis)
                .invoke_async(&mut connection)
                .await
                .map_err(|error| {
                    AppError::Internal(format!(
                        "failed to acquire lock '{resource_name}': {error}"
                    ))
                })?;

        let (current_holder, fencing_token) = parse_lock_value(value.as_str())?;
        if acquired == 1 {
            debug!(resource = %resource_name, holder = %holder_id, token = %fencing_token, "lock acquired");
            return self
                .lock_record(resource_name, holder_id, fencing_token, ttl)
                .map(LockAcquisition::Acquired);
        }

        let expires_at = u64::try_from(remaining_millis)
            .ok()
            .map(Duration::from_millis)
            .and_then(|remaining| expiry_after(self.clock.now(), remaining).ok());

        Ok(LockAcquisition::AlreadyHeld {
            holder_id: Some(current_holder),
            expires_at,
        })
    }

    async fn release(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
    ) -> AppResult<()> {
        let mut connection = self.connection().await?;

        let released: i64 = Script::new(RELEASE_LOCK_SCRIPT)
            .key(self.lock_key(resource_name))
            .arg(lock_value(holder_id, fencing_token))
            .invoke_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to release lock '{resource_name}': {error}"))
            })?;

        if released == 0 {
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
        let millis = ttl_millis(ttl)?;
        let mut connection = self.connection().await?;

        let refreshed: i64 = Script::new(REFRESH_LOCK_SCRIPT)
            .key(self.lock_key(resource_name))
            .arg(lock_value(holder_id, fencing_token))
            .arg(millis)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to refresh lock '{resource_name}': {error}"))
            })?;

        if refreshed == 0 {
            return Err(AppError::StaleLockHolder(format!(
                "holder '{holder_id}' with token {fencing_token} no longer owns lock '{resource_name}'"
            )));
        }

        self.lock_record(resource_name, holder_id, fencing_token, ttl)
    }
}
