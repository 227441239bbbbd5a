use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lodestar_application::LockManager;
use lodestar_core::{AppError, AppResult, Clock, expiry_after};
use lodestar_domain::{DistributedLock, FencingToken, HolderId, LockAcquisition, ResourceName};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct LockSlot {
    current: Option<DistributedLock>,
    last_token: FencingToken,
}

/// Process-local fencing-token lock manager.
///
/// The last issued token survives release so tokens keep increasing across
/// holders.
pub struct InMemoryLockManager {
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<ResourceName, LockSlot>>,
}

impl InMemoryLockManager {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }
}

fn stale(resource_name: &ResourceName, holder_id: &HolderId, token: FencingToken) -> AppError {
    AppError::StaleLockHolder(format!(
        "holder '{holder_id}' with fencing token {token} no longer owns '{resource_name}'"
    ))
}

fn require_ttl(ttl: Duration) -> AppResult<()> {
    if ttl.is_zero() {
        return Err(AppError::Validation(
            "lock ttl must be greater than zero".to_owned(),
        ));
    }

    Ok(())
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        ttl: Duration,
    ) -> AppResult<LockAcquisition> {
        require_ttl(ttl)?;
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(resource_name.clone()).or_default();

        if let Some(current) = &slot.current
            && !current.is_expired_at(now)
        {
            return Ok(LockAcquisition::AlreadyHeld {
                holder_id: Some(current.holder_id.clone()),
                expires_at: Some(current.expires_at),
            });
        }

        let fencing_token = slot.last_token.next();
        let lock = DistributedLock {
            resource_name: resource_name.clone(),
            holder_id: holder_id.clone(),
            fencing_token,
            acquired_at: now,
            expires_at,
        };
        slot.last_token = fencing_token;
        slot.current = Some(lock.clone());

        debug!(
            resource_name = %resource_name,
            holder_id = %holder_id,
            fencing_token = %fencing_token,
            "lock acquired"
        );
        Ok(LockAcquisition::Acquired(lock))
    }

    async fn release(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
    ) -> AppResult<()> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(resource_name)
            .ok_or_else(|| stale(resource_name, holder_id, fencing_token))?;

        match &slot.current {
            Some(current)
                if current.is_held_by(holder_id, fencing_token) && !current.is_expired_at(now) =>
            {
                slot.current = None;
                Ok(())
            }
            _ => Err(stale(resource_name, holder_id, fencing_token)),
        }
    }

    async fn refresh(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
        ttl: Duration,
    ) -> AppResult<DistributedLock> {
        require_ttl(ttl)?;
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        let mut slots = self.slots.lock().await;
        let current = slots
            .get_mut(resource_name)
            .and_then(|slot| slot.current.as_mut())
            .filter(|current| {
                current.is_held_by(holder_id, fencing_token) && !current.is_expired_at(now)
            })
            .ok_or_else(|| stale(resource_name, holder_id, fencing_token))?;

        current.expires_at = expires_at;
        Ok(current.clone())
    }
}
