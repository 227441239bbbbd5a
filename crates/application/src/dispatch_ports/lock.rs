use std::time::Duration;

use async_trait::async_trait;
use lodestar_core::AppResult;
use lodestar_domain::{DistributedLock, FencingToken, HolderId, LockAcquisition, ResourceName};

/// Mutual exclusion keyed by resource name, with TTL expiry and fencing tokens.
///
/// All three operations are single atomic steps and never long-poll.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquires the lock when it is free or expired.
    ///
    /// Each success carries a fencing token greater than every token issued
    /// earlier for the same resource.
    async fn acquire(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        ttl: Duration,
    ) -> AppResult<LockAcquisition>;

    /// Releases the lock. Fails with `StaleLockHolder` unless the holder and
    /// token match the current unexpired record.
    async fn release(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
    ) -> AppResult<()>;

    /// Moves expiry to `now + ttl` under the same staleness check as release.
    async fn refresh(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
        ttl: Duration,
    ) -> AppResult<DistributedLock>;
}
