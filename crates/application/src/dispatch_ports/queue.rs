use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lodestar_core::{AppError, AppResult, expiry_after};
use lodestar_domain::{Lease, LeasedTask, NewTask, PublishReceipt, ReceiptToken};

/// Operational knobs of a lease queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseQueueConfig {
    /// Visibility timeout granted by each receive.
    pub lease_duration: Duration,
    /// Redeliveries allowed before escalation to the dead-letter sink.
    pub max_receives: u32,
    /// Window during which a repeated dedup key is suppressed.
    pub dedup_window: Duration,
}

impl LeaseQueueConfig {
    /// Validates configured values.
    pub fn validate(&self) -> AppResult<()> {
        if self.lease_duration.is_zero() {
            return Err(AppError::Validation(
                "queue lease duration must be greater than zero".to_owned(),
            ));
        }

        if self.dedup_window.is_zero() {
            return Err(AppError::Validation(
                "queue dedup window must be greater than zero".to_owned(),
            ));
        }

        let now = Utc::now();
        expiry_after(now, self.lease_duration)?;
        expiry_after(now, self.dedup_window)?;

        Ok(())
    }
}

impl Default for LeaseQueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            max_receives: 5,
            dedup_window: Duration::from_secs(300),
        }
    }
}

/// Queue depth snapshot for operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseQueueStats {
    /// Tasks waiting for delivery, including group-gated ones.
    pub visible: u64,
    /// Tasks under a live lease.
    pub in_flight: u64,
    /// Leases that lapsed and were redelivered since startup.
    pub expired_leases: u64,
    /// Tasks escalated to the dead-letter sink since startup.
    pub dead_lettered: u64,
    /// Dedup keys still inside their window.
    pub dedup_entries: u64,
}

/// Counts produced by one reaping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Expired leases whose task became visible again.
    pub redelivered: u64,
    /// Expired leases whose task exceeded its redelivery budget.
    pub dead_lettered: u64,
}

/// Grouped lease queue with visibility timeouts and content deduplication.
///
/// Tasks sharing a group key are delivered in publish order. A group's next
/// task is withheld while an earlier one holds a live lease.
#[async_trait]
pub trait LeaseQueue: Send + Sync {
    /// Enqueues a task, or returns the surviving task when the dedup key is
    /// still inside its window.
    async fn publish(&self, task: NewTask) -> AppResult<PublishReceipt>;

    /// Leases up to `max_count` deliverable tasks, long-polling up to `wait`
    /// for the first one.
    async fn receive(&self, max_count: usize, wait: Duration) -> AppResult<Vec<LeasedTask>>;

    /// Deletes a leased task. Fails with `LeaseExpired` when the token no
    /// longer matches a live lease.
    async fn acknowledge(&self, receipt_token: &ReceiptToken) -> AppResult<()>;

    /// Moves a live lease's expiry to `now + extension`.
    async fn extend_lease(
        &self,
        receipt_token: &ReceiptToken,
        extension: Duration,
    ) -> AppResult<Lease>;

    /// Redelivers or escalates every lapsed lease.
    async fn reap_expired(&self) -> AppResult<ReapReport>;

    /// Returns a queue depth snapshot.
    async fn stats(&self) -> AppResult<LeaseQueueStats>;
}
