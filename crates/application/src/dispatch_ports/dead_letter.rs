use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_core::AppResult;
use lodestar_domain::{DeadLetterEntry, DeadLetterQuery, TaskId};

/// Durable landing zone for tasks that left the live queue as failures.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Stores one failed task. Pushing the same task twice keeps one entry.
    async fn push(&self, entry: DeadLetterEntry) -> AppResult<()>;

    /// Returns up to `limit` entries not yet drained, oldest first.
    async fn pending(&self, limit: usize) -> AppResult<Vec<DeadLetterEntry>>;

    /// Removes the entry for `task_id` only while it is still the one
    /// escalated at `dead_lettered_at`. Returns whether an entry was removed.
    async fn remove(&self, task_id: TaskId, dead_lettered_at: DateTime<Utc>) -> AppResult<bool>;

    /// Returns the number of entries not yet drained.
    async fn count(&self) -> AppResult<u64>;
}

/// Inspection store fed by the escalation processor.
#[async_trait]
pub trait DeadLetterArchive: Send + Sync {
    /// Inserts or replaces the entry for its task id.
    async fn save(&self, entry: DeadLetterEntry) -> AppResult<()>;

    /// Lists archived entries, newest first.
    async fn list(&self, query: DeadLetterQuery) -> AppResult<Vec<DeadLetterEntry>>;

    /// Finds one archived entry.
    async fn find(&self, task_id: TaskId) -> AppResult<Option<DeadLetterEntry>>;

    /// Records the replacement task of a requeue.
    ///
    /// Fails with `Conflict` when the entry was already requeued and with
    /// `NotFound` when it does not exist.
    async fn mark_requeued(&self, task_id: TaskId, requeued_as: TaskId) -> AppResult<()>;
}
