use async_trait::async_trait;
use lodestar_core::AppResult;
use lodestar_domain::{Bookmark, BookmarkHash, ExecutionRecord};
use uuid::Uuid;

/// Workflow state persistence consumed by the dispatch layer.
#[async_trait]
pub trait ExecutionStateStore: Send + Sync {
    /// Persists one execution record.
    async fn save_execution_result(&self, record: ExecutionRecord) -> AppResult<()>;

    /// Persists one suspension point.
    async fn save_bookmark(&self, bookmark: Bookmark) -> AppResult<()>;

    /// Finds the oldest unconsumed bookmark with the given hash.
    async fn resolve_bookmark(&self, hash: &BookmarkHash) -> AppResult<Option<Bookmark>>;

    /// Marks a bookmark consumed. Returns false when it was already consumed.
    async fn consume_bookmark(&self, bookmark_id: Uuid) -> AppResult<bool>;
}
