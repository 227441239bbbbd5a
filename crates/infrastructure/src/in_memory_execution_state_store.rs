use std::collections::HashMap;

use async_trait::async_trait;
use lodestar_application::ExecutionStateStore;
use lodestar_core::AppResult;
use lodestar_domain::{Bookmark, BookmarkHash, ExecutionRecord, TaskId};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredBookmark {
    bookmark: Bookmark,
    consumed: bool,
}

/// In-memory execution state store.
#[derive(Default)]
pub struct InMemoryExecutionStateStore {
    records: RwLock<Vec<ExecutionRecord>>,
    bookmarks: RwLock<HashMap<Uuid, StoredBookmark>>,
}

impl InMemoryExecutionStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns records saved for one task, oldest first.
    pub async fn records_for(&self, task_id: TaskId) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| record.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionStateStore for InMemoryExecutionStateStore {
    async fn save_execution_result(&self, record: ExecutionRecord) -> AppResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn save_bookmark(&self, bookmark: Bookmark) -> AppResult<()> {
        self.bookmarks.write().await.insert(
            bookmark.bookmark_id(),
            StoredBookmark {
                bookmark,
                consumed: false,
            },
        );
        Ok(())
    }

    async fn resolve_bookmark(&self, hash: &BookmarkHash) -> AppResult<Option<Bookmark>> {
        Ok(self
            .bookmarks
            .read()
            .await
            .values()
            .filter(|stored| !stored.consumed && stored.bookmark.hash() == hash)
            .min_by_key(|stored| stored.bookmark.created_at())
            .map(|stored| stored.bookmark.clone()))
    }

    async fn consume_bookmark(&self, bookmark_id: Uuid) -> AppResult<bool> {
        Ok(self
            .bookmarks
            .write()
            .await
            .get_mut(&bookmark_id)
            .is_some_and(|stored| !std::mem::replace(&mut stored.consumed, true)))
    }
}
