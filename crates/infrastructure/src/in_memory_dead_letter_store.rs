use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::{DeadLetterArchive, DeadLetterSink};
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{DeadLetterEntry, DeadLetterQuery, TaskId};
use tokio::sync::RwLock;

/// In-memory dead-letter sink and archive.
///
/// The sink keeps escalation order. The archive keeps one entry per task.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    pending: RwLock<Vec<DeadLetterEntry>>,
    archived: RwLock<HashMap<TaskId, DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterStore {
    async fn push(&self, entry: DeadLetterEntry) -> AppResult<()> {
        let mut pending = self.pending.write().await;
        if let Some(existing) = pending
            .iter_mut()
            .find(|existing| existing.task.id == entry.task.id)
        {
            *existing = entry;
        } else {
            pending.push(entry);
        }

        Ok(())
    }

    async fn pending(&self, limit: usize) -> AppResult<Vec<DeadLetterEntry>> {
        Ok(self.pending.read().await.iter().take(limit).cloned().collect())
    }

    async fn remove(&self, task_id: TaskId, dead_lettered_at: DateTime<Utc>) -> AppResult<bool> {
        let mut pending = self.pending.write().await;
        let Some(index) = pending.iter().position(|entry| {
            entry.task.id == task_id && entry.dead_lettered_at == dead_lettered_at
        }) else {
            return Ok(false);
        };

        pending.remove(index);
        Ok(true)
    }

    async fn count(&self) -> AppResult<u64> {
        Ok(self.pending.read().await.len() as u64)
    }
}

#[async_trait]
impl DeadLetterArchive for InMemoryDeadLetterStore {
    async fn save(&self, entry: DeadLetterEntry) -> AppResult<()> {
        let mut archived = self.archived.write().await;
        let requeued_as = archived
            .get(&entry.task.id)
            .and_then(|existing| existing.requeued_as);
        archived.insert(
            entry.task.id,
            DeadLetterEntry {
                requeued_as: entry.requeued_as.or(requeued_as),
                ..entry
            },
        );
        Ok(())
    }

    async fn list(&self, query: DeadLetterQuery) -> AppResult<Vec<DeadLetterEntry>> {
        let archived = self.archived.read().await;
        let mut entries: Vec<DeadLetterEntry> = archived
            .values()
            .filter(|entry| query.include_requeued || !entry.is_requeued())
            .cloned()
            .collect();
        entries.sort_by(|left, right| right.dead_lettered_at.cmp(&left.dead_lettered_at));

        Ok(entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn find(&self, task_id: TaskId) -> AppResult<Option<DeadLetterEntry>> {
        Ok(self.archived.read().await.get(&task_id).cloned())
    }

    async fn mark_requeued(&self, task_id: TaskId, requeued_as: TaskId) -> AppResult<()> {
        let mut archived = self.archived.write().await;
        let entry = archived.get_mut(&task_id).ok_or_else(|| {
            AppError::NotFound(format!("dead-letter entry '{task_id}' does not exist"))
        })?;

        if let Some(existing) = entry.requeued_as {
            return Err(AppError::Conflict(format!(
                "dead-letter entry '{task_id}' was already requeued as '{existing}'"
            )));
        }

        entry.requeued_as = Some(requeued_as);
        Ok(())
    }
}
