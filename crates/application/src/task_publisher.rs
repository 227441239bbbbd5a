use std::sync::Arc;

use chrono::{DateTime, Utc};
use lodestar_core::{AppError, AppResult};
use lodestar_domain::{
    BookmarkHash, DeadLetterEntry, DedupKey, GroupKey, NewTask, PublishReceipt,
    ScheduleDefinition, TaskAttributes,
};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::dispatch_ports::{ExecutionStateStore, LeaseQueue};

/// Work request accepted by the task publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishTaskInput {
    /// Ordering scope, typically the workflow definition identity.
    pub group_key: String,
    /// Logical identity of the unit of work.
    pub dedup_key: String,
    /// Opaque task payload.
    pub payload: Value,
    /// Routing attributes.
    pub attributes: TaskAttributes,
}

/// Turns work requests into lease queue entries with correct keys.
#[derive(Clone)]
pub struct TaskPublisher {
    queue: Arc<dyn LeaseQueue>,
    state_store: Option<Arc<dyn ExecutionStateStore>>,
}

impl TaskPublisher {
    /// Creates a task publisher.
    #[must_use]
    pub fn new(queue: Arc<dyn LeaseQueue>) -> Self {
        Self {
            queue,
            state_store: None,
        }
    }

    /// Adds the state store used to resolve bookmarks on resume.
    #[must_use]
    pub fn with_state_store(mut self, state_store: Arc<dyn ExecutionStateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    /// Publishes one work request.
    pub async fn publish(&self, input: PublishTaskInput) -> AppResult<PublishReceipt> {
        let task = NewTask::new(
            GroupKey::new(input.group_key)?,
            DedupKey::new(input.dedup_key)?,
            input.payload,
            input.attributes,
        );

        self.enqueue(task).await
    }

    /// Publishes the firing of `definition` due at `fired_for`.
    ///
    /// The dedup key is derived from the schedule identity and the due instant,
    /// so racing schedulers collapse onto one task.
    pub async fn publish_scheduled(
        &self,
        definition: &ScheduleDefinition,
        fired_for: DateTime<Utc>,
    ) -> AppResult<PublishReceipt> {
        let mut payload = definition.payload().clone();
        if let Value::Object(fields) = &mut payload {
            fields.insert("scheduledFor".to_owned(), json!(fired_for));
        }

        let task = NewTask::new(
            definition.group_key().clone(),
            definition.tick_dedup_key(fired_for)?,
            payload,
            definition.attributes().clone(),
        );

        self.enqueue(task).await
    }

    /// Resumes the workflow suspended at the bookmark matching `hash`.
    ///
    /// The resume task is grouped by workflow instance. The bookmark is consumed
    /// only after the task is enqueued.
    pub async fn resume_bookmark(
        &self,
        hash: &BookmarkHash,
        input: Value,
    ) -> AppResult<PublishReceipt> {
        let state_store = self.state_store.as_ref().ok_or_else(|| {
            AppError::Conflict("bookmark resumption requires an execution state store".to_owned())
        })?;

        let bookmark = state_store
            .resolve_bookmark(hash)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no bookmark matches hash '{hash}'")))?;

        let task = NewTask::new(
            GroupKey::new(bookmark.workflow_instance_id().as_str())?,
            DedupKey::for_resume(bookmark.bookmark_id())?,
            json!({
                "resume": {
                    "bookmarkId": bookmark.bookmark_id(),
                    "workflowInstanceId": bookmark.workflow_instance_id(),
                    "activityNodeId": bookmark.activity_node_id(),
                    "bookmarkPayload": bookmark.payload(),
                    "input": input,
                }
            }),
            TaskAttributes::default(),
        );

        let receipt = self.enqueue(task).await?;
        if !state_store.consume_bookmark(bookmark.bookmark_id()).await? {
            debug!(
                bookmark_id = %bookmark.bookmark_id(),
                "bookmark was already consumed by a concurrent resume"
            );
        }

        Ok(receipt)
    }

    /// Publishes a dead-lettered task again under a fresh dedup key.
    pub async fn republish(&self, entry: &DeadLetterEntry) -> AppResult<PublishReceipt> {
        let task = NewTask::new(
            entry.task.group_key.clone(),
            DedupKey::for_requeue(entry.task.id)?,
            entry.task.payload.clone(),
            entry.task.attributes.clone(),
        );

        self.enqueue(task).await
    }

    async fn enqueue(&self, task: NewTask) -> AppResult<PublishReceipt> {
        let group_key = task.group_key.clone();
        let dedup_key = task.dedup_key.clone();
        let correlation_id = task.attributes.correlation_id.clone().unwrap_or_default();
        let receipt = self.queue.publish(task).await?;

        info!(
            task_id = %receipt.task_id,
            group_key = %group_key,
            dedup_key = %dedup_key,
            correlation_id = %correlation_id,
            disposition = receipt.disposition.as_str(),
            "task published"
        );

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests;
