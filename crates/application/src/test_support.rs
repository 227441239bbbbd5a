//! Fakes shared by the service test suites.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lodestar_core::{AppError, AppResult, Clock, ManualClock, expiry_after};
use lodestar_domain::{
    Bookmark, BookmarkHash, DeadLetterEntry, DeadLetterQuery, DistributedLock, ExecutionFailure,
    ExecutionOutcome, ExecutionRecord, FencingToken, HolderId, Lease, LeasedTask, LockAcquisition,
    NewTask, PublishReceipt, ReceiptToken, ResourceName, ScheduleDefinition, TaskId, TaskMessage,
};

use crate::dispatch_ports::{
    DeadLetterArchive, DeadLetterSink, ExecutionStateStore, LeaseQueue, LeaseQueueStats,
    LockManager, ReapReport, ScheduleRepository, TaskExecutor,
};

pub(crate) fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        DateTime::parse_from_rfc3339("2026-05-01T08:00:00Z")
            .map(|value| value.with_timezone(&Utc))
            .unwrap_or_else(|_| unreachable!()),
    ))
}

/// Ungrouped queue that records what the services did with it.
#[derive(Default)]
pub(crate) struct FakeLeaseQueue {
    pub(crate) published: Mutex<Vec<TaskMessage>>,
    pub(crate) dedup: Mutex<HashMap<String, TaskId>>,
    pub(crate) leases: Mutex<HashMap<String, TaskId>>,
    pub(crate) acknowledged: Mutex<Vec<TaskId>>,
    pub(crate) extended: AtomicUsize,
    pub(crate) reject_extensions: Mutex<bool>,
    pub(crate) reject_acknowledgments: Mutex<bool>,
    pub(crate) fail_receives: Mutex<bool>,
    pub(crate) receive_calls: AtomicUsize,
}

impl FakeLeaseQueue {
    pub(crate) async fn lease(&self, task: TaskMessage) -> LeasedTask {
        let receipt_token = ReceiptToken::generate();
        self.leases
            .lock()
            .await
            .insert(receipt_token.as_str().to_owned(), task.id);
        LeasedTask {
            lease: Lease {
                task_id: task.id,
                receipt_token,
                expires_at: Utc::now() + chrono::Duration::seconds(30),
            },
            task,
        }
    }

    pub(crate) async fn push(&self, task: NewTask) {
        self.published.lock().await.push(task.into_message(Utc::now()));
    }

    pub(crate) async fn acknowledged_ids(&self) -> Vec<TaskId> {
        self.acknowledged.lock().await.clone()
    }

    /// Drops every live lease as if its visibility timeout passed.
    pub(crate) async fn lapse_leases(&self) {
        self.leases.lock().await.clear();
    }
}

#[async_trait]
impl LeaseQueue for FakeLeaseQueue {
    async fn publish(&self, task: NewTask) -> AppResult<PublishReceipt> {
        let mut dedup = self.dedup.lock().await;
        if let Some(existing) = dedup.get(task.dedup_key.as_str()) {
            return Ok(PublishReceipt::duplicate(*existing));
        }

        dedup.insert(task.dedup_key.as_str().to_owned(), task.id);
        let task_id = task.id;
        self.published.lock().await.push(task.into_message(Utc::now()));
        Ok(PublishReceipt::enqueued(task_id))
    }

    async fn receive(&self, max_count: usize, wait: Duration) -> AppResult<Vec<LeasedTask>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_receives.lock().await {
            return Err(AppError::Internal("queue unavailable".to_owned()));
        }

        let pending: Vec<TaskMessage> = {
            let mut published = self.published.lock().await;
            let take = max_count.min(published.len());
            published.drain(..take).collect()
        };
        if pending.is_empty() {
            tokio::time::sleep(wait).await;
        }

        let mut leased = Vec::with_capacity(pending.len());
        for task in pending {
            leased.push(self.lease(task).await);
        }
        Ok(leased)
    }

    async fn acknowledge(&self, receipt_token: &ReceiptToken) -> AppResult<()> {
        if *self.reject_acknowledgments.lock().await {
            self.leases.lock().await.remove(receipt_token.as_str());
        }

        let task_id = self
            .leases
            .lock()
            .await
            .remove(receipt_token.as_str())
            .ok_or_else(|| AppError::LeaseExpired(receipt_token.to_string()))?;
        self.acknowledged.lock().await.push(task_id);
        Ok(())
    }

    async fn extend_lease(
        &self,
        receipt_token: &ReceiptToken,
        extension: Duration,
    ) -> AppResult<Lease> {
        if *self.reject_extensions.lock().await {
            self.leases.lock().await.remove(receipt_token.as_str());
        }

        let task_id = self
            .leases
            .lock()
            .await
            .get(receipt_token.as_str())
            .copied()
            .ok_or_else(|| AppError::LeaseExpired(receipt_token.to_string()))?;
        self.extended.fetch_add(1, Ordering::SeqCst);
        Ok(Lease {
            task_id,
            receipt_token: receipt_token.clone(),
            expires_at: expiry_after(Utc::now(), extension)?,
        })
    }

    async fn reap_expired(&self) -> AppResult<ReapReport> {
        Ok(ReapReport::default())
    }

    async fn stats(&self) -> AppResult<LeaseQueueStats> {
        Ok(LeaseQueueStats {
            visible: self.published.lock().await.len() as u64,
            in_flight: self.leases.lock().await.len() as u64,
            ..LeaseQueueStats::default()
        })
    }
}

/// Executor returning a scripted result per payload `mode` field.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    pub(crate) invocations: AtomicUsize,
    pub(crate) running: AtomicUsize,
    pub(crate) peak_running: AtomicUsize,
    pub(crate) delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        task: &TaskMessage,
        cancellation: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        let cancelled = match self.delay {
            Some(delay) => tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = cancellation.cancelled() => true,
            },
            None => false,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Err(ExecutionFailure::transient("cancelled"));
        }

        match task.payload["mode"].as_str() {
            Some("transient") => Err(ExecutionFailure::transient("upstream unavailable")),
            Some("permanent") => Err(ExecutionFailure::permanent("payload failed validation")),
            Some("suspend") => {
                let bookmark = Bookmark::new(
                    lodestar_domain::BookmarkInput {
                        workflow_instance_id: "instance-1".to_owned(),
                        activity_node_id: "approve".to_owned(),
                        hash: BookmarkHash::compute("approval", &json!({"id": 1})),
                        payload: json!({}),
                    },
                    Utc::now(),
                )
                .map_err(|error| ExecutionFailure::permanent(error.to_string()))?;
                Ok(ExecutionOutcome::Suspended { bookmark })
            }
            _ => Ok(ExecutionOutcome::Completed {
                output: json!({"ok": true}),
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeStateStore {
    pub(crate) records: Mutex<Vec<ExecutionRecord>>,
    pub(crate) bookmarks: Mutex<Vec<Bookmark>>,
    pub(crate) consumed: Mutex<HashSet<Uuid>>,
    pub(crate) fail_saves: Mutex<bool>,
}

#[async_trait]
impl ExecutionStateStore for FakeStateStore {
    async fn save_execution_result(&self, record: ExecutionRecord) -> AppResult<()> {
        if *self.fail_saves.lock().await {
            return Err(AppError::Internal("state store unavailable".to_owned()));
        }
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn save_bookmark(&self, bookmark: Bookmark) -> AppResult<()> {
        self.bookmarks.lock().await.push(bookmark);
        Ok(())
    }

    async fn resolve_bookmark(&self, hash: &BookmarkHash) -> AppResult<Option<Bookmark>> {
        let consumed = self.consumed.lock().await;
        Ok(self
            .bookmarks
            .lock()
            .await
            .iter()
            .find(|bookmark| {
                bookmark.hash() == hash && !consumed.contains(&bookmark.bookmark_id())
            })
            .cloned())
    }

    async fn consume_bookmark(&self, bookmark_id: Uuid) -> AppResult<bool> {
        Ok(self.consumed.lock().await.insert(bookmark_id))
    }
}

#[derive(Default)]
pub(crate) struct FakeDeadLetters {
    pub(crate) sink: Mutex<Vec<DeadLetterEntry>>,
    pub(crate) archive: Mutex<HashMap<TaskId, DeadLetterEntry>>,
}

#[async_trait]
impl DeadLetterSink for FakeDeadLetters {
    async fn push(&self, entry: DeadLetterEntry) -> AppResult<()> {
        let mut sink = self.sink.lock().await;
        sink.retain(|existing| existing.task.id != entry.task.id);
        sink.push(entry);
        Ok(())
    }

    async fn pending(&self, limit: usize) -> AppResult<Vec<DeadLetterEntry>> {
        Ok(self.sink.lock().await.iter().take(limit).cloned().collect())
    }

    async fn remove(&self, task_id: TaskId, dead_lettered_at: DateTime<Utc>) -> AppResult<bool> {
        let mut sink = self.sink.lock().await;
        let before = sink.len();
        sink.retain(|entry| {
            entry.task.id != task_id || entry.dead_lettered_at != dead_lettered_at
        });
        Ok(sink.len() < before)
    }

    async fn count(&self) -> AppResult<u64> {
        Ok(self.sink.lock().await.len() as u64)
    }
}

#[async_trait]
impl DeadLetterArchive for FakeDeadLetters {
    async fn save(&self, entry: DeadLetterEntry) -> AppResult<()> {
        self.archive.lock().await.insert(entry.task.id, entry);
        Ok(())
    }

    async fn list(&self, query: DeadLetterQuery) -> AppResult<Vec<DeadLetterEntry>> {
        Ok(self
            .archive
            .lock()
            .await
            .values()
            .filter(|entry| query.include_requeued || !entry.is_requeued())
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn find(&self, task_id: TaskId) -> AppResult<Option<DeadLetterEntry>> {
        Ok(self.archive.lock().await.get(&task_id).cloned())
    }

    async fn mark_requeued(&self, task_id: TaskId, requeued_as: TaskId) -> AppResult<()> {
        let mut archive = self.archive.lock().await;
        let entry = archive
            .get_mut(&task_id)
            .ok_or_else(|| AppError::NotFound(format!("dead letter '{task_id}'")))?;
        if entry.is_requeued() {
            return Err(AppError::Conflict(format!(
                "dead letter '{task_id}' was already requeued"
            )));
        }
        entry.requeued_as = Some(requeued_as);
        Ok(())
    }
}

/// Lock manager sharing one table between several scheduler instances.
pub(crate) struct FakeLockManager {
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<ResourceName, DistributedLock>>,
    last_tokens: Mutex<HashMap<ResourceName, FencingToken>>,
    pub(crate) reject_refreshes: Mutex<bool>,
}

impl FakeLockManager {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            locks: Mutex::new(HashMap::new()),
            last_tokens: Mutex::new(HashMap::new()),
            reject_refreshes: Mutex::new(false),
        }
    }
}

#[async_trait]
impl LockManager for FakeLockManager {
    async fn acquire(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        ttl: Duration,
    ) -> AppResult<LockAcquisition> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().await;
        if let Some(current) = locks.get(resource_name)
            && !current.is_expired_at(now)
        {
            return Ok(LockAcquisition::AlreadyHeld {
                holder_id: Some(current.holder_id.clone()),
                expires_at: Some(current.expires_at),
            });
        }

        let mut last_tokens = self.last_tokens.lock().await;
        let token = last_tokens
            .get(resource_name)
            .copied()
            .unwrap_or(FencingToken::new(0))
            .next();
        last_tokens.insert(resource_name.clone(), token);

        let lock = DistributedLock {
            resource_name: resource_name.clone(),
            holder_id: holder_id.clone(),
            fencing_token: token,
            acquired_at: now,
            expires_at: expiry_after(now, ttl)?,
        };
        locks.insert(resource_name.clone(), lock.clone());
        Ok(LockAcquisition::Acquired(lock))
    }

    async fn release(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
    ) -> AppResult<()> {
        let mut locks = self.locks.lock().await;
        match locks.get(resource_name) {
            Some(current) if current.is_held_by(holder_id, fencing_token) => {
                locks.remove(resource_name);
                Ok(())
            }
            _ => Err(AppError::StaleLockHolder(resource_name.to_string())),
        }
    }

    async fn refresh(
        &self,
        resource_name: &ResourceName,
        holder_id: &HolderId,
        fencing_token: FencingToken,
        ttl: Duration,
    ) -> AppResult<DistributedLock> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().await;
        if *self.reject_refreshes.lock().await {
            locks.remove(resource_name);
        }

        match locks.get_mut(resource_name) {
            Some(current)
                if current.is_held_by(holder_id, fencing_token) && !current.is_expired_at(now) =>
            {
                current.expires_at = expiry_after(now, ttl)?;
                Ok(current.clone())
            }
            _ => Err(AppError::StaleLockHolder(resource_name.to_string())),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeScheduleRepository {
    pub(crate) definitions: Mutex<HashMap<String, ScheduleDefinition>>,
    pub(crate) advanced: AtomicUsize,
}

#[async_trait]
impl ScheduleRepository for FakeScheduleRepository {
    async fn save_schedule(&self, definition: ScheduleDefinition) -> AppResult<()> {
        self.definitions
            .lock()
            .await
            .insert(definition.schedule_id().as_str().to_owned(), definition);
        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> AppResult<Vec<ScheduleDefinition>> {
        Ok(self
            .definitions
            .lock()
            .await
            .values()
            .filter(|definition| definition.is_due_at(now))
            .cloned()
            .collect())
    }

    async fn advance(
        &self,
        schedule_id: &str,
        fired_for: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut definitions = self.definitions.lock().await;
        let Some(definition) = definitions.get(schedule_id) else {
            return Ok(false);
        };
        if definition.next_due_at() != fired_for {
            return Ok(false);
        }

        let advanced = definition.advanced_to(next_due_at);
        definitions.insert(schedule_id.to_owned(), advanced);
        self.advanced.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
