//! Process-local grouped lease queue.
//!
//! All state lives behind one mutex so every operation is atomic. Intended for
//! tests, single-node deployments and simulations driven by a manual clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::{
    DeadLetterSink, LeaseQueue, LeaseQueueConfig, LeaseQueueStats, ReapReport,
};
use lodestar_core::{AppError, AppResult, Clock, expiry_after};
use lodestar_domain::{
    DeadLetterEntry, GroupKey, Lease, LeasedTask, NewTask, PublishReceipt, ReceiptToken, TaskId,
    TaskMessage,
};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound between availability re-checks while long-polling, so lapsed
/// leases are noticed without a publish or acknowledgment waking the waiter.
const EXPIRY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct QueuedTask {
    message: TaskMessage,
    sequence: u64,
    receipt_token: Option<ReceiptToken>,
    lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    task_id: TaskId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: HashMap<TaskId, QueuedTask>,
    groups: HashMap<GroupKey, VecDeque<TaskId>>,
    receipts: HashMap<ReceiptToken, TaskId>,
    dedup: HashMap<String, DedupEntry>,
    next_sequence: u64,
    expired_leases: u64,
    dead_lettered: u64,
}

impl QueueState {
    fn live_receipt(&self, receipt_token: &ReceiptToken, now: DateTime<Utc>) -> Option<TaskId> {
        let task_id = self.receipts.get(receipt_token)?;
        let queued = self.tasks.get(task_id)?;
        queued
            .lease_expires_at
            .is_some_and(|expires_at| now < expires_at)
            .then_some(*task_id)
    }

    fn remove_task(&mut self, task_id: TaskId) -> Option<QueuedTask> {
        let queued = self.tasks.remove(&task_id)?;
        if let Some(token) = &queued.receipt_token {
            self.receipts.remove(token);
        }

        let group_key = &queued.message.group_key;
        if let Some(group) = self.groups.get_mut(group_key) {
            group.retain(|queued_id| *queued_id != task_id);
            if group.is_empty() {
                self.groups.remove(group_key);
            }
        }

        Some(queued)
    }

    fn purge_dedup(&mut self, now: DateTime<Utc>) {
        self.dedup.retain(|_, entry| now < entry.expires_at);
    }

    /// Heads of every group without a lease, oldest publish first.
    fn deliverable_heads(&self, max_count: usize) -> Vec<TaskId> {
        let mut heads: Vec<(u64, TaskId)> = self
            .groups
            .values()
            .filter_map(|group| group.front())
            .filter_map(|task_id| self.tasks.get(task_id))
            .filter(|queued| queued.receipt_token.is_none())
            .map(|queued| (queued.sequence, queued.message.id))
            .collect();
        heads.sort_unstable();
        heads.into_iter().take(max_count).map(|(_, id)| id).collect()
    }
}

/// In-memory lease queue with strict per-group ordering.
pub struct InMemoryLeaseQueue {
    config: LeaseQueueConfig,
    clock: Arc<dyn Clock>,
    dead_letters: Arc<dyn DeadLetterSink>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryLeaseQueue {
    /// Creates an empty queue escalating into `dead_letters`.
    pub fn new(
        config: LeaseQueueConfig,
        clock: Arc<dyn Clock>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> AppResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            clock,
            dead_letters,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        })
    }

    async fn reap_locked(&self, state: &mut QueueState) -> AppResult<ReapReport> {
        let now = self.clock.now();
        let expired: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|queued| {
                queued
                    .lease_expires_at
                    .is_some_and(|expires_at| expires_at <= now)
            })
            .map(|queued| queued.message.id)
            .collect();

        let mut report = ReapReport::default();
        for task_id in expired {
            let Some(queued) = state.tasks.get_mut(&task_id) else {
                continue;
            };

            let next_attempt = queued.message.attempt_count.saturating_add(1);
            if next_attempt <= self.config.max_receives {
                if let Some(token) = queued.receipt_token.take() {
                    state.receipts.remove(&token);
                }
                queued.lease_expires_at = None;
                queued.message.attempt_count = next_attempt;
                state.expired_leases += 1;
                report.redelivered += 1;
                debug!(
                    task_id = %task_id,
                    attempt_count = next_attempt,
                    "lease expired; task visible again"
                );
                continue;
            }

            let mut message = queued.message.clone();
            message.attempt_count = next_attempt;
            let entry = DeadLetterEntry::exhausted(message, now);
            self.dead_letters.push(entry).await?;

            state.remove_task(task_id);
            state.expired_leases += 1;
            state.dead_lettered += 1;
            report.dead_lettered += 1;
            warn!(
                task_id = %task_id,
                attempt_count = next_attempt,
                max_receives = self.config.max_receives,
                "redelivery budget exhausted; task moved to dead-letter sink"
            );
        }

        if report.redelivered > 0 || report.dead_lettered > 0 {
            self.available.notify_waiters();
        }

        Ok(report)
    }

    async fn try_receive(&self, max_count: usize) -> AppResult<Vec<LeasedTask>> {
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state).await?;

        let now = self.clock.now();
        let expires_at = expiry_after(now, self.config.lease_duration)?;
        let mut leased = Vec::new();

        for task_id in state.deliverable_heads(max_count) {
            let receipt_token = ReceiptToken::generate();
            let Some(queued) = state.tasks.get_mut(&task_id) else {
                continue;
            };

            queued.receipt_token = Some(receipt_token.clone());
            queued.lease_expires_at = Some(expires_at);
            let task = queued.message.clone();
            state.receipts.insert(receipt_token.clone(), task_id);

            leased.push(LeasedTask {
                task,
                lease: Lease {
                    task_id,
                    receipt_token,
                    expires_at,
                },
            });
        }

        Ok(leased)
    }
}

#[async_trait]
impl LeaseQueue for InMemoryLeaseQueue {
    async fn publish(&self, task: NewTask) -> AppResult<PublishReceipt> {
        let now = self.clock.now();
        let dedup_expires_at = expiry_after(now, self.config.dedup_window)?;
        let mut state = self.state.lock().await;
        state.purge_dedup(now);

        if let Some(existing) = state.dedup.get(task.dedup_key.as_str()) {
            return Ok(PublishReceipt::duplicate(existing.task_id));
        }

        let task_id = task.id;
        if state.tasks.contains_key(&task_id) {
            return Err(AppError::Conflict(format!(
                "task '{task_id}' is already enqueued"
            )));
        }

        state.dedup.insert(
            task.dedup_key.as_str().to_owned(),
            DedupEntry {
                task_id,
                expires_at: dedup_expires_at,
            },
        );

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let message = task.into_message(now);
        state
            .groups
            .entry(message.group_key.clone())
            .or_default()
            .push_back(task_id);
        state.tasks.insert(
            task_id,
            QueuedTask {
                message,
                sequence,
                receipt_token: None,
                lease_expires_at: None,
            },
        );
        drop(state);

        self.available.notify_waiters();
        Ok(PublishReceipt::enqueued(task_id))
    }

    async fn receive(&self, max_count: usize, wait: Duration) -> AppResult<Vec<LeasedTask>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let leased = self.try_receive(max_count).await?;
            if !leased.is_empty() {
                return Ok(leased);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(leased);
            }

            let _ = tokio::time::timeout(remaining.min(EXPIRY_POLL_INTERVAL), notified).await;
        }
    }

    async fn acknowledge(&self, receipt_token: &ReceiptToken) -> AppResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task_id = state.live_receipt(receipt_token, now).ok_or_else(|| {
            AppError::LeaseExpired(format!(
                "receipt token '{receipt_token}' does not match a live lease"
            ))
        })?;

        state.remove_task(task_id);
        drop(state);

        self.available.notify_waiters();
        Ok(())
    }

    async fn extend_lease(
        &self,
        receipt_token: &ReceiptToken,
        extension: Duration,
    ) -> AppResult<Lease> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, extension)?;
        let mut state = self.state.lock().await;
        let task_id = state.live_receipt(receipt_token, now).ok_or_else(|| {
            AppError::LeaseExpired(format!(
                "receipt token '{receipt_token}' does not match a live lease"
            ))
        })?;

        if let Some(queued) = state.tasks.get_mut(&task_id) {
            queued.lease_expires_at = Some(expires_at);
        }

        Ok(Lease {
            task_id,
            receipt_token: receipt_token.clone(),
            expires_at,
        })
    }

    async fn reap_expired(&self) -> AppResult<ReapReport> {
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state).await
    }

    async fn stats(&self) -> AppResult<LeaseQueueStats> {
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state).await?;
        state.purge_dedup(self.clock.now());

        let in_flight = state.receipts.len() as u64;
        Ok(LeaseQueueStats {
            visible: state.tasks.len() as u64 - in_flight,
            in_flight,
            expired_leases: state.expired_leases,
            dead_lettered: state.dead_lettered,
            dedup_entries: state.dedup.len() as u64,
        })
    }
}
