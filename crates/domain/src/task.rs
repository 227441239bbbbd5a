use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use lodestar_core::{AppError, AppResult, NonEmptyString, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique, producer-assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a task identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Parses a task identifier from its textual form.
    pub fn parse(value: &str) -> AppResult<Self> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|error| AppError::Validation(format!("invalid task id '{value}': {error}")))
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Ordering scope. Tasks sharing a group key are delivered in publish order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(NonEmptyString);

impl GroupKey {
    /// Creates a validated group key.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        NonEmptyString::new(value)
            .map(Self)
            .map_err(|_| AppError::Validation("group key must not be empty".to_owned()))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for GroupKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Logical identity of a unit of work, used to collapse redundant publishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(NonEmptyString);

impl DedupKey {
    /// Creates a validated dedup key.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        NonEmptyString::new(value)
            .map(Self)
            .map_err(|_| AppError::Validation("dedup key must not be empty".to_owned()))
    }

    /// Dedup key for one schedule firing.
    ///
    /// Two scheduler instances firing the same definition for the same due
    /// instant derive the same key.
    pub fn for_schedule_tick(schedule_id: &str, fired_for: DateTime<Utc>) -> AppResult<Self> {
        Self::new(format!(
            "schedule:{schedule_id}:{}",
            fired_for.timestamp_millis()
        ))
    }

    /// Dedup key for resuming one bookmark.
    pub fn for_resume(bookmark_id: Uuid) -> AppResult<Self> {
        Self::new(format!("resume:{bookmark_id}"))
    }

    /// Fresh dedup key used when an operator requeues a dead-lettered task.
    pub fn for_requeue(original: TaskId) -> AppResult<Self> {
        Self::new(format!("requeue:{original}:{}", Uuid::new_v4()))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for DedupKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Routing and metrics attributes. Never used for ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAttributes {
    /// Owning tenant, when the task is tenant scoped.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Relative priority hint for consumers.
    #[serde(default)]
    pub priority: i16,
    /// Correlation identifier propagated into logs.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Work request handed to the lease queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Producer-assigned identifier. Discarded when the publish is a duplicate.
    pub id: TaskId,
    /// Ordering scope.
    pub group_key: GroupKey,
    /// Deduplication identity.
    pub dedup_key: DedupKey,
    /// Opaque task payload.
    pub payload: Value,
    /// Routing attributes.
    pub attributes: TaskAttributes,
}

impl NewTask {
    /// Creates a work request with a fresh task identifier.
    #[must_use]
    pub fn new(
        group_key: GroupKey,
        dedup_key: DedupKey,
        payload: Value,
        attributes: TaskAttributes,
    ) -> Self {
        Self {
            id: TaskId::new(),
            group_key,
            dedup_key,
            payload,
            attributes,
        }
    }

    /// Materializes the queue entry at enqueue time.
    #[must_use]
    pub fn into_message(self, enqueued_at: DateTime<Utc>) -> TaskMessage {
        TaskMessage {
            id: self.id,
            group_key: self.group_key,
            dedup_key: self.dedup_key,
            payload: self.payload,
            attributes: self.attributes,
            enqueued_at,
            attempt_count: 0,
        }
    }
}

/// Task message in its stable wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    /// Unique task identifier.
    pub id: TaskId,
    /// Ordering scope.
    pub group_key: GroupKey,
    /// Deduplication identity.
    pub dedup_key: DedupKey,
    /// Opaque task payload.
    pub payload: Value,
    /// Routing attributes.
    pub attributes: TaskAttributes,
    /// Time the task entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Redelivery count, zero on first delivery.
    pub attempt_count: u32,
}

/// Whether a publish enqueued a new task or collapsed onto an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishDisposition {
    /// A new task entered the queue.
    Enqueued,
    /// An unexpired dedup entry matched; nothing was enqueued.
    Duplicate,
}

impl PublishDisposition {
    /// Returns stable disposition value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Result of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Identity of the task that represents this unit of work.
    pub task_id: TaskId,
    /// Whether the publish enqueued or was suppressed.
    pub disposition: PublishDisposition,
}

impl PublishReceipt {
    /// Receipt for a newly enqueued task.
    #[must_use]
    pub fn enqueued(task_id: TaskId) -> Self {
        Self {
            task_id,
            disposition: PublishDisposition::Enqueued,
        }
    }

    /// Receipt for a suppressed duplicate pointing at the surviving task.
    #[must_use]
    pub fn duplicate(task_id: TaskId) -> Self {
        Self {
            task_id,
            disposition: PublishDisposition::Duplicate,
        }
    }

    /// Returns whether the publish was suppressed.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.disposition == PublishDisposition::Duplicate
    }
}
