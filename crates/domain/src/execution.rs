use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{Bookmark, TaskId, TaskMessage};

/// Successful result of executing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Workflow step ran to completion.
    Completed {
        /// Execution output.
        output: Value,
    },
    /// Workflow suspended at a bookmark.
    Suspended {
        /// Suspension point to persist.
        bookmark: Bookmark,
    },
}

/// Failure classification driving retry versus early escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailureKind {
    /// Retry through lease expiry.
    Transient,
    /// Record and acknowledge without further redelivery.
    Permanent,
}

impl ExecutionFailureKind {
    /// Returns stable kind value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ExecutionFailureKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error returned by the execution capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} execution failure: {message}")]
pub struct ExecutionFailure {
    /// Classification.
    pub kind: ExecutionFailureKind,
    /// Human-readable cause.
    pub message: String,
}

impl ExecutionFailure {
    /// Failure worth retrying.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionFailureKind::Transient,
            message: message.into(),
        }
    }

    /// Failure that will not succeed on redelivery.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionFailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Returns whether redelivery is pointless.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.kind == ExecutionFailureKind::Permanent
    }
}

/// Persisted status of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Finished successfully.
    Completed,
    /// Suspended at a bookmark.
    Suspended,
    /// Failed permanently.
    Faulted,
}

impl ExecutionStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Suspended => "suspended",
            Self::Faulted => "faulted",
        }
    }
}

/// Execution record saved through the execution state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Executed task.
    pub task_id: TaskId,
    /// Group of the executed task.
    pub group_key: String,
    /// Delivery attempt that produced this record.
    pub attempt_count: u32,
    /// Final status.
    pub status: ExecutionStatus,
    /// Output, bookmark reference or failure detail.
    pub output: Value,
    /// Recording instant.
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Builds the record for an outcome of `task`.
    #[must_use]
    pub fn from_outcome(
        task: &TaskMessage,
        outcome: &ExecutionOutcome,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let (status, output) = match outcome {
            ExecutionOutcome::Completed { output } => (ExecutionStatus::Completed, output.clone()),
            ExecutionOutcome::Suspended { bookmark } => (
                ExecutionStatus::Suspended,
                serde_json::json!({ "bookmarkId": bookmark.bookmark_id() }),
            ),
        };

        Self::for_task(task, status, output, recorded_at)
    }

    /// Builds the record for a permanent failure of `task`.
    #[must_use]
    pub fn faulted(
        task: &TaskMessage,
        failure: &ExecutionFailure,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self::for_task(
            task,
            ExecutionStatus::Faulted,
            serde_json::json!({ "error": failure.message }),
            recorded_at,
        )
    }

    fn for_task(
        task: &TaskMessage,
        status: ExecutionStatus,
        output: Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.id,
            group_key: task.group_key.as_str().to_owned(),
            attempt_count: task.attempt_count,
            status,
            output,
            recorded_at,
        }
    }
}
