use chrono::{DateTime, Utc};
use lodestar_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

use crate::{TaskId, TaskMessage};

/// Why a task left the live queue for the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Redelivery budget exceeded.
    Exhausted,
    /// Worker classified the failure as permanent and escalated early.
    Permanent,
}

impl DeadLetterReason {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Permanent => "permanent",
        }
    }

    /// Parses a storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "exhausted" => Ok(Self::Exhausted),
            "permanent" => Ok(Self::Permanent),
            _ => Err(AppError::Validation(format!(
                "unknown dead-letter reason '{value}'"
            ))),
        }
    }
}

/// Failed task preserved for inspection and manual replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Task snapshot including payload, attributes and final attempt count.
    pub task: TaskMessage,
    /// Escalation cause.
    pub reason: DeadLetterReason,
    /// Last known failure message.
    pub error_message: Option<String>,
    /// Escalation instant.
    pub dead_lettered_at: DateTime<Utc>,
    /// Replacement task published by a requeue, if any.
    pub requeued_as: Option<TaskId>,
}

impl DeadLetterEntry {
    /// Entry for a task whose redelivery budget ran out.
    #[must_use]
    pub fn exhausted(task: TaskMessage, dead_lettered_at: DateTime<Utc>) -> Self {
        let error_message = Some(format!(
            "redelivery budget exhausted after {} deliveries",
            task.attempt_count
        ));
        Self {
            task,
            reason: DeadLetterReason::Exhausted,
            error_message,
            dead_lettered_at,
            requeued_as: None,
        }
    }

    /// Entry for a task a worker rejected as permanently failing.
    #[must_use]
    pub fn permanent(
        task: TaskMessage,
        error_message: impl Into<String>,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task,
            reason: DeadLetterReason::Permanent,
            error_message: Some(error_message.into()),
            dead_lettered_at,
            requeued_as: None,
        }
    }

    /// Returns whether an operator already requeued this entry.
    #[must_use]
    pub fn is_requeued(&self) -> bool {
        self.requeued_as.is_some()
    }
}

/// Filter for listing archived dead-letter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterQuery {
    /// Include entries that were already requeued.
    pub include_requeued: bool,
    /// Maximum entries to return.
    pub limit: usize,
    /// Entries to skip.
    pub offset: usize,
}

impl Default for DeadLetterQuery {
    fn default() -> Self {
        Self {
            include_requeued: false,
            limit: 50,
            offset: 0,
        }
    }
}
