use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use lodestar_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{TaskId, TaskMessage};

/// Opaque proof of lease ownership returned by `receive`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    /// Issues a new unguessable receipt token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps a token previously issued by a queue backend.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "receipt token must not be empty".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ReceiptToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Time-bounded exclusive claim on one in-flight task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased task.
    pub task_id: TaskId,
    /// Token the holder must present to acknowledge or extend.
    pub receipt_token: ReceiptToken,
    /// Instant after which the task becomes visible again.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Returns whether the lease still excludes other consumers at `now`.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Task handed to a consumer together with its lease.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    /// Task snapshot at delivery time.
    pub task: TaskMessage,
    /// Lease covering this delivery.
    pub lease: Lease,
}
