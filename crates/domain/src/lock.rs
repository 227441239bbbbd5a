use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use lodestar_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

/// Name of a resource guarded by the distributed lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(NonEmptyString);

impl ResourceName {
    /// Creates a validated resource name.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        NonEmptyString::new(value)
            .map(Self)
            .map_err(|_| AppError::Validation("lock resource name must not be empty".to_owned()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ResourceName {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Identity of a lock requester, typically a scheduler or worker instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(NonEmptyString);

impl HolderId {
    /// Creates a validated holder id.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        NonEmptyString::new(value)
            .map(Self)
            .map_err(|_| AppError::Validation("lock holder id must not be empty".to_owned()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for HolderId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Monotonically increasing proof of lock-holder recency.
///
/// The default value precedes every issued token.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Wraps a raw token value.
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the token strictly following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the raw token value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for FencingToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Current lock record for one resource.
///
/// A record past `expires_at` is logically free even if it is still stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLock {
    /// Guarded resource.
    pub resource_name: ResourceName,
    /// Current holder.
    pub holder_id: HolderId,
    /// Token issued on acquisition.
    pub fencing_token: FencingToken,
    /// Acquisition instant.
    pub acquired_at: DateTime<Utc>,
    /// Expiry instant, moved forward by refresh.
    pub expires_at: DateTime<Utc>,
}

impl DistributedLock {
    /// Returns whether the record no longer excludes other holders at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns whether `holder_id` and `fencing_token` identify this record.
    #[must_use]
    pub fn is_held_by(&self, holder_id: &HolderId, fencing_token: FencingToken) -> bool {
        self.holder_id == *holder_id && self.fencing_token == fencing_token
    }
}

/// Outcome of an acquisition attempt. Contention is an expected outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The caller now holds the lock.
    Acquired(DistributedLock),
    /// Another holder owns an unexpired lock.
    AlreadyHeld {
        /// Current holder, when the backend reports it.
        holder_id: Option<HolderId>,
        /// Current expiry, when the backend reports it.
        expires_at: Option<DateTime<Utc>>,
    },
}

impl LockAcquisition {
    /// Returns the acquired lock, if any.
    #[must_use]
    pub fn acquired(self) -> Option<DistributedLock> {
        match self {
            Self::Acquired(lock) => Some(lock),
            Self::AlreadyHeld { .. } => None,
        }
    }
}
