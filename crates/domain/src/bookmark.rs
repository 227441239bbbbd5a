use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use lodestar_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lookup hash matching resume signals to suspended bookmarks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkHash(String);

impl BookmarkHash {
    /// Wraps an existing hash value.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "bookmark hash must not be empty".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Derives the hash for an activity type and its resume stimulus.
    ///
    /// The stimulus is hashed in its serialized JSON form, so producers and the
    /// suspended activity must agree on the stimulus shape.
    #[must_use]
    pub fn compute(activity_type: &str, stimulus: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(activity_type.as_bytes());
        hasher.update([0_u8]);
        hasher.update(stimulus.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the hash as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for BookmarkHash {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Persisted suspension point of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    bookmark_id: Uuid,
    workflow_instance_id: NonEmptyString,
    activity_node_id: NonEmptyString,
    hash: BookmarkHash,
    payload: Value,
    created_at: DateTime<Utc>,
}

/// Input payload used to construct a validated bookmark.
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkInput {
    /// Suspended workflow instance.
    pub workflow_instance_id: String,
    /// Activity the instance resumes at.
    pub activity_node_id: String,
    /// Lookup hash.
    pub hash: BookmarkHash,
    /// Activity-specific state.
    pub payload: Value,
}

impl Bookmark {
    /// Creates a bookmark with a fresh identifier.
    pub fn new(input: BookmarkInput, created_at: DateTime<Utc>) -> AppResult<Self> {
        Self::restore(Uuid::new_v4(), input, created_at)
    }

    /// Rebuilds a bookmark from storage.
    pub fn restore(
        bookmark_id: Uuid,
        input: BookmarkInput,
        created_at: DateTime<Utc>,
    ) -> AppResult<Self> {
        let BookmarkInput {
            workflow_instance_id,
            activity_node_id,
            hash,
            payload,
        } = input;

        Ok(Self {
            bookmark_id,
            workflow_instance_id: NonEmptyString::new(workflow_instance_id)?,
            activity_node_id: NonEmptyString::new(activity_node_id)?,
            hash,
            payload,
            created_at,
        })
    }

    /// Returns the bookmark identifier.
    #[must_use]
    pub fn bookmark_id(&self) -> Uuid {
        self.bookmark_id
    }

    /// Returns the suspended workflow instance.
    #[must_use]
    pub fn workflow_instance_id(&self) -> &NonEmptyString {
        &self.workflow_instance_id
    }

    /// Returns the activity the instance resumes at.
    #[must_use]
    pub fn activity_node_id(&self) -> &NonEmptyString {
        &self.activity_node_id
    }

    /// Returns the lookup hash.
    #[must_use]
    pub fn hash(&self) -> &BookmarkHash {
        &self.hash
    }

    /// Returns activity-specific state.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the creation instant.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
