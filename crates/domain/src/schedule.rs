use chrono::{DateTime, Duration, Utc};
use lodestar_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DedupKey, GroupKey, ResourceName, TaskAttributes};

/// Time-triggered work definition evaluated by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    schedule_id: NonEmptyString,
    group_key: GroupKey,
    payload: Value,
    attributes: TaskAttributes,
    interval_seconds: u32,
    next_due_at: DateTime<Utc>,
    is_enabled: bool,
}

/// Input payload used to construct a validated schedule definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDefinitionInput {
    /// Stable schedule identity, also the lock key.
    pub schedule_id: String,
    /// Group key of published tasks.
    pub group_key: String,
    /// Payload of published tasks.
    pub payload: Value,
    /// Attributes of published tasks.
    pub attributes: TaskAttributes,
    /// Fixed firing interval.
    pub interval_seconds: u32,
    /// First or next due instant.
    pub next_due_at: DateTime<Utc>,
    /// Enabled/disabled flag.
    pub is_enabled: bool,
}

impl ScheduleDefinition {
    /// Creates a validated schedule definition.
    pub fn new(input: ScheduleDefinitionInput) -> AppResult<Self> {
        let ScheduleDefinitionInput {
            schedule_id,
            group_key,
            payload,
            attributes,
            interval_seconds,
            next_due_at,
            is_enabled,
        } = input;

        if interval_seconds == 0 {
            return Err(AppError::Validation(
                "schedule interval_seconds must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            schedule_id: NonEmptyString::new(schedule_id)?,
            group_key: GroupKey::new(group_key)?,
            payload,
            attributes,
            interval_seconds,
            next_due_at,
            is_enabled,
        })
    }

    /// Returns schedule identity.
    #[must_use]
    pub fn schedule_id(&self) -> &NonEmptyString {
        &self.schedule_id
    }

    /// Returns group key of published tasks.
    #[must_use]
    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    /// Returns payload of published tasks.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns attributes of published tasks.
    #[must_use]
    pub fn attributes(&self) -> &TaskAttributes {
        &self.attributes
    }

    /// Returns the firing interval in seconds.
    #[must_use]
    pub fn interval_seconds(&self) -> u32 {
        self.interval_seconds
    }

    /// Returns the next due instant.
    #[must_use]
    pub fn next_due_at(&self) -> DateTime<Utc> {
        self.next_due_at
    }

    /// Returns whether the schedule is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    /// Returns whether the schedule should fire at `now`.
    #[must_use]
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && self.next_due_at <= now
    }

    /// First due instant strictly after `now` on this schedule's grid.
    ///
    /// Missed firings collapse: a scheduler that was down for several intervals
    /// fires once and then realigns.
    #[must_use]
    pub fn next_due_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = Duration::seconds(i64::from(self.interval_seconds));
        if self.next_due_at > now {
            return self.next_due_at;
        }

        let interval_ms = interval.num_milliseconds().max(1);
        let elapsed_ms = (now - self.next_due_at).num_milliseconds();
        let skipped = elapsed_ms / interval_ms + 1;
        self.next_due_at + Duration::milliseconds(skipped.saturating_mul(interval_ms))
    }

    /// Returns a copy rescheduled to `next_due_at`.
    #[must_use]
    pub fn advanced_to(&self, next_due_at: DateTime<Utc>) -> Self {
        Self {
            next_due_at,
            ..self.clone()
        }
    }

    /// Lock resource guarding this schedule.
    pub fn lock_resource(&self) -> AppResult<ResourceName> {
        ResourceName::new(format!("schedule:{}", self.schedule_id))
    }

    /// Deterministic dedup key for the firing due at `fired_for`.
    pub fn tick_dedup_key(&self, fired_for: DateTime<Utc>) -> AppResult<DedupKey> {
        DedupKey::for_schedule_tick(self.schedule_id.as_str(), fired_for)
    }
}
