use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_core::AppResult;
use lodestar_domain::ScheduleDefinition;

/// Storage of time-triggered definitions.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Inserts or replaces one definition.
    async fn save_schedule(&self, definition: ScheduleDefinition) -> AppResult<()>;

    /// Lists enabled definitions due at `now`.
    async fn list_due(&self, now: DateTime<Utc>) -> AppResult<Vec<ScheduleDefinition>>;

    /// Moves `next_due_at` forward when it still equals `fired_for`.
    ///
    /// Returns false when another scheduler already advanced the definition.
    async fn advance(
        &self,
        schedule_id: &str,
        fired_for: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> AppResult<bool>;
}
