use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestar_application::ScheduleRepository;
use lodestar_core::AppResult;
use lodestar_domain::ScheduleDefinition;
use tokio::sync::RwLock;

/// In-memory schedule definition store.
#[derive(Default)]
pub struct InMemoryScheduleRepository {
    definitions: RwLock<HashMap<String, ScheduleDefinition>>,
}

impl InMemoryScheduleRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns one definition by identity.
    pub async fn find(&self, schedule_id: &str) -> Option<ScheduleDefinition> {
        self.definitions.read().await.get(schedule_id).cloned()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn save_schedule(&self, definition: ScheduleDefinition) -> AppResult<()> {
        self.definitions
            .write()
            .await
            .insert(definition.schedule_id().as_str().to_owned(), definition);
        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> AppResult<Vec<ScheduleDefinition>> {
        let mut due: Vec<ScheduleDefinition> = self
            .definitions
            .read()
            .await
            .values()
            .filter(|definition| definition.is_due_at(now))
            .cloned()
            .collect();
        due.sort_by_key(ScheduleDefinition::next_due_at);
        Ok(due)
    }

    async fn advance(
        &self,
        schedule_id: &str,
        fired_for: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut definitions = self.definitions.write().await;
        let Some(definition) = definitions.get_mut(schedule_id) else {
            return Ok(false);
        };

        if definition.next_due_at() != fired_for {
            return Ok(false);
        }

        *definition = definition.advanced_to(next_due_at);
        Ok(true)
    }
}
