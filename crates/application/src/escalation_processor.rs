use std::sync::Arc;
use std::time::Duration;

use lodestar_core::{AppError, AppResult};
use lodestar_domain::{DeadLetterEntry, DeadLetterQuery, PublishReceipt, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch_ports::{DeadLetterArchive, DeadLetterSink};
use crate::task_publisher::TaskPublisher;

/// Escalation processor knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationConfig {
    /// Interval between drain passes.
    pub drain_interval: Duration,
    /// Maximum entries moved per pass.
    pub drain_batch: usize,
}

impl EscalationConfig {
    /// Validates configured values.
    pub fn validate(&self) -> AppResult<()> {
        if self.drain_interval.is_zero() {
            return Err(AppError::Validation(
                "escalation drain interval must be greater than zero".to_owned(),
            ));
        }

        if self.drain_batch == 0 {
            return Err(AppError::Validation(
                "escalation drain batch must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Drains the dead-letter sink into the archive and replays entries on request.
#[derive(Clone)]
pub struct EscalationProcessor {
    config: EscalationConfig,
    sink: Arc<dyn DeadLetterSink>,
    archive: Arc<dyn DeadLetterArchive>,
    publisher: TaskPublisher,
}

impl EscalationProcessor {
    /// Creates an escalation processor.
    pub fn new(
        config: EscalationConfig,
        sink: Arc<dyn DeadLetterSink>,
        archive: Arc<dyn DeadLetterArchive>,
        publisher: TaskPublisher,
    ) -> AppResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            sink,
            archive,
            publisher,
        })
    }

    /// Moves up to one batch of sink entries into the archive.
    ///
    /// An entry leaves the sink only after the archive stored it, and only if
    /// no newer escalation of the same task replaced it in the meantime.
    pub async fn drain_once(&self) -> AppResult<usize> {
        let pending = self.sink.pending(self.config.drain_batch).await?;
        let mut drained = 0;

        for entry in pending {
            let task_id = entry.task.id;
            warn!(
                task_id = %task_id,
                group_key = %entry.task.group_key,
                attempt_count = entry.task.attempt_count,
                reason = entry.reason.as_str(),
                error = entry.error_message.as_deref().unwrap_or_default(),
                "archiving dead-lettered task"
            );
            let dead_lettered_at = entry.dead_lettered_at;
            self.archive.save(entry).await?;
            if !self.sink.remove(task_id, dead_lettered_at).await? {
                debug!(
                    task_id = %task_id,
                    "task escalated again while draining; newer entry stays pending"
                );
            }
            drained += 1;
        }

        if drained > 0 {
            info!(drained, "dead-letter sink drained");
        }

        Ok(drained)
    }

    /// Drains on the configured interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.drain_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(error) = self.drain_once().await {
                warn!(error = %error, "dead-letter drain failed");
            }
        }
    }

    /// Lists archived entries.
    pub async fn list(&self, query: DeadLetterQuery) -> AppResult<Vec<DeadLetterEntry>> {
        if query.limit == 0 {
            return Err(AppError::Validation(
                "limit must be greater than zero".to_owned(),
            ));
        }

        self.archive.list(query).await
    }

    /// Republishes an archived entry under a fresh dedup key.
    pub async fn requeue(&self, task_id: TaskId) -> AppResult<PublishReceipt> {
        let entry = self
            .archive
            .find(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dead-letter entry '{task_id}'")))?;

        if let Some(requeued_as) = entry.requeued_as {
            return Err(AppError::Conflict(format!(
                "dead-letter entry '{task_id}' was already requeued as '{requeued_as}'"
            )));
        }

        let receipt = self.publisher.republish(&entry).await?;
        self.archive.mark_requeued(task_id, receipt.task_id).await?;

        info!(
            task_id = %task_id,
            requeued_as = %receipt.task_id,
            "dead-letter entry requeued"
        );
        Ok(receipt)
    }
}
