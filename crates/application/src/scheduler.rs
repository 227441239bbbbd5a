use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lodestar_core::{AppError, AppResult, Clock, expiry_after};
use lodestar_domain::{DistributedLock, HolderId, LockAcquisition, ScheduleDefinition};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch_ports::{LockManager, ScheduleRepository};
use crate::task_publisher::TaskPublisher;

/// Scheduler knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Lock holder identity of this scheduler instance.
    pub holder_id: String,
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// TTL of per-definition locks, a small multiple of the tick interval.
    pub lock_ttl: Duration,
}

impl SchedulerConfig {
    /// Validates configured values.
    pub fn validate(&self) -> AppResult<()> {
        if self.tick_interval.is_zero() {
            return Err(AppError::Validation(
                "scheduler tick interval must be greater than zero".to_owned(),
            ));
        }

        if self.lock_ttl < self.tick_interval {
            return Err(AppError::Validation(
                "scheduler lock ttl must be at least one tick interval".to_owned(),
            ));
        }

        expiry_after(Utc::now(), self.lock_ttl)?;

        Ok(())
    }
}

/// Counters of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerTickReport {
    /// Due definitions evaluated.
    pub evaluated: u32,
    /// Firings that enqueued a new task.
    pub published: u32,
    /// Firings collapsed onto an existing task by the dedup key.
    pub duplicates: u32,
    /// Definitions skipped because another instance held the lock.
    pub lock_denied: u32,
    /// Definitions that failed to fire.
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireOutcome {
    Published,
    Duplicate,
    LockDenied,
}

/// Periodic evaluator of time-triggered definitions.
///
/// Per definition: acquire the lock, publish with a deterministic dedup key,
/// advance the definition, release. Either layer alone prevents double fires.
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    holder_id: HolderId,
    schedules: Arc<dyn ScheduleRepository>,
    locks: Arc<dyn LockManager>,
    publisher: TaskPublisher,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Creates a scheduler.
    pub fn new(
        config: SchedulerConfig,
        schedules: Arc<dyn ScheduleRepository>,
        locks: Arc<dyn LockManager>,
        publisher: TaskPublisher,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        config.validate()?;
        let holder_id = HolderId::new(config.holder_id.as_str())?;

        Ok(Self {
            config,
            holder_id,
            schedules,
            locks,
            publisher,
            clock,
        })
    }

    /// Fires every due definition once.
    pub async fn tick(&self) -> AppResult<SchedulerTickReport> {
        let now = self.clock.now();
        let due = self.schedules.list_due(now).await?;
        let mut report = SchedulerTickReport::default();

        for definition in due {
            report.evaluated += 1;
            match self.fire(&definition).await {
                Ok(FireOutcome::Published) => report.published += 1,
                Ok(FireOutcome::Duplicate) => report.duplicates += 1,
                Ok(FireOutcome::LockDenied) => report.lock_denied += 1,
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        holder_id = %self.holder_id,
                        schedule_id = %definition.schedule_id(),
                        error = %error,
                        "schedule firing failed"
                    );
                }
            }
        }

        if report.evaluated > 0 {
            info!(
                holder_id = %self.holder_id,
                evaluated = report.evaluated,
                published = report.published,
                duplicates = report.duplicates,
                lock_denied = report.lock_denied,
                failed = report.failed,
                "scheduler tick"
            );
        }

        Ok(report)
    }

    /// Ticks on the configured interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(error) = self.tick().await {
                warn!(holder_id = %self.holder_id, error = %error, "scheduler tick failed");
            }
        }

        info!(holder_id = %self.holder_id, "scheduler stopped");
    }

    async fn fire(&self, definition: &ScheduleDefinition) -> AppResult<FireOutcome> {
        let resource_name = definition.lock_resource()?;
        let lock = match self
            .locks
            .acquire(&resource_name, &self.holder_id, self.config.lock_ttl)
            .await?
        {
            LockAcquisition::Acquired(lock) => lock,
            LockAcquisition::AlreadyHeld { holder_id, .. } => {
                debug!(
                    resource_name = %resource_name,
                    current_holder = holder_id.as_ref().map(HolderId::as_str).unwrap_or("unknown"),
                    "schedule lock denied"
                );
                return Ok(FireOutcome::LockDenied);
            }
        };

        let fired = self.publish_and_advance(definition, &lock).await;

        if let Err(error) = self
            .locks
            .release(&resource_name, &self.holder_id, lock.fencing_token)
            .await
        {
            warn!(
                resource_name = %resource_name,
                fencing_token = %lock.fencing_token,
                error = %error,
                "schedule lock release failed; lock will lapse by ttl"
            );
        }

        fired
    }

    async fn publish_and_advance(
        &self,
        definition: &ScheduleDefinition,
        lock: &DistributedLock,
    ) -> AppResult<FireOutcome> {
        let fired_for = definition.next_due_at();
        let receipt = self
            .publisher
            .publish_scheduled(definition, fired_for)
            .await?;

        // Expiry is judged by the lock backend's clock, never the local one.
        self.locks
            .refresh(
                &lock.resource_name,
                &self.holder_id,
                lock.fencing_token,
                self.config.lock_ttl,
            )
            .await?;

        let now = self.clock.now();

        let advanced = self
            .schedules
            .advance(
                definition.schedule_id().as_str(),
                fired_for,
                definition.next_due_after(now),
            )
            .await?;
        if !advanced {
            debug!(
                schedule_id = %definition.schedule_id(),
                "schedule already advanced by another instance"
            );
        }

        Ok(if receipt.is_duplicate() {
            FireOutcome::Duplicate
        } else {
            FireOutcome::Published
        })
    }
}

#[cfg(test)]
mod tests;
