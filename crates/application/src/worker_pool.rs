use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lodestar_core::{AppError, AppResult, Clock};
use lodestar_domain::{
    DeadLetterEntry, ExecutionFailure, ExecutionOutcome, ExecutionRecord, LeasedTask,
    ReceiptToken, TaskMessage,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch_ports::{DeadLetterSink, ExecutionStateStore, LeaseQueue, TaskExecutor};

/// Minimum pause after a failed receive.
const RECEIVE_RETRY_FLOOR: Duration = Duration::from_millis(100);

/// Worker pool knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Identity used in logs.
    pub worker_id: String,
    /// Maximum concurrently executing tasks.
    pub max_concurrency: usize,
    /// Maximum tasks requested per receive call.
    pub batch_size: usize,
    /// Long-poll wait per receive call.
    pub receive_wait: Duration,
    /// Extend leases every half lease period while a task runs.
    pub lease_renewal: bool,
    /// Lease period granted by the queue, used for renewals and for the
    /// extension that confirms a lease before dead-lettering.
    pub lease_duration: Duration,
    /// Time allowed for in-flight tasks to finish after shutdown starts.
    pub shutdown_deadline: Duration,
}

impl WorkerPoolConfig {
    /// Validates configured values.
    pub fn validate(&self) -> AppResult<()> {
        if self.worker_id.trim().is_empty() {
            return Err(AppError::Validation(
                "worker_id must not be empty".to_owned(),
            ));
        }

        if self.max_concurrency == 0 {
            return Err(AppError::Validation(
                "worker max_concurrency must be greater than zero".to_owned(),
            ));
        }

        if self.batch_size == 0 {
            return Err(AppError::Validation(
                "worker batch_size must be greater than zero".to_owned(),
            ));
        }

        if self.lease_duration.is_zero() {
            return Err(AppError::Validation(
                "worker lease duration must be greater than zero".to_owned(),
            ));
        }

        if self.lease_renewal && self.lease_duration < Duration::from_secs(2) {
            return Err(AppError::Validation(
                "lease renewal requires a lease duration of at least two seconds".to_owned(),
            ));
        }

        Ok(())
    }
}

/// How the pool resolved one delivered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Completed, persisted and acknowledged.
    Completed,
    /// Suspended at a bookmark, persisted and acknowledged.
    Suspended,
    /// Failed permanently, dead-lettered and acknowledged.
    DeadLettered,
    /// Left unacknowledged for redelivery after lease expiry.
    LeftForRedelivery,
    /// Lease lapsed before the task could be acknowledged.
    LeaseLost,
}

impl TaskDisposition {
    /// Returns stable disposition value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Suspended => "suspended",
            Self::DeadLettered => "dead_lettered",
            Self::LeftForRedelivery => "left_for_redelivery",
            Self::LeaseLost => "lease_lost",
        }
    }
}

/// Counters returned when the pool stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolReport {
    /// Tasks leased over the pool lifetime.
    pub received: u64,
    /// Tasks that finished before shutdown returned.
    pub finished: u64,
    /// Tasks still running when the drain deadline passed.
    pub abandoned: u64,
}

/// Bounded set of pollers and executors for one node.
#[derive(Clone)]
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    queue: Arc<dyn LeaseQueue>,
    executor: Arc<dyn TaskExecutor>,
    state_store: Arc<dyn ExecutionStateStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Creates a worker pool.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn LeaseQueue>,
        executor: Arc<dyn TaskExecutor>,
        state_store: Arc<dyn ExecutionStateStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrency));

        Ok(Self {
            config: Arc::new(config),
            queue,
            executor,
            state_store,
            dead_letters,
            clock,
            permits,
        })
    }

    /// Returns permits not held by running tasks.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Polls and executes until `shutdown` fires, then drains in-flight tasks
    /// up to the shutdown deadline.
    ///
    /// Tasks still running at the deadline receive cancellation and are left
    /// behind. Their leases expire and the queue redelivers them elsewhere.
    pub async fn run(&self, shutdown: CancellationToken) -> AppResult<WorkerPoolReport> {
        let worker_id = self.config.worker_id.as_str();
        let execution_token = CancellationToken::new();
        let mut in_flight = JoinSet::new();
        let mut report = WorkerPoolReport::default();

        info!(
            worker_id = %worker_id,
            max_concurrency = self.config.max_concurrency,
            batch_size = self.config.batch_size,
            "worker pool started"
        );

        loop {
            report.finished += collect_finished(&mut in_flight, worker_id);

            let first_permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => permit.map_err(|error| {
                    AppError::Internal(format!("worker permit semaphore closed: {error}"))
                })?,
            };

            let mut permits = vec![first_permit];
            while permits.len() < self.config.batch_size {
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.queue.receive(permits.len(), self.config.receive_wait) => received,
            };

            let leased = match received {
                Ok(leased) => leased,
                Err(error) => {
                    warn!(worker_id = %worker_id, error = %error, "receive failed");
                    drop(permits);
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.receive_wait.max(RECEIVE_RETRY_FLOOR)) => continue,
                    }
                }
            };

            if !leased.is_empty() {
                info!(
                    worker_id = %worker_id,
                    leased_count = leased.len(),
                    available_permits = self.permits.available_permits(),
                    "leased tasks"
                );
            }

            report.received += leased.len() as u64;
            for (task, permit) in leased.into_iter().zip(permits.drain(..)) {
                self.spawn_task(&mut in_flight, task, permit, execution_token.child_token());
            }
        }

        info!(
            worker_id = %worker_id,
            in_flight = in_flight.len(),
            "worker pool draining"
        );

        let drained = tokio::time::timeout(self.config.shutdown_deadline, async {
            let mut finished = 0_u64;
            while let Some(joined) = in_flight.join_next().await {
                log_join_result(joined, worker_id);
                finished += 1;
            }
            finished
        })
        .await;

        match drained {
            Ok(finished) => report.finished += finished,
            Err(_) => {
                execution_token.cancel();
                report.abandoned = in_flight.len() as u64;
                in_flight.detach_all();
                warn!(
                    worker_id = %worker_id,
                    abandoned = report.abandoned,
                    "shutdown deadline passed; abandoning in-flight tasks to lease expiry"
                );
            }
        }

        info!(
            worker_id = %worker_id,
            received = report.received,
            finished = report.finished,
            abandoned = report.abandoned,
            "worker pool stopped"
        );
        Ok(report)
    }

    fn spawn_task(
        &self,
        in_flight: &mut JoinSet<TaskDisposition>,
        leased: LeasedTask,
        permit: OwnedSemaphorePermit,
        cancellation: CancellationToken,
    ) {
        let pool = self.clone();
        in_flight.spawn(async move {
            let disposition = pool.process(leased, cancellation).await;
            drop(permit);
            disposition
        });
    }

    /// Executes one leased task and resolves its lease.
    pub async fn process(
        &self,
        leased: LeasedTask,
        cancellation: CancellationToken,
    ) -> TaskDisposition {
        let LeasedTask { task, lease } = leased;
        let worker_id = self.config.worker_id.as_str();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self
            .config
            .lease_renewal
            .then(|| self.start_heartbeat(lease.receipt_token.clone(), lease_lost.clone()));

        debug!(
            worker_id = %worker_id,
            task_id = %task.id,
            group_key = %task.group_key,
            attempt_count = task.attempt_count,
            "executing task"
        );

        let started_at = self.clock.now();
        let result = self.executor.execute(&task, cancellation).await;
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel();
        }

        if lease_lost.load(Ordering::SeqCst) {
            warn!(
                worker_id = %worker_id,
                task_id = %task.id,
                "lease lapsed during execution; leaving task to its new holder"
            );
            return TaskDisposition::LeaseLost;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(failure) if failure.is_permanent() => {
                return self
                    .escalate_permanent_failure(&task, &lease.receipt_token, &failure)
                    .await;
            }
            Err(failure) => {
                warn!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    attempt_count = task.attempt_count,
                    error = %failure,
                    "transient failure; task will be redelivered after lease expiry"
                );
                return TaskDisposition::LeftForRedelivery;
            }
        };

        if let Err(error) = self.persist_outcome(&task, &outcome).await {
            warn!(
                worker_id = %worker_id,
                task_id = %task.id,
                error = %error,
                "failed to persist task result; task will be redelivered"
            );
            return TaskDisposition::LeftForRedelivery;
        }

        if let Err(error) = self.queue.acknowledge(&lease.receipt_token).await {
            return self.acknowledge_failed(&task, &lease.receipt_token, error);
        }

        let disposition = match outcome {
            ExecutionOutcome::Completed { .. } => TaskDisposition::Completed,
            ExecutionOutcome::Suspended { .. } => TaskDisposition::Suspended,
        };

        debug!(
            worker_id = %worker_id,
            task_id = %task.id,
            disposition = disposition.as_str(),
            elapsed_ms = (self.clock.now() - started_at).num_milliseconds(),
            "task resolved"
        );
        disposition
    }

    /// Dead-letters a permanently failing task while its lease is held.
    ///
    /// The lease is confirmed before the push. When the acknowledgment still
    /// fails the push is withdrawn, so the sink never holds a task the queue
    /// is about to redeliver.
    async fn escalate_permanent_failure(
        &self,
        task: &TaskMessage,
        receipt_token: &ReceiptToken,
        failure: &ExecutionFailure,
    ) -> TaskDisposition {
        let worker_id = self.config.worker_id.as_str();

        match self
            .queue
            .extend_lease(receipt_token, self.config.lease_duration)
            .await
        {
            Ok(_) => {}
            Err(AppError::LeaseExpired(_)) => {
                warn!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    "lease lapsed before escalation; leaving task to its new holder"
                );
                return TaskDisposition::LeaseLost;
            }
            Err(error) => {
                warn!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    error = %error,
                    "failed to confirm lease before escalation; task will be redelivered"
                );
                return TaskDisposition::LeftForRedelivery;
            }
        }

        let entry = match self.record_permanent_failure(task, failure).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    error = %error,
                    "failed to dead-letter task; task will be redelivered"
                );
                return TaskDisposition::LeftForRedelivery;
            }
        };

        match self.queue.acknowledge(receipt_token).await {
            Ok(()) => {
                debug!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    disposition = TaskDisposition::DeadLettered.as_str(),
                    "task resolved"
                );
                TaskDisposition::DeadLettered
            }
            Err(error) => {
                self.withdraw_dead_letter(&entry).await;
                self.acknowledge_failed(task, receipt_token, error)
            }
        }
    }

    async fn withdraw_dead_letter(&self, entry: &DeadLetterEntry) {
        match self
            .dead_letters
            .remove(entry.task.id, entry.dead_lettered_at)
            .await
        {
            Ok(true) => debug!(
                worker_id = %self.config.worker_id,
                task_id = %entry.task.id,
                "dead-letter entry withdrawn; queue still owns the task"
            ),
            Ok(false) => warn!(
                worker_id = %self.config.worker_id,
                task_id = %entry.task.id,
                "dead-letter entry already drained; archive holds a task the queue will redeliver"
            ),
            Err(error) => error!(
                worker_id = %self.config.worker_id,
                task_id = %entry.task.id,
                error = %error,
                "failed to withdraw dead-letter entry"
            ),
        }
    }

    fn acknowledge_failed(
        &self,
        task: &TaskMessage,
        receipt_token: &ReceiptToken,
        error: AppError,
    ) -> TaskDisposition {
        let worker_id = self.config.worker_id.as_str();
        match error {
            AppError::LeaseExpired(_) => {
                warn!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    receipt_token = %receipt_token,
                    "lease expired before acknowledgment"
                );
                TaskDisposition::LeaseLost
            }
            other => {
                warn!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    error = %other,
                    "acknowledge failed"
                );
                TaskDisposition::LeftForRedelivery
            }
        }
    }

    async fn persist_outcome(
        &self,
        task: &TaskMessage,
        outcome: &ExecutionOutcome,
    ) -> AppResult<()> {
        if let ExecutionOutcome::Suspended { bookmark } = outcome {
            self.state_store.save_bookmark(bookmark.clone()).await?;
        }

        self.state_store
            .save_execution_result(ExecutionRecord::from_outcome(
                task,
                outcome,
                self.clock.now(),
            ))
            .await
    }

    async fn record_permanent_failure(
        &self,
        task: &TaskMessage,
        failure: &ExecutionFailure,
    ) -> AppResult<DeadLetterEntry> {
        let now = self.clock.now();
        warn!(
            worker_id = %self.config.worker_id,
            task_id = %task.id,
            attempt_count = task.attempt_count,
            error = %failure,
            "permanent failure; escalating to dead-letter sink"
        );

        if let Err(error) = self
            .state_store
            .save_execution_result(ExecutionRecord::faulted(task, failure, now))
            .await
        {
            warn!(
                task_id = %task.id,
                error = %error,
                "failed to record faulted execution"
            );
        }

        let entry = DeadLetterEntry::permanent(task.clone(), failure.message.clone(), now);
        self.dead_letters.push(entry.clone()).await?;
        Ok(entry)
    }

    fn start_heartbeat(
        &self,
        receipt_token: ReceiptToken,
        lease_lost: Arc<AtomicBool>,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let queue = self.queue.clone();
        let lease_duration = self.config.lease_duration;
        let period = lease_duration / 2;
        let worker_id = self.config.worker_id.clone();
        let stopped = stop.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stopped.cancelled() => return,
                    () = tokio::time::sleep(period) => {}
                }

                match queue.extend_lease(&receipt_token, lease_duration).await {
                    Ok(lease) => debug!(
                        worker_id = %worker_id,
                        task_id = %lease.task_id,
                        expires_at = %lease.expires_at,
                        "lease extended"
                    ),
                    Err(AppError::LeaseExpired(_)) => {
                        lease_lost.store(true, Ordering::SeqCst);
                        warn!(
                            worker_id = %worker_id,
                            receipt_token = %receipt_token,
                            "lease renewal rejected; lease already lapsed"
                        );
                        return;
                    }
                    Err(error) => warn!(
                        worker_id = %worker_id,
                        error = %error,
                        "lease renewal failed; retrying next period"
                    ),
                }
            }
        });

        stop
    }
}

fn collect_finished(in_flight: &mut JoinSet<TaskDisposition>, worker_id: &str) -> u64 {
    let mut finished = 0;
    while let Some(joined) = in_flight.try_join_next() {
        log_join_result(joined, worker_id);
        finished += 1;
    }
    finished
}

fn log_join_result(joined: Result<TaskDisposition, tokio::task::JoinError>, worker_id: &str) {
    if let Err(join_error) = joined {
        error!(worker_id = %worker_id, error = %join_error, "task execution panicked");
    }
}

#[cfg(test)]
mod tests;
