//! Lodestar dispatch worker runtime.
//!
//! `lodestar-worker` runs the worker pool, scheduler and escalation processor
//! until Ctrl-C. `lodestar-worker migrate` applies database migrations and
//! `lodestar-worker requeue <task-id>` replays one archived dead letter.

#![forbid(unsafe_code)]

mod backend;
mod config;

use std::sync::Arc;

use lodestar_application::{EscalationProcessor, LeaseQueue, Scheduler, TaskPublisher, WorkerPool};
use lodestar_core::{AppError, AppResult, Clock, SystemClock};
use lodestar_domain::TaskId;
use lodestar_infrastructure::HttpTaskExecutor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::{Backend, connect_pool, run_migrations};
use crate::config::{BackendKind, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Run,
    Migrate,
    Requeue(TaskId),
}

impl Command {
    fn parse(mut args: impl Iterator<Item = String>) -> AppResult<Self> {
        match args.next().as_deref() {
            None | Some("run") => Ok(Self::Run),
            Some("migrate") => Ok(Self::Migrate),
            Some("requeue") => {
                let task_id = args.next().ok_or_else(|| {
                    AppError::Validation("usage: lodestar-worker requeue <task-id>".to_owned())
                })?;
                TaskId::parse(task_id.as_str()).map(Self::Requeue)
            }
            Some(other) => Err(AppError::Validation(format!(
                "unknown command '{other}', expected run, migrate or requeue"
            ))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let command = Command::parse(std::env::args().skip(1))?;
    let config = WorkerConfig::load()?;

    match command {
        Command::Run => run(config).await,
        Command::Migrate => {
            let pool = connect_pool(config.require_database_url("migrate")?).await?;
            run_migrations(&pool).await?;
            info!("database migrations applied");
            Ok(())
        }
        Command::Requeue(task_id) => requeue(config, task_id).await,
    }
}

async fn run(config: WorkerConfig) -> AppResult<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = Backend::build(&config, clock.clone()).await?;

    let http_client = reqwest::Client::builder()
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;
    let executor = Arc::new(HttpTaskExecutor::new(
        http_client,
        config.require_executor_endpoint()?,
        config.executor_timeout,
    )?);

    let publisher = TaskPublisher::new(backend.queue.clone())
        .with_state_store(backend.state_store.clone());
    let pool = WorkerPool::new(
        config.pool.clone(),
        backend.queue.clone(),
        executor,
        backend.state_store.clone(),
        backend.dead_letter_sink.clone(),
        clock.clone(),
    )?;
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        backend.schedules.clone(),
        backend.locks.clone(),
        publisher.clone(),
        clock,
    )?;
    let escalation = EscalationProcessor::new(
        config.escalation,
        backend.dead_letter_sink.clone(),
        backend.dead_letter_archive.clone(),
        publisher,
    )?;

    info!(
        worker_id = %config.pool.worker_id,
        backend = config.backend.as_str(),
        max_concurrency = config.pool.max_concurrency,
        batch_size = config.pool.batch_size,
        lease_seconds = config.queue.lease_duration.as_secs(),
        max_receives = config.queue.max_receives,
        scheduler_enabled = config.scheduler_enabled,
        "lodestar-worker started"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(error) => warn!(error = %error, "failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    let scheduler_token = shutdown.clone();
    let scheduler_enabled = config.scheduler_enabled;
    let (pool_report, (), (), ()) = tokio::join!(
        pool.run(shutdown.clone()),
        async move {
            if scheduler_enabled {
                scheduler.run(scheduler_token).await;
            }
        },
        escalation.run(shutdown.clone()),
        report_queue_stats(backend.queue.clone(), config.stats_interval, shutdown.clone()),
    );

    let report = pool_report?;
    info!(
        received = report.received,
        finished = report.finished,
        abandoned = report.abandoned,
        "lodestar-worker stopped"
    );
    Ok(())
}

async fn requeue(config: WorkerConfig, task_id: TaskId) -> AppResult<()> {
    if config.backend != BackendKind::Postgres {
        return Err(AppError::Validation(
            "requeue needs LODESTAR_BACKEND=postgres to reach the dead-letter archive".to_owned(),
        ));
    }

    let backend = Backend::build(&config, Arc::new(SystemClock)).await?;
    let publisher = TaskPublisher::new(backend.queue.clone());
    let escalation = EscalationProcessor::new(
        config.escalation,
        backend.dead_letter_sink.clone(),
        backend.dead_letter_archive.clone(),
        publisher,
    )?;

    // Entries may still sit in the sink when no worker has drained it yet.
    escalation.drain_once().await?;
    let receipt = escalation.requeue(task_id).await?;
    info!(
        task_id = %task_id,
        requeued_as = %receipt.task_id,
        disposition = receipt.disposition.as_str(),
        "dead-letter entry requeued"
    );
    Ok(())
}

async fn report_queue_stats(
    queue: Arc<dyn LeaseQueue>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match queue.stats().await {
            Ok(stats) => info!(
                visible = stats.visible,
                in_flight = stats.in_flight,
                expired_leases = stats.expired_leases,
                dead_lettered = stats.dead_lettered,
                dedup_entries = stats.dedup_entries,
                "queue stats"
            ),
            Err(error) => error!(error = %error, "failed to read queue stats"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
