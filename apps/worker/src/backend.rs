use std::sync::Arc;

use lodestar_application::{
    DeadLetterArchive, DeadLetterSink, ExecutionStateStore, LeaseQueue, LockManager,
    ScheduleRepository,
};
use lodestar_core::{AppError, AppResult, Clock};
use lodestar_infrastructure::{
    InMemoryDeadLetterStore, InMemoryExecutionStateStore, InMemoryLeaseQueue, InMemoryLockManager,
    InMemoryScheduleRepository, PostgresDeadLetterStore, PostgresExecutionStateStore,
    PostgresLeaseQueue, PostgresLockManager, PostgresScheduleRepository, RedisLockManager,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::{BackendKind, WorkerConfig};

/// Port implementations selected for one process.
pub struct Backend {
    pub queue: Arc<dyn LeaseQueue>,
    pub dead_letter_sink: Arc<dyn DeadLetterSink>,
    pub dead_letter_archive: Arc<dyn DeadLetterArchive>,
    pub locks: Arc<dyn LockManager>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub state_store: Arc<dyn ExecutionStateStore>,
}

impl Backend {
    pub async fn build(config: &WorkerConfig, clock: Arc<dyn Clock>) -> AppResult<Self> {
        let backend = match config.backend {
            BackendKind::Memory => Self::in_memory(config, clock.clone())?,
            BackendKind::Postgres => {
                let pool = connect_pool(config.require_database_url("the postgres backend")?)
                    .await?;
                Self::postgres(config, pool)?
            }
        };

        let backend = match config.redis_url.as_deref() {
            Some(redis_url) => Self {
                locks: Arc::new(RedisLockManager::new(
                    build_redis_client(redis_url)?,
                    config.redis_key_prefix.as_str(),
                    clock,
                )),
                ..backend
            },
            None => backend,
        };

        info!(
            backend = config.backend.as_str(),
            redis_locks = config.redis_url.is_some(),
            "dispatch backend ready"
        );
        Ok(backend)
    }

    fn in_memory(config: &WorkerConfig, clock: Arc<dyn Clock>) -> AppResult<Self> {
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let queue = InMemoryLeaseQueue::new(config.queue, clock.clone(), dead_letters.clone())?;

        Ok(Self {
            queue: Arc::new(queue),
            dead_letter_sink: dead_letters.clone(),
            dead_letter_archive: dead_letters,
            locks: Arc::new(InMemoryLockManager::new(clock)),
            schedules: Arc::new(InMemoryScheduleRepository::new()),
            state_store: Arc::new(InMemoryExecutionStateStore::new()),
        })
    }

    fn postgres(config: &WorkerConfig, pool: PgPool) -> AppResult<Self> {
        let dead_letters = Arc::new(PostgresDeadLetterStore::new(pool.clone()));

        Ok(Self {
            queue: Arc::new(PostgresLeaseQueue::new(pool.clone(), config.queue)?),
            dead_letter_sink: dead_letters.clone(),
            dead_letter_archive: dead_letters,
            locks: Arc::new(PostgresLockManager::new(pool.clone())),
            schedules: Arc::new(PostgresScheduleRepository::new(pool.clone())),
            state_store: Arc::new(PostgresExecutionStateStore::new(pool)),
        })
    }
}

pub async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

pub async fn run_migrations(pool: &PgPool) -> AppResult<()> {
    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run database migrations: {error}")))
}

fn build_redis_client(redis_url: &str) -> AppResult<redis::Client> {
    redis::Client::open(redis_url)
        .map_err(|error| AppError::Validation(format!("invalid REDIS_URL: {error}")))
}
