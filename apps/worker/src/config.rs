use std::env;
use std::time::Duration;

use lodestar_application::{EscalationConfig, LeaseQueueConfig, SchedulerConfig, WorkerPoolConfig};
use lodestar_core::{AppError, AppResult};

/// Storage selected through `LODESTAR_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process-local adapters.
    Memory,
    /// PostgreSQL adapters.
    Postgres,
}

impl BackendKind {
    fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" => Ok(Self::Postgres),
            _ => Err(AppError::Validation(format!(
                "invalid LODESTAR_BACKEND value '{value}', expected 'memory' or 'postgres'"
            ))),
        }
    }

    /// Returns the configuration value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub backend: BackendKind,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub executor_endpoint: Option<String>,
    pub executor_timeout: Duration,
    pub queue: LeaseQueueConfig,
    pub pool: WorkerPoolConfig,
    pub scheduler_enabled: bool,
    pub scheduler: SchedulerConfig,
    pub escalation: EscalationConfig,
    pub stats_interval: Duration,
}

impl WorkerConfig {
    /// Loads configuration from the process environment.
    pub fn load() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let env = EnvReader { lookup: &lookup };

        let backend = env
            .optional("LODESTAR_BACKEND")
            .map(|value| BackendKind::parse(value.as_str()))
            .transpose()?
            .unwrap_or(BackendKind::Memory);
        let database_url = env.optional("DATABASE_URL");
        if backend == BackendKind::Postgres && database_url.is_none() {
            return Err(AppError::Validation(
                "DATABASE_URL is required when LODESTAR_BACKEND=postgres".to_owned(),
            ));
        }

        let worker_id = env
            .optional("WORKER_ID")
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));

        let queue = LeaseQueueConfig {
            lease_duration: Duration::from_secs(env.parse("QUEUE_LEASE_SECONDS", 30_u64)?),
            max_receives: env.parse("QUEUE_MAX_RECEIVES", 5_u32)?,
            dedup_window: Duration::from_secs(env.parse("QUEUE_DEDUP_WINDOW_SECONDS", 300_u64)?),
        };
        queue.validate()?;

        let pool = WorkerPoolConfig {
            worker_id: worker_id.clone(),
            max_concurrency: env.parse("WORKER_MAX_CONCURRENCY", 8_usize)?,
            batch_size: env.parse("WORKER_BATCH_SIZE", 10_usize)?,
            receive_wait: Duration::from_millis(env.parse("WORKER_RECEIVE_WAIT_MS", 2_000_u64)?),
            lease_renewal: env.parse("WORKER_LEASE_RENEWAL", false)?,
            lease_duration: queue.lease_duration,
            shutdown_deadline: Duration::from_millis(
                env.parse("WORKER_SHUTDOWN_DEADLINE_MS", 30_000_u64)?,
            ),
        };
        pool.validate()?;

        let tick_ms = env.parse("SCHEDULER_TICK_MS", 1_000_u64)?;
        let scheduler = SchedulerConfig {
            holder_id: worker_id,
            tick_interval: Duration::from_millis(tick_ms),
            lock_ttl: Duration::from_millis(
                env.parse("SCHEDULER_LOCK_TTL_MS", tick_ms.saturating_mul(3))?,
            ),
        };
        scheduler.validate()?;

        let escalation = EscalationConfig {
            drain_interval: Duration::from_millis(
                env.parse("ESCALATION_DRAIN_INTERVAL_MS", 5_000_u64)?,
            ),
            drain_batch: env.parse("ESCALATION_DRAIN_BATCH", 100_usize)?,
        };
        escalation.validate()?;

        let executor_timeout = Duration::from_millis(env.parse("EXECUTOR_TIMEOUT_MS", 15_000_u64)?);
        if executor_timeout.is_zero() {
            return Err(AppError::Validation(
                "EXECUTOR_TIMEOUT_MS must be greater than zero".to_owned(),
            ));
        }

        let stats_interval = Duration::from_millis(env.parse("QUEUE_STATS_INTERVAL_MS", 30_000_u64)?);
        if stats_interval.is_zero() {
            return Err(AppError::Validation(
                "QUEUE_STATS_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            backend,
            database_url,
            redis_url: env.optional("REDIS_URL"),
            redis_key_prefix: env
                .optional("REDIS_KEY_PREFIX")
                .unwrap_or_else(|| "lodestar".to_owned()),
            executor_endpoint: env.optional("EXECUTOR_ENDPOINT"),
            executor_timeout,
            queue,
            pool,
            scheduler_enabled: env.parse("SCHEDULER_ENABLED", true)?,
            scheduler,
            escalation,
            stats_interval,
        })
    }

    /// Returns the database URL or fails with the operation that needs it.
    pub fn require_database_url(&self, operation: &str) -> AppResult<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            AppError::Validation(format!("DATABASE_URL is required for {operation}"))
        })
    }

    /// Returns the executor endpoint required by the run command.
    pub fn require_executor_endpoint(&self) -> AppResult<&str> {
        self.executor_endpoint
            .as_deref()
            .ok_or_else(|| AppError::Validation("EXECUTOR_ENDPOINT is required".to_owned()))
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(value) => value.parse::<T>().map_err(|error| {
                AppError::Validation(format!("invalid {name} value '{value}': {error}"))
            }),
            None => Ok(default),
        }
    }
}
