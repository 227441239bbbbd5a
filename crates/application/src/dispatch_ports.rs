mod dead_letter;
mod executor;
mod lock;
mod queue;
mod schedule;
mod state_store;

pub use dead_letter::{DeadLetterArchive, DeadLetterSink};
pub use executor::TaskExecutor;
pub use lock::LockManager;
pub use queue::{LeaseQueue, LeaseQueueConfig, LeaseQueueStats, ReapReport};
pub use schedule::ScheduleRepository;
pub use state_store::ExecutionStateStore;
