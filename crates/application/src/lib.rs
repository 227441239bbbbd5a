//! Application services and ports.

#![forbid(unsafe_code)]

mod dispatch_ports;
mod escalation_processor;
mod scheduler;
mod task_publisher;
mod worker_pool;

#[cfg(test)]
mod test_support;

pub use dispatch_ports::{
    DeadLetterArchive, DeadLetterSink, ExecutionStateStore, LeaseQueue, LeaseQueueConfig,
    LeaseQueueStats, LockManager, ReapReport, ScheduleRepository, TaskExecutor,
};
pub use escalation_processor::{EscalationConfig, EscalationProcessor};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerTickReport};
pub use task_publisher::{PublishTaskInput, TaskPublisher};
pub use worker_pool::{TaskDisposition, WorkerPool, WorkerPoolConfig, WorkerPoolReport};
