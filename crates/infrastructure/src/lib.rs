//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod http_task_executor;
mod in_memory_dead_letter_store;
mod in_memory_execution_state_store;
mod in_memory_lease_queue;
mod in_memory_lock_manager;
mod in_memory_schedule_repository;
mod postgres_dead_letter_store;
mod postgres_execution_state_store;
mod postgres_lease_queue;
mod postgres_lock_manager;
mod postgres_schedule_repository;
mod postgres_support;
mod redis_lock_manager;

pub use http_task_executor::HttpTaskExecutor;
pub use in_memory_dead_letter_store::InMemoryDeadLetterStore;
pub use in_memory_execution_state_store::InMemoryExecutionStateStore;
pub use in_memory_lease_queue::InMemoryLeaseQueue;
pub use in_memory_lock_manager::InMemoryLockManager;
pub use in_memory_schedule_repository::InMemoryScheduleRepository;
pub use postgres_dead_letter_store::PostgresDeadLetterStore;
pub use postgres_execution_state_store::PostgresExecutionStateStore;
pub use postgres_lease_queue::PostgresLeaseQueue;
pub use postgres_lock_manager::PostgresLockManager;
pub use postgres_schedule_repository::PostgresScheduleRepository;
pub use redis_lock_manager::RedisLockManager;
