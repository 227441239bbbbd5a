use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use lodestar_domain::{
    DeadLetterReason, DedupKey, ExecutionStatus, GroupKey, Lease, LeasedTask, NewTask,
    ReceiptToken, TaskAttributes,
};

use crate::dispatch_ports::DeadLetterSink;
use crate::test_support::{
    FakeDeadLetters, FakeLeaseQueue, FakeStateStore, ScriptedExecutor, manual_clock,
};

use super::{TaskDisposition, WorkerPool, WorkerPoolConfig};

struct Harness {
    queue: Arc<FakeLeaseQueue>,
    executor: Arc<ScriptedExecutor>,
    state_store: Arc<FakeStateStore>,
    dead_letters: Arc<FakeDeadLetters>,
    pool: WorkerPool,
}

fn config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        worker_id: "worker-test".to_owned(),
        max_concurrency: 4,
        batch_size: 10,
        receive_wait: Duration::from_millis(50),
        lease_renewal: false,
        lease_duration: Duration::from_secs(30),
        shutdown_deadline: Duration::from_secs(5),
    }
}

fn harness(config: WorkerPoolConfig, executor: ScriptedExecutor) -> Harness {
    let queue = Arc::new(FakeLeaseQueue::default());
    let executor = Arc::new(executor);
    let state_store = Arc::new(FakeStateStore::default());
    let dead_letters = Arc::new(FakeDeadLetters::default());
    let pool = WorkerPool::new(
        config,
        queue.clone(),
        executor.clone(),
        state_store.clone(),
        dead_letters.clone(),
        manual_clock(),
    )
    .unwrap_or_else(|_| unreachable!());

    Harness {
        queue,
        executor,
        state_store,
        dead_letters,
        pool,
    }
}

fn task(mode: &str) -> NewTask {
    task_with_payload(json!({"mode": mode}))
}

fn task_with_payload(payload: Value) -> NewTask {
    NewTask::new(
        GroupKey::new("wf-A").unwrap_or_else(|_| unreachable!()),
        DedupKey::new(uuid::Uuid::new_v4().to_string()).unwrap_or_else(|_| unreachable!()),
        payload,
        TaskAttributes::default(),
    )
}

async fn leased(harness: &Harness, mode: &str) -> LeasedTask {
    harness
        .queue
        .lease(task(mode).into_message(Utc::now()))
        .await
}

#[test]
fn config_rejects_zero_concurrency() {
    let invalid = WorkerPoolConfig {
        max_concurrency: 0,
        ..config()
    };

    assert!(invalid.validate().is_err());
    assert!(config().validate().is_ok());

    let no_lease = WorkerPoolConfig {
        lease_duration: Duration::ZERO,
        ..config()
    };
    assert!(no_lease.validate().is_err());
}

#[tokio::test]
async fn completed_task_is_persisted_then_acknowledged() {
    let harness = harness(config(), ScriptedExecutor::default());
    let delivery = leased(&harness, "complete").await;
    let task_id = delivery.task.id;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::Completed);
    assert_eq!(harness.queue.acknowledged_ids().await, vec![task_id]);
    let records = harness.state_store.records.lock().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn suspended_task_saves_bookmark_before_acknowledging() {
    let harness = harness(config(), ScriptedExecutor::default());
    let delivery = leased(&harness, "suspend").await;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::Suspended);
    assert_eq!(harness.state_store.bookmarks.lock().await.len(), 1);
    assert_eq!(harness.queue.acknowledged_ids().await.len(), 1);
    assert_eq!(
        harness.state_store.records.lock().await[0].status,
        ExecutionStatus::Suspended
    );
}

#[tokio::test]
async fn transient_failure_leaves_lease_to_expire() {
    let harness = harness(config(), ScriptedExecutor::default());
    let delivery = leased(&harness, "transient").await;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::LeftForRedelivery);
    assert!(harness.queue.acknowledged_ids().await.is_empty());
    assert_eq!(harness.dead_letters.count().await.unwrap_or_default(), 0);
}

#[tokio::test]
async fn permanent_failure_is_dead_lettered_and_acknowledged() {
    let harness = harness(config(), ScriptedExecutor::default());
    let delivery = leased(&harness, "permanent").await;
    let task_id = delivery.task.id;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::DeadLettered);
    assert_eq!(harness.queue.acknowledged_ids().await, vec![task_id]);
    let sink = harness.dead_letters.sink.lock().await;
    assert_eq!(sink.len(), 1);
    assert_eq!(sink[0].reason, DeadLetterReason::Permanent);
    assert_eq!(
        harness.state_store.records.lock().await[0].status,
        ExecutionStatus::Faulted
    );
}

#[tokio::test]
async fn permanent_failure_after_lease_lapse_is_not_dead_lettered() {
    let harness = harness(config(), ScriptedExecutor::default());
    let delivery = leased(&harness, "permanent").await;
    harness.queue.lapse_leases().await;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::LeaseLost);
    assert_eq!(harness.dead_letters.count().await.unwrap_or_default(), 0);
    assert!(harness.queue.acknowledged_ids().await.is_empty());
}

#[tokio::test]
async fn dead_letter_is_withdrawn_when_acknowledgment_finds_lease_lapsed() {
    let harness = harness(config(), ScriptedExecutor::default());
    *harness.queue.reject_acknowledgments.lock().await = true;
    let delivery = leased(&harness, "permanent").await;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::LeaseLost);
    assert_eq!(harness.dead_letters.count().await.unwrap_or_default(), 0);
    assert_eq!(harness.queue.extended.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistence_failure_skips_acknowledgment() {
    let harness = harness(config(), ScriptedExecutor::default());
    *harness.state_store.fail_saves.lock().await = true;
    let delivery = leased(&harness, "complete").await;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::LeftForRedelivery);
    assert!(harness.queue.acknowledged_ids().await.is_empty());
}

#[tokio::test]
async fn acknowledging_a_lapsed_lease_reports_lease_lost() {
    let harness = harness(config(), ScriptedExecutor::default());
    let message = task("complete").into_message(Utc::now());
    let delivery = LeasedTask {
        lease: Lease {
            task_id: message.id,
            receipt_token: ReceiptToken::generate(),
            expires_at: Utc::now(),
        },
        task: message,
    };

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::LeaseLost);
}

#[tokio::test(start_paused = true)]
async fn renewal_extends_lease_while_task_runs() {
    let harness = harness(
        WorkerPoolConfig {
            lease_renewal: true,
            lease_duration: Duration::from_secs(4),
            ..config()
        },
        ScriptedExecutor::with_delay(Duration::from_secs(9)),
    );
    let delivery = leased(&harness, "complete").await;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::Completed);
    assert!(harness.queue.extended.load(Ordering::SeqCst) >= 3);
}

#[tokio::test(start_paused = true)]
async fn rejected_renewal_abandons_task_without_acknowledging() {
    let harness = harness(
        WorkerPoolConfig {
            lease_renewal: true,
            lease_duration: Duration::from_secs(4),
            ..config()
        },
        ScriptedExecutor::with_delay(Duration::from_secs(5)),
    );
    *harness.queue.reject_extensions.lock().await = true;
    let delivery = leased(&harness, "complete").await;

    let disposition = harness
        .pool
        .process(delivery, CancellationToken::new())
        .await;

    assert_eq!(disposition, TaskDisposition::LeaseLost);
    assert!(harness.queue.acknowledged_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_respects_concurrency_limit_and_drains_on_shutdown() {
    let harness = harness(
        WorkerPoolConfig {
            max_concurrency: 2,
            ..config()
        },
        ScriptedExecutor::with_delay(Duration::from_millis(200)),
    );
    for _ in 0..5 {
        harness.queue.push(task("complete")).await;
    }

    let shutdown = CancellationToken::new();
    let pool = harness.pool.clone();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    let report = running.await;
    assert!(report.is_ok());
    let report = report
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(report.received, 5);
    assert_eq!(report.finished, 5);
    assert_eq!(report.abandoned, 0);
    assert_eq!(harness.queue.acknowledged_ids().await.len(), 5);
    assert!(harness.executor.peak_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(harness.pool.available_permits(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_deadline_abandons_and_cancels_stragglers() {
    let harness = harness(
        WorkerPoolConfig {
            shutdown_deadline: Duration::from_secs(1),
            ..config()
        },
        ScriptedExecutor::with_delay(Duration::from_secs(600)),
    );
    harness.queue.push(task("complete")).await;

    let shutdown = CancellationToken::new();
    let pool = harness.pool.clone();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let report = running
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(report.received, 1);
    assert_eq!(report.abandoned, 1);
    assert!(harness.queue.acknowledged_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_execution_drains_before_the_deadline() {
    let harness = harness(
        WorkerPoolConfig {
            max_concurrency: 2,
            shutdown_deadline: Duration::from_secs(5),
            ..config()
        },
        ScriptedExecutor::with_delay(Duration::from_secs(1)),
    );
    for _ in 0..4 {
        harness.queue.push(task("complete")).await;
    }

    let shutdown = CancellationToken::new();
    let pool = harness.pool.clone();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.executor.running.load(Ordering::SeqCst), 2);
    shutdown.cancel();
    let report = running
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(report.received, 2);
    assert_eq!(report.finished, report.received);
    assert_eq!(report.abandoned, 0);
    assert_eq!(harness.queue.acknowledged_ids().await.len(), 2);
    assert_eq!(harness.queue.published.lock().await.len(), 2);
    assert_eq!(harness.pool.available_permits(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_receives_back_off_even_without_a_wait() {
    let harness = harness(
        WorkerPoolConfig {
            receive_wait: Duration::ZERO,
            ..config()
        },
        ScriptedExecutor::default(),
    );
    *harness.queue.fail_receives.lock().await = true;

    let shutdown = CancellationToken::new();
    let pool = harness.pool.clone();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(1_050)).await;
    shutdown.cancel();
    let report = running.await.unwrap_or_else(|_| unreachable!());

    assert!(report.is_ok_and(|report| report.received == 0));
    let calls = harness.queue.receive_calls.load(Ordering::SeqCst);
    assert!((1..=11).contains(&calls), "receive called {calls} times");
}
