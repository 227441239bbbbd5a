use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use lodestar_core::{Clock, ManualClock};
use lodestar_domain::{
    DedupKey, HolderId, LockAcquisition, ResourceName, ScheduleDefinition,
    ScheduleDefinitionInput, TaskAttributes,
};

use crate::dispatch_ports::{LockManager, ScheduleRepository};
use crate::task_publisher::TaskPublisher;
use crate::test_support::{
    FakeLeaseQueue, FakeLockManager, FakeScheduleRepository, manual_clock,
};

use super::{FireOutcome, Scheduler, SchedulerConfig};

struct Cluster {
    clock: Arc<ManualClock>,
    queue: Arc<FakeLeaseQueue>,
    schedules: Arc<FakeScheduleRepository>,
    locks: Arc<FakeLockManager>,
}

impl Cluster {
    async fn new() -> Self {
        let clock = manual_clock();
        let schedules = Arc::new(FakeScheduleRepository::default());
        let definition = ScheduleDefinition::new(ScheduleDefinitionInput {
            schedule_id: "nightly".to_owned(),
            group_key: "reports".to_owned(),
            payload: json!({"report": "daily"}),
            attributes: TaskAttributes::default(),
            interval_seconds: 60,
            next_due_at: clock.now(),
            is_enabled: true,
        })
        .unwrap_or_else(|_| unreachable!());
        assert!(schedules.save_schedule(definition).await.is_ok());

        Self {
            locks: Arc::new(FakeLockManager::new(clock.clone())),
            queue: Arc::new(FakeLeaseQueue::default()),
            schedules,
            clock,
        }
    }

    fn scheduler(&self, holder_id: &str) -> Scheduler {
        Scheduler::new(
            SchedulerConfig {
                holder_id: holder_id.to_owned(),
                tick_interval: Duration::from_secs(1),
                lock_ttl: Duration::from_secs(3),
            },
            self.schedules.clone(),
            self.locks.clone(),
            TaskPublisher::new(self.queue.clone()),
            self.clock.clone(),
        )
        .unwrap_or_else(|_| unreachable!())
    }
}

#[test]
fn config_requires_ttl_of_at_least_one_tick() {
    let config = SchedulerConfig {
        holder_id: "scheduler-a".to_owned(),
        tick_interval: Duration::from_secs(2),
        lock_ttl: Duration::from_secs(1),
    };

    assert!(config.validate().is_err());
}

#[tokio::test]
async fn due_definition_is_published_and_advanced() {
    let cluster = Cluster::new().await;
    let fired_for = cluster.clock.now();
    let report = cluster.scheduler("scheduler-a").tick().await;

    assert!(report.is_ok());
    let report = report.unwrap_or_default();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.published, 1);

    let published = cluster.queue.published.lock().await;
    assert_eq!(published.len(), 1);
    let expected = DedupKey::for_schedule_tick("nightly", fired_for);
    assert_eq!(Some(published[0].dedup_key.clone()), expected.ok());

    let definitions = cluster.schedules.definitions.lock().await;
    assert_eq!(
        definitions["nightly"].next_due_at(),
        fired_for + chrono::Duration::seconds(60)
    );
}

#[tokio::test]
async fn not_due_definition_is_left_alone() {
    let cluster = Cluster::new().await;
    cluster.clock.advance(chrono::Duration::seconds(-1));

    let report = cluster
        .scheduler("scheduler-a")
        .tick()
        .await
        .unwrap_or_default();

    assert_eq!(report.evaluated, 0);
    assert!(cluster.queue.published.lock().await.is_empty());
}

#[tokio::test]
async fn two_instances_on_the_same_tick_publish_once() {
    let cluster = Cluster::new().await;
    let first = cluster.scheduler("scheduler-a");
    let second = cluster.scheduler("scheduler-b");

    let (first_report, second_report) = tokio::join!(first.tick(), second.tick());
    let first_report = first_report.unwrap_or_default();
    let second_report = second_report.unwrap_or_default();

    assert_eq!(first_report.published + second_report.published, 1);
    assert_eq!(first_report.failed + second_report.failed, 0);
    assert_eq!(cluster.queue.published.lock().await.len(), 1);
}

#[tokio::test]
async fn held_lock_skips_the_tick() {
    let cluster = Cluster::new().await;
    let resource = ResourceName::new("schedule:nightly").unwrap_or_else(|_| unreachable!());
    let other = HolderId::new("scheduler-z").unwrap_or_else(|_| unreachable!());
    let held = cluster
        .locks
        .acquire(&resource, &other, Duration::from_secs(30))
        .await;
    assert!(matches!(held, Ok(LockAcquisition::Acquired(_))));

    let report = cluster
        .scheduler("scheduler-a")
        .tick()
        .await
        .unwrap_or_default();

    assert_eq!(report.lock_denied, 1);
    assert_eq!(report.published, 0);
    assert!(cluster.queue.published.lock().await.is_empty());
}

#[tokio::test]
async fn stale_snapshot_collapses_onto_existing_task() {
    let cluster = Cluster::new().await;
    let stale = cluster
        .schedules
        .list_due(cluster.clock.now())
        .await
        .unwrap_or_default();
    assert_eq!(stale.len(), 1);

    let report = cluster
        .scheduler("scheduler-a")
        .tick()
        .await
        .unwrap_or_default();
    assert_eq!(report.published, 1);

    let outcome = cluster.scheduler("scheduler-b").fire(&stale[0]).await;
    assert!(matches!(outcome, Ok(FireOutcome::Duplicate)));
    assert_eq!(cluster.queue.published.lock().await.len(), 1);
    assert_eq!(cluster.schedules.advanced.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn released_lock_can_be_taken_by_next_instance() {
    let cluster = Cluster::new().await;
    let _ = cluster.scheduler("scheduler-a").tick().await;

    let resource = ResourceName::new("schedule:nightly").unwrap_or_else(|_| unreachable!());
    let holder = HolderId::new("scheduler-b").unwrap_or_else(|_| unreachable!());
    let acquired = cluster
        .locks
        .acquire(&resource, &holder, Duration::from_secs(3))
        .await;

    assert!(matches!(acquired, Ok(LockAcquisition::Acquired(_))));
}

#[tokio::test]
async fn lapsed_lock_leaves_schedule_unadvanced() {
    let cluster = Cluster::new().await;
    let fired_for = cluster.clock.now();
    *cluster.locks.reject_refreshes.lock().await = true;

    let report = cluster
        .scheduler("scheduler-a")
        .tick()
        .await
        .unwrap_or_default();

    assert_eq!(report.failed, 1);
    assert_eq!(report.published, 0);
    assert_eq!(cluster.schedules.advanced.load(Ordering::SeqCst), 0);
    let definitions = cluster.schedules.definitions.lock().await;
    assert_eq!(definitions["nightly"].next_due_at(), fired_for);
}

#[tokio::test]
async fn local_clock_skew_does_not_fail_an_owned_lock() {
    let cluster = Cluster::new().await;
    let lock_clock = manual_clock();
    cluster.clock.advance(chrono::Duration::seconds(10));

    let scheduler = Scheduler::new(
        SchedulerConfig {
            holder_id: "scheduler-a".to_owned(),
            tick_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(3),
        },
        cluster.schedules.clone(),
        Arc::new(FakeLockManager::new(lock_clock)),
        TaskPublisher::new(cluster.queue.clone()),
        cluster.clock.clone(),
    )
    .unwrap_or_else(|_| unreachable!());

    let report = scheduler.tick().await.unwrap_or_default();

    assert_eq!(report.published, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(cluster.schedules.advanced.load(Ordering::SeqCst), 1);
}
