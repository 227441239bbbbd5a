use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use lodestar_core::AppError;
use lodestar_domain::{
    Bookmark, BookmarkHash, BookmarkInput, DeadLetterEntry, PublishDisposition,
    ScheduleDefinition, ScheduleDefinitionInput, TaskAttributes,
};

use crate::dispatch_ports::ExecutionStateStore;
use crate::test_support::{FakeLeaseQueue, FakeStateStore};

use super::{PublishTaskInput, TaskPublisher};

fn input(dedup_key: &str) -> PublishTaskInput {
    PublishTaskInput {
        group_key: "wf-A".to_owned(),
        dedup_key: dedup_key.to_owned(),
        payload: json!({"step": "start"}),
        attributes: TaskAttributes::default(),
    }
}

#[tokio::test]
async fn publish_twice_with_same_dedup_key_returns_same_task() {
    let queue = Arc::new(FakeLeaseQueue::default());
    let publisher = TaskPublisher::new(queue.clone());

    let first = publisher.publish(input("d1")).await;
    let second = publisher.publish(input("d1")).await;
    assert!(first.is_ok());
    assert!(second.is_ok());

    let first = first.unwrap_or_else(|_| unreachable!());
    let second = second.unwrap_or_else(|_| unreachable!());
    assert_eq!(first.disposition, PublishDisposition::Enqueued);
    assert!(second.is_duplicate());
    assert_eq!(first.task_id, second.task_id);
    assert_eq!(queue.published.lock().await.len(), 1);
}

#[tokio::test]
async fn publish_rejects_blank_keys() {
    let publisher = TaskPublisher::new(Arc::new(FakeLeaseQueue::default()));

    let result = publisher.publish(input("  ")).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn scheduled_publish_derives_key_from_due_instant() {
    let queue = Arc::new(FakeLeaseQueue::default());
    let publisher = TaskPublisher::new(queue.clone());
    let fired_for = Utc::now();
    let definition = ScheduleDefinition::new(ScheduleDefinitionInput {
        schedule_id: "nightly".to_owned(),
        group_key: "reports".to_owned(),
        payload: json!({"report": "daily"}),
        attributes: TaskAttributes::default(),
        interval_seconds: 60,
        next_due_at: fired_for,
        is_enabled: true,
    })
    .unwrap_or_else(|_| unreachable!());

    let first = publisher.publish_scheduled(&definition, fired_for).await;
    let second = publisher.publish_scheduled(&definition, fired_for).await;
    assert!(first.is_ok());
    assert!(second.map(|receipt| receipt.is_duplicate()).unwrap_or(false));

    let published = queue.published.lock().await;
    assert_eq!(published.len(), 1);
    assert_eq!(
        published[0].dedup_key.as_str(),
        format!("schedule:nightly:{}", fired_for.timestamp_millis())
    );
    assert_eq!(published[0].payload["report"], "daily");
    assert!(published[0].payload.get("scheduledFor").is_some());
}

#[tokio::test]
async fn resume_bookmark_publishes_into_instance_group_and_consumes() {
    let queue = Arc::new(FakeLeaseQueue::default());
    let state_store = Arc::new(FakeStateStore::default());
    let hash = BookmarkHash::compute("approval", &json!({"requestId": "r-9"}));
    let bookmark = Bookmark::new(
        BookmarkInput {
            workflow_instance_id: "instance-42".to_owned(),
            activity_node_id: "approve".to_owned(),
            hash: hash.clone(),
            payload: json!({"approver": "ops"}),
        },
        Utc::now(),
    )
    .unwrap_or_else(|_| unreachable!());
    let bookmark_id = bookmark.bookmark_id();
    assert!(state_store.save_bookmark(bookmark).await.is_ok());

    let publisher = TaskPublisher::new(queue.clone()).with_state_store(state_store.clone());
    let receipt = publisher
        .resume_bookmark(&hash, json!({"approved": true}))
        .await;
    assert!(receipt.is_ok());

    let published = queue.published.lock().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].group_key.as_str(), "instance-42");
    assert_eq!(
        published[0].dedup_key.as_str(),
        format!("resume:{bookmark_id}")
    );
    assert_eq!(published[0].payload["resume"]["input"]["approved"], true);
    assert!(state_store.consumed.lock().await.contains(&bookmark_id));

    drop(published);
    let again = publisher.resume_bookmark(&hash, json!({})).await;
    assert!(matches!(again, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn resume_without_state_store_is_a_conflict() {
    let publisher = TaskPublisher::new(Arc::new(FakeLeaseQueue::default()));
    let result = publisher
        .resume_bookmark(&BookmarkHash::compute("timer", &json!({})), json!({}))
        .await;

    assert!(matches!(result, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn republish_uses_fresh_dedup_key_and_original_payload() {
    let queue = Arc::new(FakeLeaseQueue::default());
    let publisher = TaskPublisher::new(queue.clone());
    let original = publisher.publish(input("d-original")).await;
    assert!(original.is_ok());

    let message = queue.published.lock().await.remove(0);
    let entry = DeadLetterEntry::exhausted(message.clone(), Utc::now());

    let receipt = publisher.republish(&entry).await;
    assert!(receipt.is_ok());
    let receipt = receipt.unwrap_or_else(|_| unreachable!());
    assert!(!receipt.is_duplicate());
    assert_ne!(receipt.task_id, message.id);

    let published = queue.published.lock().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, message.payload);
    assert_eq!(published[0].group_key, message.group_key);
    assert_ne!(published[0].dedup_key, message.dedup_key);
}
