use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::models::{Payload, TaskRecord, TaskStatus, TaskType};
use courier_core::traits::{StatusUpdate, TaskRecordStore};
use courier_core::{CourierError, CourierResult, TaskRecordService};
use courier_infrastructure::{InMemoryTaskStore, SqliteTaskStore};
use serde_json::json;
use uuid::Uuid;

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

async fn stores() -> Vec<(&'static str, Arc<dyn TaskRecordStore>)> {
    vec![
        ("memory", Arc::new(InMemoryTaskStore::new())),
        ("sqlite", Arc::new(SqliteTaskStore::in_memory().await.unwrap())),
    ]
}

#[tokio::test]
async fn test_full_lifecycle() {
    for (name, store) in stores().await {
        let service = TaskRecordService::new(store);
        let mut record = service
            .create(TaskType::IndexChannelTask, payload(json!({"chat_id": 1})), 3, false)
            .await
            .unwrap();

        let mut seen = vec![record.status];
        for next in [TaskStatus::InQueue, TaskStatus::InWorker, TaskStatus::Done] {
            assert!(service.transition(&mut record, next).await.unwrap(), "{name}: {next}");
            seen.push(record.status);
        }
        assert_eq!(
            seen,
            vec![TaskStatus::Created, TaskStatus::InQueue, TaskStatus::InWorker, TaskStatus::Done]
        );
        assert_eq!(record.version, 3);
        assert!(record.modified_at >= record.created_at);

        let stored = service.get(record.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Done, "{name}");
    }
}

#[tokio::test]
async fn test_terminal_records_never_move_again() {
    for (name, store) in stores().await {
        let service = TaskRecordService::new(store);
        let mut record = service
            .create(TaskType::DummyTask, Payload::new(), 1, false)
            .await
            .unwrap();
        service.transition(&mut record, TaskStatus::Canceled).await.unwrap();

        for next in [TaskStatus::InQueue, TaskStatus::InWorker, TaskStatus::Done, TaskStatus::Failed] {
            assert!(!service.transition(&mut record, next).await.unwrap(), "{name}: {next}");
        }
        assert_eq!(service.get(record.id).await.unwrap().status, TaskStatus::Canceled);
    }
}

#[tokio::test]
async fn test_stale_copy_is_refreshed_before_deciding() {
    for (name, store) in stores().await {
        let service = TaskRecordService::new(store);
        let mut publisher_copy = service
            .create(TaskType::DummyTask, Payload::new(), 1, false)
            .await
            .unwrap();
        let mut consumer_copy = publisher_copy.clone();

        // Consumer picks the message up before the publisher records IN_QUEUE.
        assert!(service.transition(&mut consumer_copy, TaskStatus::InWorker).await.unwrap());
        assert!(!service.transition(&mut publisher_copy, TaskStatus::InQueue).await.unwrap(), "{name}");
        assert_eq!(publisher_copy.status, TaskStatus::InWorker, "{name}");
        assert!(publisher_copy.status.has_passed(TaskStatus::InQueue), "{name}");
    }
}

#[tokio::test]
async fn test_mark_failed_records_error_class() {
    let service = TaskRecordService::new(Arc::new(InMemoryTaskStore::new()));
    let mut record = service
        .create(TaskType::CheckUsernameTask, Payload::new(), 1, false)
        .await
        .unwrap();
    service.transition(&mut record, TaskStatus::InWorker).await.unwrap();
    assert!(service.mark_failed(&mut record, "task_execution: boom").await.unwrap());

    let stored = service.get(record.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("task_execution: boom"));
}

#[tokio::test]
async fn test_dedupe_cancels_older_equivalent_record() {
    for (name, store) in stores().await {
        let service = TaskRecordService::new(store);
        let body = payload(json!({"username": "courier"}));

        let first = service
            .create(TaskType::CheckUsernameTask, body.clone(), 1, true)
            .await
            .unwrap();
        let unrelated = service
            .create(TaskType::CheckUsernameTask, payload(json!({"username": "other"})), 1, true)
            .await
            .unwrap();
        let second = service
            .create(TaskType::CheckUsernameTask, body.clone(), 1, true)
            .await
            .unwrap();

        assert_eq!(service.get(first.id).await.unwrap().status, TaskStatus::Canceled, "{name}");
        assert_eq!(service.get(second.id).await.unwrap().status, TaskStatus::Created, "{name}");
        assert_eq!(service.get(unrelated.id).await.unwrap().status, TaskStatus::Created, "{name}");

        let active = service
            .find_active(TaskType::CheckUsernameTask, &body)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);
    }
}

#[tokio::test]
async fn test_without_dedupe_duplicates_coexist() {
    let service = TaskRecordService::new(Arc::new(InMemoryTaskStore::new()));
    let body = payload(json!({"chat_id": 5}));
    let a = service.create(TaskType::IndexChannelTask, body.clone(), 3, false).await.unwrap();
    let b = service.create(TaskType::IndexChannelTask, body, 3, false).await.unwrap();
    assert_eq!(service.get(a.id).await.unwrap().status, TaskStatus::Created);
    assert_eq!(service.get(b.id).await.unwrap().status, TaskStatus::Created);
}

#[tokio::test]
async fn test_find_active_uses_payload_subset_and_recency() {
    for (name, store) in stores().await {
        let service = TaskRecordService::new(store);
        let mut older = service
            .create(TaskType::IndexChannelTask, payload(json!({"chat_id": 9, "full": true})), 3, false)
            .await
            .unwrap();
        let newer = service
            .create(TaskType::IndexChannelTask, payload(json!({"chat_id": 9, "full": false})), 3, false)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        service.transition(&mut older, TaskStatus::InQueue).await.unwrap();

        // `older` was modified last, so it wins among the matches.
        let found = service
            .find_active(TaskType::IndexChannelTask, &payload(json!({"chat_id": 9})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, older.id, "{name}");

        let narrowed = service
            .find_active(TaskType::IndexChannelTask, &payload(json!({"full": false})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(narrowed.id, newer.id, "{name}");

        assert!(service
            .find_active(TaskType::IndexChannelTask, &payload(json!({"chat_id": 10})))
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn test_find_active_never_returns_terminal_records() {
    for (name, store) in stores().await {
        let service = TaskRecordService::new(store);
        for terminal in [TaskStatus::Done, TaskStatus::Failed, TaskStatus::Canceled] {
            let mut record = service
                .create(TaskType::ExtractUsernamesTask, Payload::new(), 1, false)
                .await
                .unwrap();
            if terminal != TaskStatus::Canceled {
                service.transition(&mut record, TaskStatus::InWorker).await.unwrap();
            }
            service.transition(&mut record, terminal).await.unwrap();
        }

        assert!(
            service
                .find_active(TaskType::ExtractUsernamesTask, &Payload::new())
                .await
                .unwrap()
                .is_none(),
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_cancel_active_only_touches_active_records_of_type() {
    for (name, store) in stores().await {
        let service = TaskRecordService::new(store);
        let a = service.create(TaskType::IndexChannelTask, Payload::new(), 3, false).await.unwrap();
        let mut b = service.create(TaskType::IndexChannelTask, Payload::new(), 3, false).await.unwrap();
        service.transition(&mut b, TaskStatus::InWorker).await.unwrap();
        let mut done = service.create(TaskType::IndexChannelTask, Payload::new(), 3, false).await.unwrap();
        service.transition(&mut done, TaskStatus::InWorker).await.unwrap();
        service.transition(&mut done, TaskStatus::Done).await.unwrap();
        let other = service.create(TaskType::DummyTask, Payload::new(), 1, false).await.unwrap();

        assert_eq!(service.cancel_active(TaskType::IndexChannelTask).await.unwrap(), 2, "{name}");
        assert_eq!(service.get(a.id).await.unwrap().status, TaskStatus::Canceled);
        assert_eq!(service.get(b.id).await.unwrap().status, TaskStatus::Canceled);
        assert_eq!(service.get(done.id).await.unwrap().status, TaskStatus::Done);
        assert_eq!(service.get(other.id).await.unwrap().status, TaskStatus::Created);

        assert_eq!(service.cancel_active(TaskType::IndexChannelTask).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_get_missing_record() {
    let service = TaskRecordService::new(Arc::new(InMemoryTaskStore::new()));
    let id = Uuid::new_v4();
    assert!(matches!(
        service.get(id).await,
        Err(CourierError::TaskNotFound { id: missing }) if missing == id
    ));
}

/// Store whose compare-and-set always loses, as if another process kept
/// writing in between.
struct AlwaysConflicting {
    inner: InMemoryTaskStore,
    attempts: AtomicU32,
}

#[async_trait]
impl TaskRecordStore for AlwaysConflicting {
    async fn insert(&self, record: &TaskRecord) -> CourierResult<()> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: Uuid) -> CourierResult<Option<TaskRecord>> {
        self.inner.get(id).await
    }

    async fn update_status(&self, _update: &StatusUpdate) -> CourierResult<Option<TaskRecord>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn list_active(&self, task_type: TaskType) -> CourierResult<Vec<TaskRecord>> {
        self.inner.list_active(task_type).await
    }
}

#[tokio::test]
async fn test_conflicting_writes_are_retried_a_bounded_number_of_times() {
    let store = Arc::new(AlwaysConflicting {
        inner: InMemoryTaskStore::new(),
        attempts: AtomicU32::new(0),
    });
    let service = TaskRecordService::new(store.clone());
    let mut record = service.create(TaskType::DummyTask, Payload::new(), 1, false).await.unwrap();

    let result = service.transition(&mut record, TaskStatus::InQueue).await;
    assert!(matches!(
        result,
        Err(CourierError::ConcurrentModification { attempts: 3, .. })
    ));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
}
