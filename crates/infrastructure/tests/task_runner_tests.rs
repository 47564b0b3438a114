use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::models::{Payload, TaskEnvelope, TaskStatus, TaskType};
use courier_core::routing::{Destination, RoutingTable};
use courier_core::traits::{Delivery, ExternalSession, MessageBroker, StatusUpdate, TaskRecordStore};
use courier_core::{
    Checkpoint, CourierError, CourierResult, Publisher, RunOutcome, TaskBody, TaskBodyRegistry,
    TaskContext, TaskRecordService, TaskRunner,
};
use courier_infrastructure::{InMemoryBroker, InMemoryTaskStore};
use serde_json::json;
use uuid::Uuid;

struct TestSession;

impl ExternalSession for TestSession {
    fn session_name(&self) -> &str {
        "test-session"
    }
}

#[derive(Default)]
struct Counting {
    runs: AtomicU32,
}

#[async_trait]
impl TaskBody<TestSession> for Counting {
    async fn run(&self, ctx: &TaskContext<TestSession>) -> CourierResult<()> {
        assert_eq!(ctx.session().session_name(), "test-session");
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl TaskBody<TestSession> for Failing {
    async fn run(&self, ctx: &TaskContext<TestSession>) -> CourierResult<()> {
        let username: String = ctx.payload_field("username")?;
        Err(CourierError::TaskExecution(format!("{username} does not exist")))
    }
}

struct Panicking;

#[async_trait]
impl TaskBody<TestSession> for Panicking {
    async fn run(&self, _ctx: &TaskContext<TestSession>) -> CourierResult<()> {
        panic!("session exploded");
    }
}

/// Cancels its own record half way through, like an operator would.
struct CanceledMidway {
    steps_after_cancel: AtomicU32,
}

#[async_trait]
impl TaskBody<TestSession> for CanceledMidway {
    async fn run(&self, ctx: &TaskContext<TestSession>) -> CourierResult<()> {
        assert_eq!(ctx.checkpoint().await?, Checkpoint::Continue);

        let mut current = ctx.records().get(ctx.task_id()).await?;
        ctx.records().transition(&mut current, TaskStatus::Canceled).await?;

        if ctx.checkpoint().await? == Checkpoint::Canceled {
            return Ok(());
        }
        self.steps_after_cancel.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Spawns one follow-up task per username in its payload.
struct FanOut;

#[async_trait]
impl TaskBody<TestSession> for FanOut {
    async fn run(&self, ctx: &TaskContext<TestSession>) -> CourierResult<()> {
        let usernames: Vec<String> = ctx.payload_field("usernames")?;
        for username in usernames {
            let mut payload = Payload::new();
            payload.insert("username".into(), json!(username));
            ctx.publisher()?.publish(TaskType::CheckUsernameTask, payload).await?;
        }
        Ok(())
    }
}

struct Harness {
    broker: InMemoryBroker,
    publisher: Publisher,
    runner: TaskRunner<TestSession>,
    counting: Arc<Counting>,
    canceled_midway: Arc<CanceledMidway>,
}

/// What [`InterferingStore`] does to the first IN_WORKER write.
#[derive(Clone, Copy)]
enum Interference {
    /// Fail without touching the record.
    FailBeforeWrite,
    /// Apply the write, then report an error anyway.
    FailAfterWrite,
    /// Let an operator cancel the record just before the write lands.
    CancelFirst,
}

struct InterferingStore {
    inner: InMemoryTaskStore,
    interference: Interference,
    triggered: AtomicU32,
}

impl InterferingStore {
    fn new(interference: Interference) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            interference,
            triggered: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskRecordStore for InterferingStore {
    async fn insert(&self, record: &courier_core::models::TaskRecord) -> CourierResult<()> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: Uuid) -> CourierResult<Option<courier_core::models::TaskRecord>> {
        self.inner.get(id).await
    }

    async fn update_status(&self, update: &StatusUpdate) -> CourierResult<Option<courier_core::models::TaskRecord>> {
        if update.status != TaskStatus::InWorker || self.triggered.fetch_add(1, Ordering::SeqCst) > 0 {
            return self.inner.update_status(update).await;
        }
        match self.interference {
            Interference::FailBeforeWrite => Err(CourierError::Internal("store went away".into())),
            Interference::FailAfterWrite => {
                self.inner.update_status(update).await?;
                Err(CourierError::Internal("store went away".into()))
            }
            Interference::CancelFirst => {
                let cancel = StatusUpdate {
                    status: TaskStatus::Canceled,
                    ..update.clone()
                };
                self.inner.update_status(&cancel).await?;
                self.inner.update_status(update).await
            }
        }
    }

    async fn list_active(&self, task_type: TaskType) -> CourierResult<Vec<courier_core::models::TaskRecord>> {
        self.inner.list_active(task_type).await
    }
}

fn harness() -> Harness {
    harness_with_store(Arc::new(InMemoryTaskStore::new()))
}

fn harness_with_store(store: Arc<dyn TaskRecordStore>) -> Harness {
    let broker = InMemoryBroker::new();
    let records = TaskRecordService::new(store);
    let routing = RoutingTable::with_defaults(vec!["w1".to_string()], Vec::new()).unwrap();
    let publisher = Publisher::new(Arc::new(broker.clone()), Arc::new(routing), records.clone());

    let counting = Arc::new(Counting::default());
    let canceled_midway = Arc::new(CanceledMidway {
        steps_after_cancel: AtomicU32::new(0),
    });
    let mut bodies = TaskBodyRegistry::new();
    bodies.register(TaskType::DummyTask, counting.clone()).unwrap();
    bodies.register(TaskType::CheckUsernameTask, Arc::new(Failing)).unwrap();
    bodies.register(TaskType::AddChannelTask, Arc::new(Panicking)).unwrap();
    bodies.register(TaskType::IndexChannelTask, canceled_midway.clone()).unwrap();
    bodies.register(TaskType::ExtractUsernamesTask, Arc::new(FanOut)).unwrap();

    let runner = TaskRunner::new(records, Arc::new(bodies), Arc::new(TestSession))
        .with_publisher(publisher.clone());
    Harness {
        broker,
        publisher,
        runner,
        counting,
        canceled_midway,
    }
}

async fn take(broker: &InMemoryBroker, destination: Destination) -> Delivery {
    let mut subscription = broker.subscribe(&[destination], 1).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

fn username(name: &str) -> Payload {
    json!({"username": name}).as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_successful_body_marks_done_and_acks() {
    let h = harness();
    let record = h.publisher.publish(TaskType::DummyTask, Payload::new()).await.unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Done);

    assert_eq!(h.counting.runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.broker.ack_count(), 1);
    let stored = h.publisher.records().get(record.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Done);
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn test_failing_body_marks_failed_and_acks_once() {
    let h = harness();
    let record = h
        .publisher
        .publish(TaskType::CheckUsernameTask, username("nobody"))
        .await
        .unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Failed);

    assert_eq!(h.broker.ack_count(), 1);
    assert_eq!(h.broker.queue_len(&Destination::SharedTasks), 0);
    let stored = h.publisher.records().get(record.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    let error = stored.error.unwrap();
    assert!(error.starts_with("task_execution"), "{error}");
    assert!(error.contains("nobody"));
}

#[tokio::test]
async fn test_malformed_payload_is_a_task_failure() {
    let h = harness();
    let record = h
        .publisher
        .publish(TaskType::CheckUsernameTask, Payload::new())
        .await
        .unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Failed);
    let stored = h.publisher.records().get(record.id).await.unwrap();
    assert!(stored.error.unwrap().contains("username"));
}

#[tokio::test]
async fn test_panicking_body_marks_failed() {
    let h = harness();
    let record = h.publisher.publish(TaskType::AddChannelTask, Payload::new()).await.unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Failed);

    assert_eq!(h.broker.ack_count(), 1);
    let stored = h.publisher.records().get(record.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("panic: session exploded"));
}

#[tokio::test]
async fn test_missing_body_marks_failed() {
    let h = harness();
    let record = h
        .publisher
        .publish(TaskType::IndexAudiosTask, Payload::new())
        .await
        .unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Failed);
    let stored = h.publisher.records().get(record.id).await.unwrap();
    assert_eq!(stored.error.as_deref(), Some("unknown_task_body"));
}

#[tokio::test]
async fn test_canceled_before_start_is_skipped() {
    let h = harness();
    let record = h.publisher.publish(TaskType::DummyTask, Payload::new()).await.unwrap();
    assert_eq!(h.publisher.records().cancel_active(TaskType::DummyTask).await.unwrap(), 1);

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Canceled);

    assert_eq!(h.counting.runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.ack_count(), 1);
    assert_eq!(
        h.publisher.records().get(record.id).await.unwrap().status,
        TaskStatus::Canceled
    );
}

#[tokio::test]
async fn test_cancel_observed_at_checkpoint_ends_early() {
    let h = harness();
    let record = h
        .publisher
        .publish(TaskType::IndexChannelTask, Payload::new())
        .await
        .unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Canceled);

    assert_eq!(h.canceled_midway.steps_after_cancel.load(Ordering::SeqCst), 0);
    let stored = h.publisher.records().get(record.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Canceled);
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn test_redelivered_message_runs_again() {
    let h = harness();
    let record = h.publisher.publish(TaskType::DummyTask, Payload::new()).await.unwrap();
    let delivery = take(&h.broker, Destination::SharedTasks).await;
    let body = delivery.body.clone();
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Done);

    h.broker.redeliver(&Destination::SharedTasks, &body).unwrap();
    let again = take(&h.broker, Destination::SharedTasks).await;
    assert!(again.redelivered);
    assert_eq!(h.runner.run(again).await, RunOutcome::Done);

    assert_eq!(h.counting.runs.load(Ordering::SeqCst), 2);
    assert_eq!(h.broker.ack_count(), 2);
    assert_eq!(
        h.publisher.records().get(record.id).await.unwrap().status,
        TaskStatus::Done
    );
}

#[tokio::test]
async fn test_unknown_record_is_discarded() {
    let h = harness();
    let orphan = TaskEnvelope {
        version: 1,
        task_id: uuid::Uuid::new_v4(),
        task_type: TaskType::DummyTask,
        payload: Payload::new(),
        priority: 1,
    };
    h.broker
        .publish(&Destination::SharedTasks, &orphan.encode().unwrap(), 1)
        .await
        .unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Discarded);
    assert_eq!(h.counting.runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.ack_count(), 1);
}

#[tokio::test]
async fn test_garbage_is_discarded_and_acked() {
    let h = harness();
    h.broker
        .publish(&Destination::SharedTasks, b"{not an envelope", 1)
        .await
        .unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Discarded);
    assert_eq!(h.broker.ack_count(), 1);
}

#[tokio::test]
async fn test_shutdown_task_without_body() {
    let h = harness();
    let record = h.publisher.publish(TaskType::ShutdownTask, Payload::new()).await.unwrap();

    let delivery = take(&h.broker, Destination::WorkerTasks("w1".into())).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Shutdown);
    assert_eq!(
        h.publisher.records().get(record.id).await.unwrap().status,
        TaskStatus::Done
    );
}

#[tokio::test]
async fn test_body_can_publish_follow_up_tasks() {
    let h = harness();
    let mut payload = Payload::new();
    payload.insert("usernames".into(), json!(["a", "b", "c"]));
    h.publisher
        .publish(TaskType::ExtractUsernamesTask, payload)
        .await
        .unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Done);

    assert_eq!(h.broker.queue_len(&Destination::SharedTasks), 3);
    for name in ["a", "b", "c"] {
        assert!(h
            .publisher
            .records()
            .find_active(TaskType::CheckUsernameTask, &username(name))
            .await
            .unwrap()
            .is_some());
    }
}

#[tokio::test]
async fn test_in_worker_write_error_does_not_run_body() {
    let h = harness_with_store(Arc::new(InterferingStore::new(Interference::FailBeforeWrite)));
    let record = h.publisher.publish(TaskType::DummyTask, Payload::new()).await.unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Failed);

    assert_eq!(h.counting.runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.ack_count(), 1);
    // FAILED needs IN_WORKER first, so the record is left where it was.
    assert_eq!(
        h.publisher.records().get(record.id).await.unwrap().status,
        TaskStatus::InQueue
    );
}

#[tokio::test]
async fn test_in_worker_write_error_after_commit_marks_failed() {
    let h = harness_with_store(Arc::new(InterferingStore::new(Interference::FailAfterWrite)));
    let record = h.publisher.publish(TaskType::DummyTask, Payload::new()).await.unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Failed);

    assert_eq!(h.counting.runs.load(Ordering::SeqCst), 0);
    let stored = h.publisher.records().get(record.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.unwrap().starts_with("internal"));
}

#[tokio::test]
async fn test_cancel_racing_in_worker_does_not_run_body() {
    let h = harness_with_store(Arc::new(InterferingStore::new(Interference::CancelFirst)));
    let record = h.publisher.publish(TaskType::DummyTask, Payload::new()).await.unwrap();

    let delivery = take(&h.broker, Destination::SharedTasks).await;
    assert_eq!(h.runner.run(delivery).await, RunOutcome::Canceled);

    assert_eq!(h.counting.runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.ack_count(), 1);
    assert_eq!(
        h.publisher.records().get(record.id).await.unwrap().status,
        TaskStatus::Canceled
    );
}
