use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::counter;
use tracing::{debug, error, info, warn, Instrument};

use crate::models::{TaskEnvelope, TaskRecord, TaskStatus, TaskType};
use crate::services::{Publisher, TaskRecordService};
use crate::task_body::{TaskBodyRegistry, TaskContext};
use crate::traits::{Delivery, ExternalSession};

/// What happened to one delivered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Failed,
    /// The record was canceled before or while the body ran.
    Canceled,
    /// The message could not be matched to a record and was dropped.
    Discarded,
    /// A shutdown task completed; the consumer should stop.
    Shutdown,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Done => "done",
            RunOutcome::Failed => "failed",
            RunOutcome::Canceled => "canceled",
            RunOutcome::Discarded => "discarded",
            RunOutcome::Shutdown => "shutdown",
        }
    }
}

/// Executes delivered tasks against one session.
///
/// Every delivery is acknowledged exactly once, whatever the outcome; failed
/// tasks are recorded as FAILED and never requeued.
pub struct TaskRunner<S: ExternalSession> {
    records: TaskRecordService,
    bodies: Arc<TaskBodyRegistry<S>>,
    session: Arc<S>,
    publisher: Option<Publisher>,
}

impl<S: ExternalSession> Clone for TaskRunner<S> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            bodies: Arc::clone(&self.bodies),
            session: Arc::clone(&self.session),
            publisher: self.publisher.clone(),
        }
    }
}

impl<S: ExternalSession> TaskRunner<S> {
    pub fn new(records: TaskRecordService, bodies: Arc<TaskBodyRegistry<S>>, session: Arc<S>) -> Self {
        Self {
            records,
            bodies,
            session,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Decode, execute and acknowledge one delivery.
    pub async fn run(&self, delivery: Delivery) -> RunOutcome {
        let outcome = match TaskEnvelope::decode(&delivery.body) {
            Ok(envelope) => self.execute(envelope).await,
            Err(e) => {
                warn!(source = %delivery.source, "dropping undecodable message: {e}");
                RunOutcome::Discarded
            }
        };

        if let Err(e) = delivery.ack().await {
            error!("failed to acknowledge delivery: {e}");
        }
        outcome
    }

    /// Execute one envelope. Redelivered envelopes go through the same path;
    /// transitions that are no longer reachable are logged no-ops.
    pub async fn execute(&self, envelope: TaskEnvelope) -> RunOutcome {
        let span = tracing::info_span!(
            "task",
            task_id = %envelope.task_id,
            task_type = %envelope.task_type,
            session = self.session.session_name(),
        );
        let outcome = self.execute_inner(envelope).instrument(span).await;
        counter!("courier_tasks_executed_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn execute_inner(&self, envelope: TaskEnvelope) -> RunOutcome {
        let mut record = match self.records.find(envelope.task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("no task record for delivered message");
                return RunOutcome::Discarded;
            }
            Err(e) => {
                error!("failed to load task record: {e}");
                return RunOutcome::Discarded;
            }
        };

        if record.status == TaskStatus::Canceled {
            info!("task was canceled before it started");
            return RunOutcome::Canceled;
        }

        match self.records.transition(&mut record, TaskStatus::InWorker).await {
            Ok(true) => {}
            Ok(false) if record.status == TaskStatus::Canceled => {
                info!("task was canceled before it started");
                return RunOutcome::Canceled;
            }
            // Redelivery, or another ALL_WORKERS copy got there first: run anyway.
            Ok(false) => debug!(status = %record.status, "running task whose record already left the queue"),
            Err(e) => {
                // The write may have landed before the error surfaced; only a
                // record that reached IN_WORKER can be marked FAILED.
                error!("could not mark task IN_WORKER: {e}");
                if let Ok(Some(current)) = self.records.find(record.id).await {
                    record = current;
                }
                self.record_failure(&mut record, format!("{}: {e}", e.error_tag()))
                    .await;
                return RunOutcome::Failed;
            }
        }

        let Some(body) = self.bodies.get(envelope.task_type) else {
            if envelope.task_type == TaskType::ShutdownTask {
                self.record_transition(&mut record, TaskStatus::Done).await;
                info!("shutdown task received");
                return RunOutcome::Shutdown;
            }
            error!("no task body registered");
            self.record_failure(&mut record, "unknown_task_body").await;
            return RunOutcome::Failed;
        };

        let ctx = TaskContext::new(
            record.clone(),
            envelope.payload,
            Arc::clone(&self.session),
            self.records.clone(),
            self.publisher.clone(),
        );

        match AssertUnwindSafe(body.run(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {
                self.record_transition(&mut record, TaskStatus::Done).await;
                match (record.status, envelope.task_type) {
                    (TaskStatus::Canceled, _) => {
                        info!("task observed its cancellation and exited early");
                        RunOutcome::Canceled
                    }
                    (_, TaskType::ShutdownTask) => RunOutcome::Shutdown,
                    _ => {
                        info!("task done");
                        RunOutcome::Done
                    }
                }
            }
            Ok(Err(e)) => {
                error!(error_class = e.error_tag(), "task failed: {e}");
                self.record_failure(&mut record, format!("{}: {e}", e.error_tag()))
                    .await;
                RunOutcome::Failed
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("task body panicked: {message}");
                self.record_failure(&mut record, format!("panic: {message}")).await;
                RunOutcome::Failed
            }
        }
    }

    async fn record_transition(&self, record: &mut TaskRecord, status: TaskStatus) {
        if let Err(e) = self.records.transition(record, status).await {
            warn!(to = %status, "could not record transition: {e}");
        }
    }

    async fn record_failure(&self, record: &mut TaskRecord, error: impl Into<String>) {
        if let Err(e) = self.records.mark_failed(record, error).await {
            warn!("could not record failure: {e}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
