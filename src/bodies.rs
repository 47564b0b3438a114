//! Built-in task bodies.
//!
//! Real deployments register their own bodies; these exercise the pipeline
//! end to end and back the demo configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::traits::{ExternalSession, NoSession};
use courier_core::{
    Checkpoint, CourierResult, PublishOptions, TaskBody, TaskBodyRegistry, TaskContext, TaskType,
};
use serde_json::json;
use tracing::info;

/// Session stand-in that only carries the configured name.
#[derive(Debug, Clone)]
pub struct LoggingSession {
    name: String,
}

impl LoggingSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ExternalSession for LoggingSession {
    fn session_name(&self) -> &str {
        &self.name
    }
}

/// Logs, optionally sleeps `steps` times for `step_ms`, and stops early when
/// its record is canceled.
pub struct DummyBody;

#[async_trait]
impl<S: ExternalSession> TaskBody<S> for DummyBody {
    async fn run(&self, ctx: &TaskContext<S>) -> CourierResult<()> {
        let steps: u32 = ctx.payload_field("steps").unwrap_or(1);
        let step_ms: u64 = ctx.payload_field("step_ms").unwrap_or(0);

        for step in 0..steps {
            if ctx.checkpoint().await? == Checkpoint::Canceled {
                info!(task_id = %ctx.task_id(), step, "dummy task canceled");
                return Ok(());
            }
            if step_ms > 0 {
                tokio::time::sleep(Duration::from_millis(step_ms)).await;
            }
        }

        info!(
            task_id = %ctx.task_id(),
            task_type = %ctx.task_type(),
            session = ctx.session().session_name(),
            "dummy task done"
        );
        Ok(())
    }
}

/// Fans a `usernames` list out into one `check_username_task` each.
/// Usernames with an active check already are skipped by dedupe.
pub struct CheckUsernamesJob;

#[async_trait]
impl TaskBody<NoSession> for CheckUsernamesJob {
    async fn run(&self, ctx: &TaskContext<NoSession>) -> CourierResult<()> {
        let usernames: Vec<String> = ctx.payload_field("usernames").unwrap_or_default();
        let publisher = ctx.publisher()?;

        for username in &usernames {
            if ctx.checkpoint().await? == Checkpoint::Canceled {
                return Ok(());
            }
            let payload = json!({ "username": username });
            let payload = payload.as_object().cloned().unwrap_or_default();
            publisher
                .publish_with(TaskType::CheckUsernameTask, payload, PublishOptions::deduplicated())
                .await?;
        }

        info!(task_id = %ctx.task_id(), count = usernames.len(), "username checks published");
        Ok(())
    }
}

/// Bodies a worker process runs.
pub fn worker_bodies<S: ExternalSession>() -> CourierResult<TaskBodyRegistry<S>> {
    let mut registry = TaskBodyRegistry::new();
    registry.register(TaskType::DummyTask, Arc::new(DummyBody))?;
    Ok(registry)
}

/// Bodies the scheduler runs for tasks routed to it.
pub fn scheduler_bodies() -> CourierResult<TaskBodyRegistry<NoSession>> {
    let mut registry = TaskBodyRegistry::new();
    registry.register(TaskType::DummyJob, Arc::new(DummyBody))?;
    registry.register(TaskType::CheckUsernamesJob, Arc::new(CheckUsernamesJob))?;
    Ok(registry)
}
