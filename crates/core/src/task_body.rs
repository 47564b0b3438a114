use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::errors::{CourierError, CourierResult};
use crate::models::{Payload, TaskRecord, TaskStatus, TaskType};
use crate::services::{Publisher, TaskRecordService};
use crate::traits::ExternalSession;

/// Implementation of one task type.
///
/// Bodies must tolerate being run more than once for the same record:
/// delivery is at-least-once and redelivered messages are executed again.
#[async_trait]
pub trait TaskBody<S: ExternalSession>: Send + Sync {
    async fn run(&self, ctx: &TaskContext<S>) -> CourierResult<()>;
}

/// Result of a cancellation checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Canceled,
}

/// Everything a task body gets to work with.
pub struct TaskContext<S: ExternalSession> {
    record: TaskRecord,
    payload: Payload,
    session: Arc<S>,
    records: TaskRecordService,
    publisher: Option<Publisher>,
}

impl<S: ExternalSession> TaskContext<S> {
    pub fn new(
        record: TaskRecord,
        payload: Payload,
        session: Arc<S>,
        records: TaskRecordService,
        publisher: Option<Publisher>,
    ) -> Self {
        Self {
            record,
            payload,
            session,
            records,
            publisher,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.record.id
    }

    pub fn task_type(&self) -> TaskType {
        self.record.task_type
    }

    /// The record as it was when the body started.
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Typed access to a payload field.
    pub fn payload_field<T: DeserializeOwned>(&self, key: &str) -> CourierResult<T> {
        let value = self.payload.get(key).ok_or_else(|| {
            CourierError::TaskExecution(format!("payload of {} is missing `{key}`", self.task_type()))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            CourierError::TaskExecution(format!("payload field `{key}` is malformed: {e}"))
        })
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn records(&self) -> &TaskRecordService {
        &self.records
    }

    /// Publisher for spawning follow-up tasks.
    pub fn publisher(&self) -> CourierResult<&Publisher> {
        self.publisher
            .as_ref()
            .ok_or_else(|| CourierError::Internal("no publisher attached to this consumer".into()))
    }

    /// Re-read the record and report whether the body should keep going.
    /// Call before every long sub-step; a cancel observed here is an early
    /// successful exit, not a failure.
    pub async fn checkpoint(&self) -> CourierResult<Checkpoint> {
        let current = self.records.get(self.record.id).await?;
        if current.status == TaskStatus::Canceled {
            Ok(Checkpoint::Canceled)
        } else {
            Ok(Checkpoint::Continue)
        }
    }
}

/// Maps task types to their bodies. Built once at startup.
pub struct TaskBodyRegistry<S: ExternalSession> {
    bodies: HashMap<TaskType, Arc<dyn TaskBody<S>>>,
}

impl<S: ExternalSession> TaskBodyRegistry<S> {
    pub fn new() -> Self {
        Self {
            bodies: HashMap::new(),
        }
    }

    pub fn register(&mut self, task_type: TaskType, body: Arc<dyn TaskBody<S>>) -> CourierResult<()> {
        if self.bodies.contains_key(&task_type) {
            return Err(CourierError::Configuration(format!(
                "a task body for {task_type} is already registered"
            )));
        }
        self.bodies.insert(task_type, body);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskBody<S>>> {
        self.bodies.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.bodies.contains_key(&task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.bodies.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl<S: ExternalSession> Default for TaskBodyRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
