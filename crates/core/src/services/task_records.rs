use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::{CourierError, CourierResult};
use crate::models::{Payload, TaskRecord, TaskStatus, TaskType};
use crate::traits::{StatusUpdate, TaskRecordStore};

/// Compare-and-set attempts before a transition gives up.
pub const DEFAULT_TRANSITION_ATTEMPTS: u32 = 3;

/// Task record lifecycle on top of a shared store.
#[derive(Clone)]
pub struct TaskRecordService {
    store: Arc<dyn TaskRecordStore>,
    max_attempts: u32,
}

impl TaskRecordService {
    pub fn new(store: Arc<dyn TaskRecordStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_TRANSITION_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskRecordStore> {
        &self.store
    }

    /// Create a CREATED record. With `dedupe`, active records of the same
    /// type and payload are canceled first. Concurrent creators can still
    /// race past each other; duplicates are tolerated downstream.
    #[instrument(skip_all, fields(task_type = %task_type, dedupe = dedupe))]
    pub async fn create(
        &self,
        task_type: TaskType,
        payload: Payload,
        priority: i32,
        dedupe: bool,
    ) -> CourierResult<TaskRecord> {
        if dedupe {
            for mut stale in self.store.list_active(task_type).await? {
                if stale.payload == payload {
                    info!(task_id = %stale.id, "canceling superseded task");
                    self.transition(&mut stale, TaskStatus::Canceled).await?;
                }
            }
        }

        let record = TaskRecord::new(task_type, payload, priority);
        self.store.insert(&record).await?;
        debug!(task_id = %record.id, "task record created");
        Ok(record)
    }

    pub async fn find(&self, id: Uuid) -> CourierResult<Option<TaskRecord>> {
        self.store.get(id).await
    }

    pub async fn get(&self, id: Uuid) -> CourierResult<TaskRecord> {
        self.store
            .get(id)
            .await?
            .ok_or(CourierError::TaskNotFound { id })
    }

    /// Move `record` to `status`. Returns `Ok(false)` when the transition is
    /// not reachable from the record's current status; that case is logged
    /// and otherwise ignored. `record` is refreshed from the store whenever
    /// a conflicting write is detected.
    pub async fn transition(&self, record: &mut TaskRecord, status: TaskStatus) -> CourierResult<bool> {
        self.apply(record, status, None).await
    }

    /// Move `record` to FAILED, recording the error class.
    pub async fn mark_failed(&self, record: &mut TaskRecord, error: impl Into<String>) -> CourierResult<bool> {
        self.apply(record, TaskStatus::Failed, Some(error.into())).await
    }

    async fn apply(
        &self,
        record: &mut TaskRecord,
        status: TaskStatus,
        error: Option<String>,
    ) -> CourierResult<bool> {
        for attempt in 1..=self.max_attempts {
            if let Err(e) = record.status.check_transition(record.id, status) {
                if record.status.has_passed(status) {
                    debug!(task_id = %record.id, task_type = %record.task_type, "{e}");
                } else {
                    warn!(task_id = %record.id, task_type = %record.task_type, "{e}");
                }
                return Ok(false);
            }

            let update = StatusUpdate {
                id: record.id,
                expected_version: record.version,
                status,
                error: error.clone(),
                modified_at: record.next_modified_at(),
            };

            match self.store.update_status(&update).await? {
                Some(updated) => {
                    debug!(
                        task_id = %record.id,
                        from = %record.status,
                        to = %updated.status,
                        "task status changed"
                    );
                    *record = updated;
                    return Ok(true);
                }
                None => {
                    debug!(task_id = %record.id, attempt, "version conflict, reloading record");
                    *record = self.get(record.id).await?;
                }
            }
        }

        Err(CourierError::ConcurrentModification {
            id: record.id,
            attempts: self.max_attempts,
        })
    }

    /// Most recently modified active record of `task_type` whose payload
    /// contains every key/value of `filter`.
    pub async fn find_active(&self, task_type: TaskType, filter: &Payload) -> CourierResult<Option<TaskRecord>> {
        Ok(self
            .store
            .list_active(task_type)
            .await?
            .into_iter()
            .filter(|record| record.is_active() && record.matches_payload(filter))
            .max_by_key(|record| record.modified_at))
    }

    /// Cancel every active record of `task_type`. Returns how many were canceled.
    #[instrument(skip_all, fields(task_type = %task_type))]
    pub async fn cancel_active(&self, task_type: TaskType) -> CourierResult<usize> {
        let mut canceled = 0;
        for mut record in self.store.list_active(task_type).await? {
            if self.transition(&mut record, TaskStatus::Canceled).await? {
                canceled += 1;
            }
        }
        if canceled > 0 {
            info!(canceled, "canceled active tasks");
        }
        Ok(canceled)
    }
}
