use std::collections::HashMap;

use async_trait::async_trait;
use courier_core::models::{TaskRecord, TaskType};
use courier_core::traits::{StatusUpdate, TaskRecordStore};
use courier_core::{CourierError, CourierResult};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local task record store for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Every record, oldest first.
    pub async fn all(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

#[async_trait]
impl TaskRecordStore for InMemoryTaskStore {
    async fn insert(&self, record: &TaskRecord) -> CourierResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(CourierError::Internal(format!("duplicate task id {}", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CourierResult<Option<TaskRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update_status(&self, update: &StatusUpdate) -> CourierResult<Option<TaskRecord>> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&update.id) else {
            return Ok(None);
        };
        if record.version != update.expected_version {
            return Ok(None);
        }

        record.status = update.status;
        if update.error.is_some() {
            record.error = update.error.clone();
        }
        record.modified_at = update.modified_at.max(record.modified_at);
        record.version += 1;
        Ok(Some(record.clone()))
    }

    async fn list_active(&self, task_type: TaskType) -> CourierResult<Vec<TaskRecord>> {
        let mut active: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.task_type == task_type && r.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(active)
    }
}
