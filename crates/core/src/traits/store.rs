use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{TaskRecord, TaskStatus, TaskType};
use crate::CourierResult;

/// Compare-and-set status change.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub id: Uuid,
    pub expected_version: i64,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub modified_at: DateTime<Utc>,
}

/// Shared, durable task record storage.
///
/// Implementations must be safe for concurrent use from independent
/// processes; status changes go through [`TaskRecordStore::update_status`].
#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    async fn insert(&self, record: &TaskRecord) -> CourierResult<()>;

    async fn get(&self, id: Uuid) -> CourierResult<Option<TaskRecord>>;

    /// Apply `update` only if the stored version still equals
    /// `expected_version`. Returns the updated record, or `None` on conflict.
    async fn update_status(&self, update: &StatusUpdate) -> CourierResult<Option<TaskRecord>>;

    /// Active records of a type, most recently modified first.
    async fn list_active(&self, task_type: TaskType) -> CourierResult<Vec<TaskRecord>>;
}
