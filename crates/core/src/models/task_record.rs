use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{TaskStatus, TaskType};

/// Opaque task payload. Only task bodies interpret it.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Durable record of one unit of distributed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: Payload,
    pub priority: i32,
    /// Error tag recorded when the task ends up FAILED.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every status change.
    pub version: i64,
}

impl TaskRecord {
    pub fn new(task_type: TaskType, payload: Payload, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Created,
            payload,
            priority,
            error: None,
            created_at: now,
            modified_at: now,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// True when every key of `filter` is present in the payload with an equal value.
    pub fn matches_payload(&self, filter: &Payload) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.payload.get(key) == Some(value))
    }

    /// Timestamp for the next modification; never earlier than the current one.
    pub fn next_modified_at(&self) -> DateTime<Utc> {
        Utc::now().max(self.modified_at)
    }
}
