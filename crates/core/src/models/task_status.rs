use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{CourierError, CourierResult};

/// Lifecycle status of a task record.
///
/// ```text
/// CREATED --> IN_QUEUE --> IN_WORKER --> DONE | FAILED
///    |            |            |
///    +------------+------------+--> CANCELED
/// ```
///
/// `CREATED -> IN_WORKER` is also legal: a consumer may pick a message up
/// before the publisher has recorded `IN_QUEUE`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "IN_QUEUE")]
    InQueue,
    #[serde(rename = "IN_WORKER")]
    InWorker,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl TaskStatus {
    pub const ACTIVE: [TaskStatus; 3] = [TaskStatus::Created, TaskStatus::InQueue, TaskStatus::InWorker];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::InQueue => "IN_QUEUE",
            TaskStatus::InWorker => "IN_WORKER",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, InQueue)
                | (Created, InWorker)
                | (InQueue, InWorker)
                | (InWorker, Done)
                | (InWorker, Failed)
                | (Created, Canceled)
                | (InQueue, Canceled)
                | (InWorker, Canceled)
        )
    }

    /// Whether this status comes after `other` along the lifecycle. A record
    /// that has already passed a status makes a late write to it harmless.
    pub fn has_passed(&self, other: TaskStatus) -> bool {
        self.stage() > other.stage()
    }

    fn stage(&self) -> u8 {
        match self {
            TaskStatus::Created => 0,
            TaskStatus::InQueue => 1,
            TaskStatus::InWorker => 2,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled => 3,
        }
    }

    pub fn check_transition(&self, id: Uuid, next: TaskStatus) -> CourierResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CourierError::StaleTransitionRejected {
                id,
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(TaskStatus::Created),
            "IN_QUEUE" => Ok(TaskStatus::InQueue),
            "IN_WORKER" => Ok(TaskStatus::InWorker),
            "DONE" => Ok(TaskStatus::Done),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELED" => Ok(TaskStatus::Canceled),
            _ => Err(CourierError::Serialization(format!("invalid task status: {s}"))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<TaskStatus>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}
