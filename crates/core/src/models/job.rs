use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Payload, TaskType};
use crate::errors::{CourierError, CourierResult};

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fixed period; the first fire happens one period after registration.
    Interval { seconds: u64 },
    /// Calendar expression in the `cron` crate syntax (seconds field first).
    Cron { expression: String },
    /// One-shot deferred execution.
    Date { run_at: DateTime<Utc> },
}

impl Trigger {
    pub fn interval(period: Duration) -> Self {
        Trigger::Interval {
            seconds: period.as_secs(),
        }
    }
}

/// Recurring production rule for task records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Registry key; registering a job with an existing name replaces it.
    pub name: String,
    pub task_type: TaskType,
    pub trigger: Trigger,
    #[serde(default)]
    pub payload_template: Payload,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, task_type: TaskType, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            task_type,
            trigger,
            payload_template: Payload::new(),
            priority: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload_template = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn validate(&self) -> CourierResult<()> {
        if self.name.trim().is_empty() {
            return Err(CourierError::Configuration("job name must not be empty".into()));
        }
        match &self.trigger {
            Trigger::Interval { seconds: 0 } => Err(CourierError::Configuration(format!(
                "job {} has a zero interval",
                self.name
            ))),
            Trigger::Cron { expression } if expression.trim().is_empty() => {
                Err(CourierError::InvalidCron {
                    expr: expression.clone(),
                    message: "empty expression".into(),
                })
            }
            _ => Ok(()),
        }
    }
}
