use serde::{Deserialize, Serialize};

use super::{JobDefinition, TaskEnvelope};
use crate::errors::{CourierError, CourierResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Pause,
    Resume,
    Shutdown,
}

/// Recipient of a control command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTarget {
    Worker(String),
    Scheduler,
}

impl CommandTarget {
    /// Name used for the recipient's command queue and routing key.
    pub fn recipient(&self) -> &str {
        match self {
            CommandTarget::Worker(id) => id,
            CommandTarget::Scheduler => "scheduler",
        }
    }
}

/// Control plane message: `{action, target}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub action: CommandAction,
    pub target: CommandTarget,
}

impl WorkerCommand {
    pub fn new(action: CommandAction, target: CommandTarget) -> Self {
        Self { action, target }
    }

    pub fn encode(&self) -> CourierResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CourierResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CourierError::Serialization(format!("failed to decode command: {e}")))
    }
}

/// Messages accepted on the scheduler queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerMessage {
    RegisterJob { job: JobDefinition },
    RunTask { envelope: TaskEnvelope },
}

impl SchedulerMessage {
    pub fn encode(&self) -> CourierResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CourierResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            CourierError::Serialization(format!("failed to decode scheduler message: {e}"))
        })
    }
}
