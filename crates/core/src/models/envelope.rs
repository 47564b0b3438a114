use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Payload, TaskRecord, TaskType};
use crate::errors::{CourierError, CourierResult};

pub const ENVELOPE_VERSION: u32 = 1;

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

/// Wire message carrying one task from publisher to consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub payload: Payload,
    pub priority: i32,
}

impl TaskEnvelope {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            task_id: record.id,
            task_type: record.task_type,
            payload: record.payload.clone(),
            priority: record.priority,
        }
    }

    pub fn encode(&self) -> CourierResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CourierError::Serialization(format!("failed to encode envelope: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> CourierResult<Self> {
        let envelope: TaskEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| CourierError::Serialization(format!("failed to decode envelope: {e}")))?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(CourierError::Serialization(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_reproduces_record_fields() {
        let payload = json!({"username": "courier", "nested": {"depth": [1, 2, 3]}})
            .as_object()
            .cloned()
            .unwrap();
        let record = TaskRecord::new(TaskType::CheckUsernameTask, payload, 1);

        let bytes = TaskEnvelope::from_record(&record).encode().unwrap();
        let decoded = TaskEnvelope::decode(&bytes).unwrap();

        assert_eq!(decoded.task_id, record.id);
        assert_eq!(decoded.task_type, record.task_type);
        assert_eq!(decoded.payload, record.payload);
        assert_eq!(decoded.priority, 1);
    }

    #[test]
    fn test_wire_format() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"task_id":"{id}","task_type":"index_channel_task","payload":{{"chat_id":7}},"priority":3}}"#
        );
        let decoded = TaskEnvelope::decode(raw.as_bytes()).unwrap();
        assert_eq!(decoded.version, ENVELOPE_VERSION);
        assert_eq!(decoded.task_id, id);
        assert_eq!(decoded.task_type, TaskType::IndexChannelTask);
        assert_eq!(decoded.payload["chat_id"], json!(7));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let raw = format!(
            r#"{{"version":2,"task_id":"{}","task_type":"dummy_task","payload":{{}},"priority":1}}"#,
            Uuid::new_v4()
        );
        assert!(matches!(
            TaskEnvelope::decode(raw.as_bytes()),
            Err(CourierError::Serialization(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_task_type() {
        let raw = format!(
            r#"{{"task_id":"{}","task_type":"nope","payload":{{}},"priority":1}}"#,
            Uuid::new_v4()
        );
        assert!(TaskEnvelope::decode(raw.as_bytes()).is_err());
    }
}
