use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CourierError;

/// Closed set of task bodies the system knows how to run.
///
/// `*_job` variants are produced by scheduler triggers and executed by the
/// scheduler itself; everything else runs on workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AddChannelTask,
    CheckUsernameTask,
    DummyTask,
    ExtractUsernamesTask,
    IndexChannelTask,
    IndexAudiosTask,
    ShutdownTask,
    CheckUsernamesJob,
    CheckUsernamesWithUncheckedMentionsJob,
    DummyJob,
    ExtractUsernamesJob,
    IndexChannelsJob,
    IndexAudiosJob,
    CountInteractionsJob,
    CountHitsJob,
}

impl TaskType {
    pub const ALL: [TaskType; 15] = [
        TaskType::AddChannelTask,
        TaskType::CheckUsernameTask,
        TaskType::DummyTask,
        TaskType::ExtractUsernamesTask,
        TaskType::IndexChannelTask,
        TaskType::IndexAudiosTask,
        TaskType::ShutdownTask,
        TaskType::CheckUsernamesJob,
        TaskType::CheckUsernamesWithUncheckedMentionsJob,
        TaskType::DummyJob,
        TaskType::ExtractUsernamesJob,
        TaskType::IndexChannelsJob,
        TaskType::IndexAudiosJob,
        TaskType::CountInteractionsJob,
        TaskType::CountHitsJob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::AddChannelTask => "add_channel_task",
            TaskType::CheckUsernameTask => "check_username_task",
            TaskType::DummyTask => "dummy_task",
            TaskType::ExtractUsernamesTask => "extract_usernames_task",
            TaskType::IndexChannelTask => "index_channel_task",
            TaskType::IndexAudiosTask => "index_audios_task",
            TaskType::ShutdownTask => "shutdown_task",
            TaskType::CheckUsernamesJob => "check_usernames_job",
            TaskType::CheckUsernamesWithUncheckedMentionsJob => {
                "check_usernames_with_unchecked_mentions_job"
            }
            TaskType::DummyJob => "dummy_job",
            TaskType::ExtractUsernamesJob => "extract_usernames_job",
            TaskType::IndexChannelsJob => "index_channels_job",
            TaskType::IndexAudiosJob => "index_audios_job",
            TaskType::CountInteractionsJob => "count_interactions_job",
            TaskType::CountHitsJob => "count_hits_job",
        }
    }

    pub fn is_job(&self) -> bool {
        self.as_str().ends_with("_job")
    }

    /// Priority used when the publisher is not given one.
    pub fn default_priority(&self) -> i32 {
        match self {
            TaskType::IndexChannelTask | TaskType::IndexAudiosTask => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CourierError::UnknownTaskType(s.to_string()))
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskType {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskType {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<TaskType>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskType {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}
