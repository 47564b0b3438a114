pub mod publisher;
pub mod runner;
pub mod task_records;

pub use publisher::{PublishOptions, Publisher};
pub use runner::{RunOutcome, TaskRunner};
pub use task_records::{TaskRecordService, DEFAULT_TRANSITION_ATTEMPTS};
