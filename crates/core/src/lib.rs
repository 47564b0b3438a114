//! Core of the courier task distribution layer: task records and their
//! state machine, routing, publishing and task execution.

pub mod config;
pub mod errors;
pub mod models;
pub mod retry;
pub mod routing;
pub mod services;
pub mod task_body;
pub mod traits;

pub use errors::{CourierError, CourierResult};
pub use models::{
    CommandAction, CommandTarget, JobDefinition, Payload, SchedulerMessage, TaskEnvelope,
    TaskRecord, TaskStatus, TaskType, Trigger, WorkerCommand,
};
pub use retry::RetryPolicy;
pub use routing::{Destination, RoutingTable, TargetWorkerType};
pub use services::{PublishOptions, Publisher, RunOutcome, TaskRecordService, TaskRunner};
pub use task_body::{Checkpoint, TaskBody, TaskBodyRegistry, TaskContext};
pub use traits::{
    Delivery, ExternalSession, MessageBroker, NoSession, Subscription, TaskRecordStore,
};
