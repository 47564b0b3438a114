//! Scheduler process: trigger registry, job runner and the service that
//! ties them to the scheduler's queues.

pub mod cron_utils;
pub mod job_runner;
pub mod scheduler;
pub mod triggers;

pub use cron_utils::CronScheduler;
pub use job_runner::JobRunner;
pub use scheduler::{SchedulerService, StopReason};
pub use triggers::{FireHandler, TriggerRegistry};
