//! Worker side of the distribution layer: the consumer loop that binds one
//! external session to a worker's task and command queues.

pub mod service;

pub use service::{StopReason, WorkerConsumer, WorkerConsumerBuilder};
