//! Data model shared by publishers, consumers and the scheduler.

pub mod command;
pub mod envelope;
pub mod job;
pub mod task_record;
pub mod task_status;
pub mod task_type;

pub use command::*;
pub use envelope::*;
pub use job::*;
pub use task_record::*;
pub use task_status::*;
pub use task_type::*;
