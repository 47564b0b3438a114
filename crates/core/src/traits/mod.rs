pub mod broker;
pub mod session;
pub mod store;

pub use broker::{Acknowledger, Delivery, MessageBroker, Subscription};
pub use session::{ExternalSession, NoSession};
pub use store::{StatusUpdate, TaskRecordStore};
