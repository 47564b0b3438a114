//! Broker and task record store implementations.

pub mod database;
pub mod in_memory_queue;
pub mod message_queue;

pub use database::{open_task_store, InMemoryTaskStore, SqliteTaskStore};
pub use in_memory_queue::InMemoryBroker;
pub use message_queue::RabbitMqBroker;

use std::sync::Arc;

use courier_core::config::BrokerConfig;
use courier_core::traits::MessageBroker;
use courier_core::CourierResult;

/// Connect to the broker described by `config`. `memory` selects the
/// in-process broker.
pub async fn connect_broker(config: &BrokerConfig) -> CourierResult<Arc<dyn MessageBroker>> {
    if config.url == "memory" {
        return Ok(Arc::new(InMemoryBroker::new()));
    }
    Ok(Arc::new(RabbitMqBroker::connect(config.clone()).await?))
}
