use std::sync::Arc;

use courier_core::config::DatabaseConfig;
use courier_core::traits::TaskRecordStore;
use courier_core::CourierResult;
use tracing::info;

use super::{InMemoryTaskStore, SqliteTaskStore};

/// Open the task record store described by `config`.
pub async fn open_task_store(config: &DatabaseConfig) -> CourierResult<Arc<dyn TaskRecordStore>> {
    if config.is_memory() {
        info!("using process-local task record store");
        return Ok(Arc::new(InMemoryTaskStore::new()));
    }

    let store = SqliteTaskStore::connect(config).await?;
    store.health_check().await?;
    Ok(Arc::new(store))
}
