pub mod in_memory_task_store;
pub mod manager;
pub mod sqlite_task_store;

pub use in_memory_task_store::InMemoryTaskStore;
pub use manager::open_task_store;
pub use sqlite_task_store::SqliteTaskStore;
