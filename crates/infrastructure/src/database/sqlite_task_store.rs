use std::time::Duration;

use async_trait::async_trait;
use courier_core::config::DatabaseConfig;
use courier_core::models::{Payload, TaskRecord, TaskType};
use courier_core::traits::{StatusUpdate, TaskRecordStore};
use courier_core::{CourierError, CourierResult};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const RECORD_COLUMNS: &str =
    "id, task_type, status, payload, priority, error, created_at, modified_at, version";

/// Task records in SQLite, shared by every process pointing at the same file.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> CourierResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.url)
            .await?;

        let store = Self::new(pool);
        if config.run_migrations {
            store.migrate().await?;
        }
        info!(url = %config.url, "task record store ready");
        Ok(store)
    }

    /// Private in-memory database. A single connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> CourierResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> CourierResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_records (
                id TEXT PRIMARY KEY NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_task_records_type_status ON task_records (task_type, status)",
        )
        .execute(&self.pool)
        .await?;

        debug!("task_records schema is up to date");
        Ok(())
    }

    pub async fn health_check(&self) -> CourierResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> CourierResult<TaskRecord> {
        let id: String = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;
        Ok(TaskRecord {
            id: Uuid::parse_str(&id)
                .map_err(|e| CourierError::Serialization(format!("invalid task id {id}: {e}")))?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            payload: serde_json::from_str::<Payload>(&payload)?,
            priority: row.try_get("priority")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            modified_at: row.try_get("modified_at")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl TaskRecordStore for SqliteTaskStore {
    #[instrument(skip_all, fields(task_id = %record.id, task_type = %record.task_type))]
    async fn insert(&self, record: &TaskRecord) -> CourierResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_records (id, task_type, status, payload, priority, error, created_at, modified_at, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.task_type)
        .bind(record.status)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(record.priority)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.modified_at)
        .bind(record.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CourierResult<Option<TaskRecord>> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM task_records WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip_all, fields(task_id = %update.id, status = %update.status))]
    async fn update_status(&self, update: &StatusUpdate) -> CourierResult<Option<TaskRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE task_records
            SET status = ?, error = COALESCE(?, error), modified_at = ?, version = version + 1
            WHERE id = ? AND version = ?
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(update.status)
        .bind(&update.error)
        .bind(update.modified_at)
        .bind(update.id.to_string())
        .bind(update.expected_version)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            debug!(expected_version = update.expected_version, "compare-and-set lost");
        }
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_active(&self, task_type: TaskType) -> CourierResult<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM task_records
            WHERE task_type = ? AND status IN ('CREATED', 'IN_QUEUE', 'IN_WORKER')
            "#
        ))
        .bind(task_type)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<CourierResult<Vec<_>>>()?;
        records.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(records)
    }
}
