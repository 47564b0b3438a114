use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    BrokerConfig, DatabaseConfig, ObservabilityConfig, RoutingConfig, SchedulerConfig, WorkerConfig,
};

const DEFAULT_CONFIG_PATHS: [&str; 3] = ["config/courier.toml", "courier.toml", "/etc/courier/config.toml"];

/// Process configuration shared by workers, the scheduler and the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub routing: RoutingConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration.
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML). An explicit path must exist; otherwise the
    ///    first of the default locations that exists is used, if any
    /// 3. Environment overrides, e.g. `COURIER__BROKER__URL`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("broker.url", defaults.broker.url.clone())?
            .set_default("broker.exchange_prefix", defaults.broker.exchange_prefix.clone())?
            .set_default(
                "broker.connection_timeout_seconds",
                defaults.broker.connection_timeout_seconds,
            )?
            .set_default(
                "broker.reconnect_max_attempts",
                defaults.broker.reconnect_max_attempts,
            )?
            .set_default(
                "broker.reconnect_base_delay_ms",
                defaults.broker.reconnect_base_delay_ms,
            )?
            .set_default(
                "broker.reconnect_max_delay_ms",
                defaults.broker.reconnect_max_delay_ms,
            )?
            .set_default("database.url", defaults.database.url.clone())?
            .set_default("database.max_connections", defaults.database.max_connections)?
            .set_default("database.min_connections", defaults.database.min_connections)?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds,
            )?
            .set_default("database.run_migrations", defaults.database.run_migrations)?
            .set_default("worker.enabled", defaults.worker.enabled)?
            .set_default("worker.worker_id", defaults.worker.worker_id.clone())?
            .set_default("worker.accepts_shared_work", defaults.worker.accepts_shared_work)?
            .set_default("worker.session_name", defaults.worker.session_name.clone())?
            .set_default("scheduler.enabled", defaults.scheduler.enabled)?
            .set_default("observability.log_level", defaults.observability.log_level.clone())?
            .set_default("observability.log_format", defaults.observability.log_format.clone())?;

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("config file not found: {path}"));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate().context("invalid broker configuration")?;
        self.database
            .validate()
            .context("invalid database configuration")?;
        self.routing.validate().context("invalid routing configuration")?;
        self.worker.validate().context("invalid worker configuration")?;
        self.scheduler
            .validate()
            .context("invalid scheduler configuration")?;
        self.observability
            .validate()
            .context("invalid observability configuration")?;
        Ok(())
    }
}
