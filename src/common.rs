use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use courier_core::config::AppConfig;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{AppMode, Application};
use crate::shutdown::ShutdownManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line options shared by every service binary.
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    /// Explicit config file; the default locations are searched otherwise.
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub worker_id: Option<String>,
}

impl StartupConfig {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let get = |id: &str| {
            matches
                .try_get_one::<String>(id)
                .ok()
                .flatten()
                .cloned()
        };
        Self {
            config_path: get("config"),
            log_level: get("log-level"),
            log_format: get("log-format"),
            worker_id: get("worker-id"),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `log_level`.
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("failed to initialise json logging")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("failed to initialise pretty logging")?,
        _ => return Err(anyhow::anyhow!("unsupported log format: {log_format}")),
    }

    Ok(())
}

/// Load configuration and apply command line overrides.
pub fn load_config(startup_config: &StartupConfig) -> Result<AppConfig> {
    let mut config = AppConfig::load(startup_config.config_path.as_deref())
        .context("failed to load configuration")?;

    if let Some(ref worker_id) = startup_config.worker_id {
        config.worker.worker_id = worker_id.clone();
    }
    if let Some(ref level) = startup_config.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(ref format) = startup_config.log_format {
        config.observability.log_format = format.clone();
    }

    config.validate()?;
    Ok(config)
}

/// The options every service binary accepts.
pub fn common_args() -> Vec<Arg> {
    vec![
        Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .help("Path to the TOML configuration file"),
        Arg::new("log-level")
            .short('l')
            .long("log-level")
            .value_name("LEVEL")
            .help("Log level, overrides the configuration")
            .value_parser(["trace", "debug", "info", "warn", "error"]),
        Arg::new("log-format")
            .long("log-format")
            .value_name("FORMAT")
            .help("Log format, overrides the configuration")
            .value_parser(["json", "pretty"]),
    ]
}

/// Parse the command line and run one service until it stops.
pub async fn run_cli(
    name: &'static str,
    about: &'static str,
    custom_args: Vec<Arg>,
    app_mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let matches = Command::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about(about)
        .args(common_args())
        .args(custom_args)
        .get_matches();

    start_application(StartupConfig::from_matches(&matches), app_mode, service_name).await
}

/// Load config, start the application and wait for a signal or for the
/// application to stop on its own (shutdown command or shutdown task).
pub async fn start_application(
    startup_config: StartupConfig,
    app_mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let config = load_config(&startup_config)?;
    init_logging(&config.observability.log_level, &config.observability.log_format)?;

    info!("starting {service_name}");
    if let Some(ref path) = startup_config.config_path {
        info!("config file: {path}");
    }
    info!("mode: {app_mode:?}");

    validate_mode_enabled(app_mode, &config)?;

    let app = Arc::new(Application::new(config, app_mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    let finished = tokio::select! {
        _ = wait_for_shutdown_signal() => None,
        joined = &mut app_handle => Some(joined),
    };

    let result = match finished {
        Some(joined) => report_exit(joined, service_name),
        None => {
            info!("shutdown signal received, stopping gracefully");
            shutdown_manager.shutdown().await;

            match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
                Ok(joined) => report_exit(joined, service_name),
                Err(_) => {
                    warn!("{service_name} did not stop within {SHUTDOWN_TIMEOUT:?}, exiting");
                    Ok(())
                }
            }
        }
    };

    info!("{service_name} exited");
    result
}

fn report_exit(joined: Result<Result<()>, tokio::task::JoinError>, service_name: &str) -> Result<()> {
    match joined {
        Ok(Ok(())) => {
            info!("{service_name} stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{service_name} failed: {e:#}");
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("{service_name} task aborted: {e}")),
    }
}

fn validate_mode_enabled(app_mode: AppMode, config: &AppConfig) -> Result<()> {
    match app_mode {
        AppMode::Worker if !config.worker.enabled => {
            Err(anyhow::anyhow!("worker mode is disabled in the configuration"))
        }
        AppMode::Scheduler if !config.scheduler.enabled => {
            Err(anyhow::anyhow!("scheduler mode is disabled in the configuration"))
        }
        _ => Ok(()),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install the Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install the SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Parse a `--mode` value.
pub fn parse_app_mode(mode_str: &str) -> Result<AppMode> {
    match mode_str {
        "worker" => Ok(AppMode::Worker),
        "scheduler" => Ok(AppMode::Scheduler),
        "all" => Ok(AppMode::All),
        _ => Err(anyhow::anyhow!("unsupported mode: {mode_str}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_app_mode() {
        assert_eq!(parse_app_mode("worker").unwrap(), AppMode::Worker);
        assert_eq!(parse_app_mode("scheduler").unwrap(), AppMode::Scheduler);
        assert_eq!(parse_app_mode("all").unwrap(), AppMode::All);
        assert!(parse_app_mode("dispatcher").is_err());
    }

    #[test]
    fn test_command_line_overrides() {
        let matches = Command::new("test")
            .args(common_args())
            .arg(Arg::new("worker-id").long("worker-id"))
            .get_matches_from(["test", "--worker-id", "client-7", "--log-format", "json"]);

        let startup = StartupConfig::from_matches(&matches);
        assert_eq!(startup.worker_id.as_deref(), Some("client-7"));
        assert_eq!(startup.config_path, None);

        let config = load_config(&startup).unwrap();
        assert_eq!(config.worker.worker_id, "client-7");
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_reserved_worker_id_is_rejected() {
        let startup = StartupConfig {
            worker_id: Some("scheduler".into()),
            ..Default::default()
        };
        assert!(load_config(&startup).is_err());
    }

    #[test]
    fn test_disabled_mode() {
        let mut config = AppConfig::default();
        config.scheduler.enabled = false;
        assert!(validate_mode_enabled(AppMode::Scheduler, &config).is_err());
        assert!(validate_mode_enabled(AppMode::Worker, &config).is_ok());
    }
}
