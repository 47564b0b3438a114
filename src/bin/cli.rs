use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use courier_core::config::AppConfig;
use courier_core::models::{CommandAction, CommandTarget, JobDefinition, Payload, Trigger, WorkerCommand};
use courier_core::{PublishOptions, Publisher, TaskRecordService, TaskType};
use courier_infrastructure::{connect_broker, open_task_store};
use uuid::Uuid;

/// Administrative command line for a courier deployment.
#[derive(Parser, Debug)]
#[command(name = "courier-cli")]
#[command(version)]
#[command(about = "Publish tasks, register jobs and control workers")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish a task
    Publish {
        /// Task type, e.g. index_channel_task
        task_type: TaskType,
        /// Payload as a JSON object
        #[arg(short, long, default_value = "{}")]
        payload: String,
        /// Override the task type's default priority
        #[arg(long)]
        priority: Option<i32>,
        /// Cancel active tasks with the same type and payload first
        #[arg(long)]
        dedupe: bool,
    },
    /// Register a recurring job with the scheduler
    RegisterJob {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        task_type: TaskType,
        /// Fire every N seconds
        #[arg(long, conflicts_with_all = ["cron", "at"])]
        interval: Option<u64>,
        /// Cron expression with seconds, e.g. "0 0 * * * *"
        #[arg(long, conflicts_with = "at")]
        cron: Option<String>,
        /// Fire once at an RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,
        #[arg(short, long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Send a control command
    Command {
        action: Action,
        /// Worker id, or `scheduler`
        recipient: String,
    },
    /// Show a task record
    Status { task_id: Uuid },
    /// Cancel every active task of a type
    CancelActive { task_type: TaskType },
    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Action {
    Pause,
    Resume,
    Shutdown,
}

impl From<Action> for CommandAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Pause => CommandAction::Pause,
            Action::Resume => CommandAction::Resume,
            Action::Shutdown => CommandAction::Shutdown,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = CliApp::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let publisher = connect(&config).await?;
    let result = run(cli.command, &publisher).await;
    if let Err(e) = publisher.broker().close().await {
        eprintln!("failed to close the broker connection: {e}");
    }
    result
}

async fn connect(config: &AppConfig) -> Result<Publisher> {
    let store = open_task_store(&config.database)
        .await
        .context("failed to open the task record store")?;
    let broker = connect_broker(&config.broker)
        .await
        .context("failed to connect to the broker")?;
    let routing = config.routing.to_routing_table()?;
    Ok(Publisher::new(broker, Arc::new(routing), TaskRecordService::new(store)))
}

async fn run(command: Commands, publisher: &Publisher) -> Result<()> {
    match command {
        Commands::Publish {
            task_type,
            payload,
            priority,
            dedupe,
        } => {
            let options = PublishOptions { priority, dedupe };
            let record = publisher
                .publish_with(task_type, parse_payload(&payload)?, options)
                .await
                .with_context(|| format!("failed to publish {task_type}"))?;
            println!("published {} ({})", record.id, record.status);
        }
        Commands::RegisterJob {
            name,
            task_type,
            interval,
            cron,
            at,
            payload,
            priority,
        } => {
            let trigger = match (interval, cron, at) {
                (Some(seconds), None, None) => Trigger::Interval { seconds },
                (None, Some(expression), None) => Trigger::Cron { expression },
                (None, None, Some(at)) => Trigger::Date {
                    run_at: at
                        .parse::<DateTime<Utc>>()
                        .with_context(|| format!("invalid timestamp {at}"))?,
                },
                _ => anyhow::bail!("exactly one of --interval, --cron or --at is required"),
            };
            let mut job = JobDefinition::new(name, task_type, trigger).with_payload(parse_payload(&payload)?);
            job.priority = priority;
            publisher.publish_job(&job).await?;
            println!("job {} sent to the scheduler", job.name);
        }
        Commands::Command { action, recipient } => {
            let target = match recipient.as_str() {
                "scheduler" => CommandTarget::Scheduler,
                worker => CommandTarget::Worker(worker.to_string()),
            };
            publisher
                .send_command(&WorkerCommand::new(action.into(), target))
                .await?;
            println!("{action:?} sent to {recipient}");
        }
        Commands::Status { task_id } => {
            let record = publisher.records().get(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::CancelActive { task_type } => {
            let canceled = publisher.records().cancel_active(task_type).await?;
            println!("canceled {canceled} active {task_type} task(s)");
        }
        Commands::Config => {}
    }
    Ok(())
}

fn parse_payload(raw: &str) -> Result<Payload> {
    serde_json::from_str(raw).with_context(|| format!("payload must be a JSON object: {raw}"))
}
