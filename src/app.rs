use std::sync::Arc;

use anyhow::{Context, Result};
use courier_core::config::AppConfig;
use courier_core::traits::{MessageBroker, NoSession, TaskRecordStore};
use courier_core::{Publisher, TaskRecordService, TaskRunner};
use courier_dispatcher::SchedulerService;
use courier_infrastructure::{connect_broker, open_task_store};
use courier_worker::WorkerConsumer;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::bodies::{scheduler_bodies, worker_bodies, LoggingSession};

/// Which components this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Worker,
    Scheduler,
    /// Worker and scheduler in one process.
    All,
}

/// Wires configuration, store, broker and publisher into the requested
/// components.
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    broker: Arc<dyn MessageBroker>,
    publisher: Publisher,
}

impl Application {
    /// Connect to the store and the broker. Failing here fails startup.
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!(?mode, "initialising application");

        let store = open_task_store(&config.database)
            .await
            .context("failed to open the task record store")?;
        let broker = connect_broker(&config.broker)
            .await
            .context("failed to connect to the broker")?;

        Self::with_components(config, mode, store, broker)
    }

    /// Build on top of an existing store and broker.
    pub fn with_components(
        config: AppConfig,
        mode: AppMode,
        store: Arc<dyn TaskRecordStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Result<Self> {
        let routing = config
            .routing
            .to_routing_table()
            .context("invalid routing configuration")?;
        let publisher = Publisher::new(
            Arc::clone(&broker),
            Arc::new(routing),
            TaskRecordService::new(store),
        );

        Ok(Self {
            config,
            mode,
            broker,
            publisher,
        })
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Run until shutdown is signalled or every component stopped on its own.
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(mode = ?self.mode, "starting application");

        match self.mode {
            AppMode::Worker => self.run_worker(shutdown_rx).await?,
            AppMode::Scheduler => self.run_scheduler(shutdown_rx).await?,
            AppMode::All => {
                let (worker, scheduler) = tokio::join!(
                    self.run_worker(shutdown_rx.resubscribe()),
                    self.run_scheduler(shutdown_rx)
                );
                worker?;
                scheduler?;
            }
        }

        if let Err(e) = self.broker.close().await {
            warn!("failed to close the broker connection: {e}");
        }
        Ok(())
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let worker = &self.config.worker;
        info!(worker_id = %worker.worker_id, "starting worker");

        let session = LoggingSession::new(worker.session_name.clone());
        let runner = TaskRunner::new(
            self.publisher.records().clone(),
            Arc::new(worker_bodies()?),
            Arc::new(session),
        )
        .with_publisher(self.publisher.clone());

        let consumer = WorkerConsumer::builder(worker.worker_id.clone(), Arc::clone(&self.broker), runner)
            .accepts_shared_work(worker.accepts_shared_work)
            .reconnect_policy(self.config.broker.reconnect_policy())
            .build()?;

        let reason = consumer.run(shutdown_rx).await?;
        info!(worker_id = %worker.worker_id, ?reason, "worker stopped");
        Ok(())
    }

    async fn run_scheduler(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(jobs = self.config.scheduler.jobs.len(), "starting scheduler");

        let runner = TaskRunner::new(
            self.publisher.records().clone(),
            Arc::new(scheduler_bodies()?),
            Arc::new(NoSession),
        )
        .with_publisher(self.publisher.clone());

        let scheduler = SchedulerService::new(Arc::clone(&self.broker), self.publisher.clone(), runner)
            .with_jobs(self.config.scheduler.jobs.clone())
            .with_reconnect_policy(self.config.broker.reconnect_policy());

        let reason = scheduler.run(shutdown_rx).await?;
        info!(?reason, "scheduler stopped");
        Ok(())
    }
}
