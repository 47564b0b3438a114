use std::sync::Arc;

use courier_core::models::{CommandAction, CommandTarget, JobDefinition, SchedulerMessage, WorkerCommand};
use courier_core::routing::Destination;
use courier_core::traits::{Delivery, MessageBroker, NoSession};
use courier_core::{CourierResult, Publisher, RetryPolicy, RunOutcome, TaskRunner};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::job_runner::JobRunner;
use crate::triggers::TriggerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Signal,
    Command,
}

enum LoopEnd {
    Stopped(StopReason),
    ConnectionLost,
}

/// The scheduler process.
///
/// Owns the trigger registry, accepts job registrations and run-now tasks on
/// the scheduler queue, and listens for commands on its own command queue.
/// Triggers keep firing while the broker connection is being re-established;
/// their publishes fail closed in the meantime.
pub struct SchedulerService {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<TriggerRegistry>,
    runner: TaskRunner<NoSession>,
    initial_jobs: Vec<JobDefinition>,
    reconnect_policy: RetryPolicy,
}

impl SchedulerService {
    /// `runner` executes SCHEDULER_ONLY tasks; fires go through `publisher`.
    pub fn new(broker: Arc<dyn MessageBroker>, publisher: Publisher, runner: TaskRunner<NoSession>) -> Self {
        let registry = Arc::new(TriggerRegistry::new(Arc::new(JobRunner::new(publisher))));
        Self {
            broker,
            registry,
            runner,
            initial_jobs: Vec::new(),
            reconnect_policy: RetryPolicy::default(),
        }
    }

    /// Jobs registered when the service starts.
    pub fn with_jobs(mut self, jobs: Vec<JobDefinition>) -> Self {
        self.initial_jobs = jobs;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    /// Register the startup jobs, then consume until shutdown. The trigger
    /// registry is always shut down before this returns, and tasks still
    /// running on the scheduler are awaited.
    #[instrument(skip_all, name = "scheduler")]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> CourierResult<StopReason> {
        for job in &self.initial_jobs {
            if let Err(e) = self.registry.register(job.clone()).await {
                self.registry.shutdown().await;
                return Err(e);
            }
        }
        info!(jobs = self.registry.len(), "scheduler started");

        let mut running = JoinSet::new();
        let result = self.consume_until_stopped(&mut shutdown, &mut running).await;
        let stopped = self.registry.shutdown().await;
        if !running.is_empty() {
            info!(tasks = running.len(), "waiting for running scheduler tasks");
        }
        while let Some(finished) = running.join_next().await {
            if let Err(e) = finished {
                warn!("scheduler task did not complete: {e}");
            }
        }
        info!(jobs = stopped, "scheduler stopped");
        result
    }

    async fn consume_until_stopped(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        running: &mut JoinSet<RunOutcome>,
    ) -> CourierResult<StopReason> {
        loop {
            match self.consume(shutdown, running).await {
                Ok(LoopEnd::Stopped(reason)) => return Ok(reason),
                Ok(LoopEnd::ConnectionLost) => warn!("broker connection lost, triggers keep firing"),
                Err(e) if e.is_transient() => warn!("could not subscribe: {e}"),
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = shutdown.recv() => return Ok(StopReason::Signal),
                result = self.reconnect() => result?,
            }
        }
    }

    async fn reconnect(&self) -> CourierResult<()> {
        let broker = Arc::clone(&self.broker);
        self.reconnect_policy
            .run("broker reconnect", || {
                let broker = Arc::clone(&broker);
                async move { broker.reconnect().await }
            })
            .await
            .map_err(|e| {
                error!("giving up on the broker: {e}");
                e
            })?;
        info!("broker connection re-established");
        Ok(())
    }

    async fn consume(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        running: &mut JoinSet<RunOutcome>,
    ) -> CourierResult<LoopEnd> {
        let mut commands = self
            .broker
            .subscribe(&[Destination::Commands(CommandTarget::Scheduler)], 1)
            .await?;
        let mut jobs = self.broker.subscribe(&[Destination::Scheduler], 1).await?;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => return Ok(LoopEnd::Stopped(StopReason::Signal)),

                command = commands.next() => match command {
                    Some(Ok(delivery)) => {
                        if let Some(reason) = self.handle_command(delivery).await {
                            return Ok(LoopEnd::Stopped(reason));
                        }
                    }
                    Some(Err(e)) => {
                        warn!("command subscription failed: {e}");
                        return Ok(LoopEnd::ConnectionLost);
                    }
                    None => return Ok(LoopEnd::ConnectionLost),
                },

                message = jobs.next() => match message {
                    Some(Ok(delivery)) => self.handle_message(delivery, running).await,
                    Some(Err(e)) => {
                        warn!("scheduler subscription failed: {e}");
                        return Ok(LoopEnd::ConnectionLost);
                    }
                    None => return Ok(LoopEnd::ConnectionLost),
                },

                Some(finished) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = finished {
                        warn!("scheduler task did not complete: {e}");
                    }
                }
            }
        }
    }

    async fn handle_message(&self, delivery: Delivery, running: &mut JoinSet<RunOutcome>) {
        match SchedulerMessage::decode(&delivery.body) {
            Ok(SchedulerMessage::RegisterJob { job }) => {
                let name = job.name.clone();
                if let Err(e) = self.registry.register(job).await {
                    warn!(job = %name, "job registration rejected: {e}");
                }
            }
            Ok(SchedulerMessage::RunTask { envelope }) => {
                debug!(task_id = %envelope.task_id, "running task on the scheduler");
                let runner = self.runner.clone();
                running.spawn(async move { runner.execute(envelope).await });
            }
            Err(e) => warn!("dropping undecodable scheduler message: {e}"),
        }

        if let Err(e) = delivery.ack().await {
            warn!("failed to acknowledge scheduler message: {e}");
        }
    }

    async fn handle_command(&self, delivery: Delivery) -> Option<StopReason> {
        let command = WorkerCommand::decode(&delivery.body);
        if let Err(e) = delivery.ack().await {
            warn!("failed to acknowledge command: {e}");
        }

        match command {
            Ok(WorkerCommand {
                target: CommandTarget::Scheduler,
                action,
            }) => match action {
                CommandAction::Pause => {
                    self.registry.pause();
                    None
                }
                CommandAction::Resume => {
                    self.registry.resume();
                    None
                }
                CommandAction::Shutdown => {
                    info!("shutdown command received");
                    Some(StopReason::Command)
                }
            },
            Ok(other) => {
                warn!(recipient = other.target.recipient(), "ignoring command addressed elsewhere");
                None
            }
            Err(e) => {
                warn!("ignoring malformed command: {e}");
                None
            }
        }
    }
}
