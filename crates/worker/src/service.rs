use std::sync::Arc;

use courier_core::models::{CommandAction, CommandTarget, WorkerCommand};
use courier_core::routing::Destination;
use courier_core::traits::{Delivery, ExternalSession, MessageBroker};
use courier_core::{CourierError, CourierResult, RetryPolicy, RunOutcome, TaskRunner};
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Why a consumer loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The process-wide shutdown signal fired.
    Signal,
    /// A `shutdown` command arrived on the command queue.
    Command,
    /// A `shutdown_task` was executed.
    ShutdownTask,
}

enum LoopEnd {
    Stopped(StopReason),
    ConnectionLost,
}

pub struct WorkerConsumerBuilder<S: ExternalSession> {
    worker_id: String,
    broker: Arc<dyn MessageBroker>,
    runner: TaskRunner<S>,
    accepts_shared_work: bool,
    reconnect_policy: RetryPolicy,
}

impl<S: ExternalSession> WorkerConsumerBuilder<S> {
    pub fn new(worker_id: impl Into<String>, broker: Arc<dyn MessageBroker>, runner: TaskRunner<S>) -> Self {
        Self {
            worker_id: worker_id.into(),
            broker,
            runner,
            accepts_shared_work: true,
            reconnect_policy: RetryPolicy::default(),
        }
    }

    /// Also drain the shared any-worker queue.
    pub fn accepts_shared_work(mut self, accepts_shared_work: bool) -> Self {
        self.accepts_shared_work = accepts_shared_work;
        self
    }

    pub fn reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn build(self) -> CourierResult<WorkerConsumer<S>> {
        let worker_id = self.worker_id.trim().to_string();
        if worker_id.is_empty() {
            return Err(CourierError::Configuration("worker id must not be empty".into()));
        }
        if worker_id == CommandTarget::Scheduler.recipient() {
            return Err(CourierError::Configuration(format!(
                "`{worker_id}` is reserved for the scheduler"
            )));
        }

        info!(
            worker_id = %worker_id,
            session = self.runner.session().session_name(),
            shared = self.accepts_shared_work,
            "worker consumer configured"
        );
        Ok(WorkerConsumer {
            worker_id,
            broker: self.broker,
            runner: self.runner,
            accepts_shared_work: self.accepts_shared_work,
            reconnect_policy: self.reconnect_policy,
        })
    }
}

/// Consumer loop of one worker process.
///
/// Holds two subscriptions: the worker's command queue and its task queues.
/// Tasks are executed one at a time to completion on the loop itself, so the
/// bound session is never used by two tasks at once. Commands are looked at
/// between tasks.
pub struct WorkerConsumer<S: ExternalSession> {
    worker_id: String,
    broker: Arc<dyn MessageBroker>,
    runner: TaskRunner<S>,
    accepts_shared_work: bool,
    reconnect_policy: RetryPolicy,
}

impl<S: ExternalSession> WorkerConsumer<S> {
    pub fn builder(
        worker_id: impl Into<String>,
        broker: Arc<dyn MessageBroker>,
        runner: TaskRunner<S>,
    ) -> WorkerConsumerBuilder<S> {
        WorkerConsumerBuilder::new(worker_id, broker, runner)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Dedicated queue first, then the shared queue when enabled.
    pub fn task_destinations(&self) -> Vec<Destination> {
        let mut destinations = vec![Destination::WorkerTasks(self.worker_id.clone())];
        if self.accepts_shared_work {
            destinations.push(Destination::SharedTasks);
        }
        destinations
    }

    pub fn command_destination(&self) -> Destination {
        Destination::Commands(CommandTarget::Worker(self.worker_id.clone()))
    }

    /// Run until shutdown. Lost connections are re-established with bounded
    /// backoff; when that is exhausted the error is returned and the process
    /// is expected to exit.
    #[instrument(skip_all, fields(worker_id = %self.worker_id))]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> CourierResult<StopReason> {
        let mut paused = false;
        loop {
            match self.consume(&mut shutdown, &mut paused).await {
                Ok(LoopEnd::Stopped(reason)) => {
                    info!(?reason, "worker consumer stopped");
                    return Ok(reason);
                }
                Ok(LoopEnd::ConnectionLost) => warn!("broker connection lost"),
                Err(e) if e.is_transient() => warn!("could not subscribe: {e}"),
                Err(e) => return Err(e),
            }

            counter!("courier_worker_reconnects_total").increment(1);
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("shutdown signal received while reconnecting");
                    return Ok(StopReason::Signal);
                }
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
        paused: &mut bool,
    ) -> CourierResult<LoopEnd> {
        let mut commands = self.broker.subscribe(&[self.command_destination()], 1).await?;
        let mut tasks = self.broker.subscribe(&self.task_destinations(), 1).await?;
        info!(paused = *paused, "consuming tasks");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => return Ok(LoopEnd::Stopped(StopReason::Signal)),

                command = commands.next() => match command {
                    Some(Ok(delivery)) => {
                        if let Some(reason) = self.handle_command(delivery, paused).await {
                            return Ok(LoopEnd::Stopped(reason));
                        }
                    }
                    Some(Err(e)) => {
                        warn!("command subscription failed: {e}");
                        return Ok(LoopEnd::ConnectionLost);
                    }
                    None => return Ok(LoopEnd::ConnectionLost),
                },

                task = tasks.next(), if !*paused => match task {
                    Some(Ok(delivery)) => {
                        debug!(source = %delivery.source, redelivered = delivery.redelivered, "task received");
                        if self.runner.run(delivery).await == RunOutcome::Shutdown {
                            return Ok(LoopEnd::Stopped(StopReason::ShutdownTask));
                        }
                    }
                    Some(Err(e)) => {
                        warn!("task subscription failed: {e}");
                        return Ok(LoopEnd::ConnectionLost);
                    }
                    None => return Ok(LoopEnd::ConnectionLost),
                },
            }
        }
    }

    async fn handle_command(&self, delivery: Delivery, paused: &mut bool) -> Option<StopReason> {
        let command = WorkerCommand::decode(&delivery.body);
        if let Err(e) = delivery.ack().await {
            warn!("failed to acknowledge command: {e}");
        }

        let command = match command {
            Ok(command) => command,
            Err(e) => {
                warn!("ignoring malformed command: {e}");
                return None;
            }
        };
        if command.target.recipient() != self.worker_id {
            warn!(recipient = command.target.recipient(), "ignoring command addressed elsewhere");
            return None;
        }

        match command.action {
            CommandAction::Pause => {
                *paused = true;
                info!("paused, no new tasks will be taken");
                None
            }
            CommandAction::Resume => {
                *paused = false;
                info!("resumed");
                None
            }
            CommandAction::Shutdown => {
                info!("shutdown command received");
                Some(StopReason::Command)
            }
        }
    }
}
