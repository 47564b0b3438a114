use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info, instrument, warn};

use crate::errors::{CourierError, CourierResult};
use crate::models::{
    JobDefinition, Payload, SchedulerMessage, TaskEnvelope, TaskRecord, TaskStatus, TaskType,
    WorkerCommand,
};
use crate::routing::{Destination, RoutingTable};
use crate::services::TaskRecordService;
use crate::traits::MessageBroker;

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Overrides the task type's default priority.
    pub priority: Option<i32>,
    /// Cancel active records with the same type and payload before creating.
    pub dedupe: bool,
}

impl PublishOptions {
    pub fn deduplicated() -> Self {
        Self {
            dedupe: true,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Creates task records and hands their envelopes to the broker.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn MessageBroker>,
    routing: Arc<RoutingTable>,
    records: TaskRecordService,
}

impl Publisher {
    pub fn new(broker: Arc<dyn MessageBroker>, routing: Arc<RoutingTable>, records: TaskRecordService) -> Self {
        Self {
            broker,
            routing,
            records,
        }
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn records(&self) -> &TaskRecordService {
        &self.records
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub async fn publish(&self, task_type: TaskType, payload: Payload) -> CourierResult<TaskRecord> {
        self.publish_with(task_type, payload, PublishOptions::default()).await
    }

    /// Same as [`Publisher::publish_with`] for a task type given by name.
    pub async fn publish_named(
        &self,
        task_type: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> CourierResult<TaskRecord> {
        let task_type: TaskType = task_type.parse()?;
        self.publish_with(task_type, payload, options).await
    }

    /// Routing is resolved before the record is created, so an unknown type or
    /// an unroutable task never leaves a record behind. The record moves to
    /// IN_QUEUE only after the broker has accepted every copy; if any publish
    /// fails it stays CREATED and the caller decides whether to try again.
    #[instrument(skip_all, fields(task_type = %task_type))]
    pub async fn publish_with(
        &self,
        task_type: TaskType,
        payload: Payload,
        options: PublishOptions,
    ) -> CourierResult<TaskRecord> {
        let destinations = self.routing.resolve(task_type)?;
        let priority = options.priority.unwrap_or_else(|| task_type.default_priority());

        let mut record = self
            .records
            .create(task_type, payload, priority, options.dedupe)
            .await?;
        let envelope = TaskEnvelope::from_record(&record);

        for destination in &destinations {
            let body = match destination {
                Destination::Scheduler => SchedulerMessage::RunTask {
                    envelope: envelope.clone(),
                }
                .encode()?,
                _ => envelope.encode()?,
            };

            if let Err(e) = self.broker.publish(destination, &body, priority).await {
                counter!("courier_publish_failures_total", "task_type" => task_type.as_str()).increment(1);
                warn!(task_id = %record.id, %destination, "publish failed, record stays CREATED: {e}");
                return Err(match e {
                    CourierError::BrokerUnavailable(_) => e,
                    other => CourierError::BrokerUnavailable(other.to_string()),
                });
            }
            debug!(task_id = %record.id, %destination, "envelope accepted by broker");
        }

        if let Err(e) = self.records.transition(&mut record, TaskStatus::InQueue).await {
            warn!(task_id = %record.id, "envelope published but IN_QUEUE was not recorded: {e}");
        }

        counter!("courier_tasks_published_total", "task_type" => task_type.as_str()).increment(1);
        info!(
            task_id = %record.id,
            copies = destinations.len(),
            priority,
            "task published"
        );
        Ok(record)
    }

    /// Send a job definition to the scheduler's registration queue.
    #[instrument(skip_all, fields(job = %job.name))]
    pub async fn publish_job(&self, job: &JobDefinition) -> CourierResult<()> {
        job.validate()?;
        let body = SchedulerMessage::RegisterJob { job: job.clone() }.encode()?;
        self.broker.publish(&Destination::Scheduler, &body, 0).await?;
        info!(task_type = %job.task_type, "job definition sent to scheduler");
        Ok(())
    }

    pub async fn send_command(&self, command: &WorkerCommand) -> CourierResult<()> {
        let destination = Destination::Commands(command.target.clone());
        self.broker
            .publish(&destination, &command.encode()?, 0)
            .await?;
        info!(action = ?command.action, recipient = command.target.recipient(), "command sent");
        Ok(())
    }
}
