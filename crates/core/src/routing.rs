//! Task type to destination routing.
//!
//! A [`RoutingTable`] is built once at startup from configuration and handed
//! to every publisher and consumer that needs it. It is never mutated
//! afterwards.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{CourierError, CourierResult};
use crate::models::{CommandTarget, TaskType};

/// Worker selection policy for a task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetWorkerType {
    SpecificWorker(String),
    AnyWorker,
    AllWorkers,
    SchedulerOnly,
}

impl TargetWorkerType {
    /// Policy applied to a task type when configuration does not pin it.
    pub fn default_for(task_type: TaskType) -> Self {
        match task_type {
            TaskType::ShutdownTask => TargetWorkerType::AllWorkers,
            t if t.is_job() => TargetWorkerType::SchedulerOnly,
            _ => TargetWorkerType::AnyWorker,
        }
    }
}

/// Exchange family a destination belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeClass {
    AnyWorker,
    SpecificWorker,
    WorkerCommands,
    Scheduler,
}

impl ExchangeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeClass::AnyWorker => "any_worker",
            ExchangeClass::SpecificWorker => "specific_worker",
            ExchangeClass::WorkerCommands => "worker_commands",
            ExchangeClass::Scheduler => "scheduler",
        }
    }
}

/// A concrete queue a message can be addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Shared queue drained by every worker that accepts shared work.
    SharedTasks,
    /// Dedicated task queue of one worker.
    WorkerTasks(String),
    /// Job registrations and run-now tasks for the scheduler.
    Scheduler,
    /// Control commands for one recipient.
    Commands(CommandTarget),
}

impl Destination {
    pub fn exchange_class(&self) -> ExchangeClass {
        match self {
            Destination::SharedTasks => ExchangeClass::AnyWorker,
            Destination::WorkerTasks(_) => ExchangeClass::SpecificWorker,
            Destination::Scheduler => ExchangeClass::Scheduler,
            Destination::Commands(_) => ExchangeClass::WorkerCommands,
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            Destination::SharedTasks => "any_worker",
            Destination::WorkerTasks(worker_id) => worker_id,
            Destination::Scheduler => "jobs",
            Destination::Commands(target) => target.recipient(),
        }
    }

    /// Queue name without the deployment prefix.
    pub fn queue_name(&self) -> String {
        match self {
            Destination::SharedTasks => "any_worker.tasks".to_string(),
            Destination::WorkerTasks(worker_id) => format!("{worker_id}.tasks"),
            Destination::Scheduler => "scheduler.jobs".to_string(),
            Destination::Commands(target) => format!("{}.commands", target.recipient()),
        }
    }

    /// Exclusive, auto-deleting queues only live as long as their consumer,
    /// so a restarted recipient never sees messages addressed to its predecessor.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Destination::Scheduler | Destination::Commands(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange_class().as_str(), self.routing_key())
    }
}

/// Immutable routing table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<TaskType, TargetWorkerType>,
    workers: BTreeSet<String>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Every task type with its default policy, `pinned` overrides applied.
    pub fn with_defaults<I, P>(workers: I, pinned: P) -> CourierResult<Self>
    where
        I: IntoIterator<Item = String>,
        P: IntoIterator<Item = (TaskType, String)>,
    {
        let mut builder = RoutingTable::builder().workers(workers);
        for task_type in TaskType::ALL {
            builder = builder.route(task_type, TargetWorkerType::default_for(task_type));
        }
        for (task_type, worker_id) in pinned {
            builder = builder.route(task_type, TargetWorkerType::SpecificWorker(worker_id));
        }
        builder.build()
    }

    pub fn target_of(&self, task_type: TaskType) -> CourierResult<&TargetWorkerType> {
        self.routes
            .get(&task_type)
            .ok_or_else(|| CourierError::UnknownTaskType(task_type.to_string()))
    }

    pub fn is_registered(&self, task_type: TaskType) -> bool {
        self.routes.contains_key(&task_type)
    }

    pub fn workers(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(String::as_str)
    }

    /// Destinations a task of `task_type` must be published to.
    pub fn resolve(&self, task_type: TaskType) -> CourierResult<Vec<Destination>> {
        match self.target_of(task_type)? {
            TargetWorkerType::AnyWorker => Ok(vec![Destination::SharedTasks]),
            TargetWorkerType::SchedulerOnly => Ok(vec![Destination::Scheduler]),
            TargetWorkerType::SpecificWorker(worker_id) => {
                if self.workers.contains(worker_id) {
                    Ok(vec![Destination::WorkerTasks(worker_id.clone())])
                } else {
                    Err(CourierError::RoutingFailure(format!(
                        "{task_type} is pinned to unregistered worker {worker_id}"
                    )))
                }
            }
            TargetWorkerType::AllWorkers => {
                if self.workers.is_empty() {
                    return Err(CourierError::RoutingFailure(format!(
                        "no live workers to broadcast {task_type} to"
                    )));
                }
                Ok(self
                    .workers
                    .iter()
                    .map(|id| Destination::WorkerTasks(id.clone()))
                    .collect())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RoutingTableBuilder {
    routes: HashMap<TaskType, TargetWorkerType>,
    workers: BTreeSet<String>,
}

impl RoutingTableBuilder {
    pub fn route(mut self, task_type: TaskType, target: TargetWorkerType) -> Self {
        self.routes.insert(task_type, target);
        self
    }

    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.workers.insert(worker_id.into());
        self
    }

    pub fn workers<I: IntoIterator<Item = String>>(mut self, workers: I) -> Self {
        self.workers.extend(workers);
        self
    }

    pub fn build(self) -> CourierResult<RoutingTable> {
        for worker_id in &self.workers {
            if worker_id.trim().is_empty() {
                return Err(CourierError::Configuration("empty worker identity".into()));
            }
        }
        for (task_type, target) in &self.routes {
            match target {
                TargetWorkerType::SchedulerOnly if !task_type.is_job() => {
                    return Err(CourierError::Configuration(format!(
                        "{task_type} cannot be routed to the scheduler"
                    )));
                }
                TargetWorkerType::SpecificWorker(id) if id.trim().is_empty() => {
                    return Err(CourierError::Configuration(format!(
                        "{task_type} is pinned to an empty worker identity"
                    )));
                }
                _ => {}
            }
        }
        Ok(RoutingTable {
            routes: self.routes,
            workers: self.workers,
        })
    }
}
