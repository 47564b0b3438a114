//! In-process trigger engine.
//!
//! Every registered job gets its own tokio task that sleeps until the next
//! fire and then hands the job to a [`FireHandler`]. Triggers run on the
//! same runtime as the scheduler's message handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::models::{JobDefinition, Trigger};
use courier_core::{CourierError, CourierResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cron_utils::CronScheduler;

/// Receives every fire of every registered job.
#[async_trait]
pub trait FireHandler: Send + Sync {
    async fn fire(&self, job: &JobDefinition);
}

enum FirePlan {
    Interval(Interval),
    Cron(CronScheduler),
    Once(Option<DateTime<Utc>>),
}

impl FirePlan {
    fn for_trigger(trigger: &Trigger) -> CourierResult<Self> {
        match trigger {
            Trigger::Interval { seconds } => {
                let period = Duration::from_secs(*seconds);
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Ok(FirePlan::Interval(interval))
            }
            Trigger::Cron { expression } => Ok(FirePlan::Cron(CronScheduler::new(expression)?)),
            Trigger::Date { run_at } => Ok(FirePlan::Once(Some(*run_at))),
        }
    }

    /// Wait for the next fire. `false` once the plan has no fires left.
    async fn wait(&mut self) -> bool {
        match self {
            FirePlan::Interval(interval) => {
                interval.tick().await;
                true
            }
            FirePlan::Cron(cron) => match cron.time_until_next_execution(Utc::now()) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    true
                }
                None => false,
            },
            FirePlan::Once(run_at) => match run_at.take() {
                Some(run_at) => {
                    // A date in the past fires right away.
                    let delay = (run_at - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(delay).await;
                    true
                }
                None => false,
            },
        }
    }
}

struct RegisteredJob {
    job: JobDefinition,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RegisteredJob {
    async fn stop(self) {
        let name = self.job.name;
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(job = %name, "trigger task ended abnormally: {e}");
        }
    }
}

/// Named jobs and their running triggers.
pub struct TriggerRegistry {
    handler: Arc<dyn FireHandler>,
    jobs: Mutex<HashMap<String, RegisteredJob>>,
    closed: AtomicBool,
    paused: Arc<AtomicBool>,
}

impl TriggerRegistry {
    pub fn new(handler: Arc<dyn FireHandler>) -> Self {
        Self {
            handler,
            jobs: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start firing `job`. A job already registered under the same name is
    /// stopped and replaced.
    pub async fn register(&self, job: JobDefinition) -> CourierResult<()> {
        if self.is_closed() {
            return Err(CourierError::SchedulerClosed(job.name));
        }
        job.validate()?;
        let plan = FirePlan::for_trigger(&job.trigger)?;

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_trigger(
            job.clone(),
            plan,
            Arc::clone(&self.handler),
            Arc::clone(&self.paused),
            stop_rx,
        ));
        let registered = RegisteredJob {
            job: job.clone(),
            stop,
            task,
        };

        let inserted = {
            let mut jobs = self.lock_jobs();
            // Shutdown may have drained the map while the task was spawned.
            if self.is_closed() {
                Err(registered)
            } else {
                Ok(jobs.insert(job.name.clone(), registered))
            }
        };
        let replaced = match inserted {
            Ok(replaced) => replaced,
            Err(registered) => {
                registered.stop().await;
                return Err(CourierError::SchedulerClosed(job.name));
            }
        };

        if let Some(previous) = replaced {
            info!(job = %job.name, "replacing existing job");
            previous.stop().await;
        }
        info!(job = %job.name, task_type = %job.task_type, trigger = ?job.trigger, "job registered");
        Ok(())
    }

    /// Stop and forget a job. Returns whether it existed.
    pub async fn deregister(&self, name: &str) -> bool {
        let removed = self.lock_jobs().remove(name);
        match removed {
            Some(job) => {
                job.stop().await;
                info!(job = name, "job deregistered");
                true
            }
            None => false,
        }
    }

    /// Stop accepting registrations and stop every trigger. Fires already in
    /// progress are allowed to finish. Returns the number of jobs stopped.
    pub async fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let jobs: Vec<RegisteredJob> = self.lock_jobs().drain().map(|(_, job)| job).collect();
        let count = jobs.len();
        for job in jobs {
            job.stop().await;
        }
        info!(jobs = count, "trigger registry shut down");
        count
    }

    /// Paused triggers keep their schedule but skip their fires.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("triggers paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("triggers resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_jobs().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<JobDefinition> {
        self.lock_jobs().get(name).map(|registered| registered.job.clone())
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_jobs().is_empty()
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegisteredJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_trigger(
    job: JobDefinition,
    mut plan: FirePlan,
    handler: Arc<dyn FireHandler>,
    paused: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            more = plan.wait() => {
                if !more {
                    debug!(job = %job.name, "trigger has no further fires");
                    break;
                }
            }
        }

        if paused.load(Ordering::SeqCst) {
            debug!(job = %job.name, "fire skipped while paused");
            continue;
        }
        handler.fire(&job).await;
    }
}
