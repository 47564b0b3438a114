use async_trait::async_trait;
use courier_core::models::JobDefinition;
use courier_core::{PublishOptions, Publisher};
use metrics::counter;
use tracing::{info, warn};

use crate::triggers::FireHandler;

/// Turns each trigger fire into a fresh task through the regular publisher.
///
/// A fire that cannot be published is logged and dropped. It is not buffered
/// for later, so a broker outage never turns into a burst of duplicates.
#[derive(Clone)]
pub struct JobRunner {
    publisher: Publisher,
}

impl JobRunner {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl FireHandler for JobRunner {
    async fn fire(&self, job: &JobDefinition) {
        let options = PublishOptions {
            priority: job.priority,
            dedupe: false,
        };
        match self
            .publisher
            .publish_with(job.task_type, job.payload_template.clone(), options)
            .await
        {
            Ok(record) => {
                counter!("courier_job_fires_total", "job" => job.name.clone()).increment(1);
                info!(job = %job.name, task_id = %record.id, "job fired");
            }
            Err(e) => {
                counter!("courier_job_fires_dropped_total", "job" => job.name.clone()).increment(1);
                warn!(job = %job.name, error_class = e.error_tag(), "job fire dropped: {e}");
            }
        }
    }
}
