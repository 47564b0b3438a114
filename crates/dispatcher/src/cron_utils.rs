use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::debug;

use courier_core::{CourierError, CourierResult};

/// Parsed calendar recurrence (`sec min hour day month weekday [year]`).
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> CourierResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| CourierError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
        })
    }

    /// First fire strictly after `from`.
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// How long to sleep from `now` until the next fire. `None` when the
    /// schedule has no further occurrences.
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let next = self.next_execution_time(now)?;
        debug!(
            expression = %self.expression,
            next = %next.format("%Y-%m-%d %H:%M:%S UTC"),
            "next cron fire"
        );
        Some((next - now).to_std().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cron_scheduler_creation() {
        assert!(CronScheduler::new("0 0 0 * * *").is_ok());
        assert!(CronScheduler::new("0 0 9-17 * * 1-5").is_ok());
        assert!(CronScheduler::new("0 0 0 32 * *").is_err());
        assert!(CronScheduler::new("").is_err());
        assert!(matches!(
            CronScheduler::new("invalid"),
            Err(CourierError::InvalidCron { expr, .. }) if expr == "invalid"
        ));
    }

    #[test]
    fn test_next_execution_time() {
        let scheduler = CronScheduler::new("0 0 0 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let next = scheduler.next_execution_time(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_time_until_next_execution() {
        let scheduler = CronScheduler::new("0 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 45).unwrap();
        assert_eq!(
            scheduler.time_until_next_execution(now),
            Some(std::time::Duration::from_secs(15))
        );
    }
}
