use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{CourierError, CourierResult};

/// Bounded exponential backoff.
///
/// Used by task bodies around calls into the external session and by
/// consumers when the broker connection has to be re-established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let exponential = base * self.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay_ms as f64);

        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let millis = (capped + jitter).clamp(base.min(capped), self.max_delay_ms as f64);

        Duration::from_millis(millis as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or `max_attempts` is exhausted. A `retry_after` hint from the callee
    /// takes precedence over the computed backoff.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> CourierResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CourierResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = match &e {
                        CourierError::TransientExternal {
                            retry_after: Some(retry_after),
                            ..
                        } => *retry_after,
                        _ => self.delay_for(attempt),
                    };
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(operation = operation_name, attempt = attempt + 1, "giving up: {e}");
                    return Err(e);
                }
            }
        }
    }
}
