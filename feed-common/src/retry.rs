//! Retry policy shared by every I/O call site.
//!
//! Both the remote fetch client and the persistence gateway go through
//! [`RetryPolicy::run`], so retry counts, backoff and the retryable-error
//! predicate are decided in exactly one place.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ErrorClassification;

/// Exponential backoff with a bounded number of attempts.
///
/// Only errors whose [`ErrorClassification::is_transient`] returns true are
/// retried. The delay before attempt `n + 1` is the larger of the computed
/// backoff and the error's own suggestion, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (1 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Backoff growth factor between retries
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and initial delay
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            ..Default::default()
        }
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff delay before retry number `retry` (0-based), without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts` failed ones
    pub fn should_retry<E: ErrorClassification>(&self, err: &E, attempts: u32) -> bool {
        err.is_transient() && attempts < self.max_attempts
    }

    /// Run `operation` until it succeeds, fails permanently, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        E: ErrorClassification + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempts += 1;

                    if !self.should_retry(&err, attempts) {
                        return Err(err);
                    }

                    let delay = self
                        .backoff(attempts - 1)
                        .max(err.suggested_retry_delay().unwrap_or_default())
                        .min(self.max_delay);

                    warn!(
                        operation = label,
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying: {}",
                        err
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
