//! Retry with exponential backoff
//!
//! Pollers use this when obtaining an iterator, both at start-up and after a
//! failed fetch. A start-up failure after the last attempt fails `begin()`;
//! a mid-run failure ends the poller with a critical fault.
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: after base_delay
//! attempt 3: after base_delay * factor
//! ...        capped at max_delay
//! ```
//!
//! Every [`StreamError`] is retried except a missing stream or partition.

use shardline_core::StreamError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently to repeat a failed iterator request.
///
/// ```text
/// delay(n) = min(base_delay * factor^n, max_delay)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: usize,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub factor: f64,
}

impl Default for RetryPolicy {
    /// 5 retries, 100ms doubling up to 10s.
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100), Duration::from_secs(10), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(retries: usize, base_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            retries,
            base_delay,
            max_delay,
            factor,
        }
    }

    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `n` (0-indexed).
    pub fn delay(&self, n: usize) -> Duration {
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(n as i32);
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// A missing stream or partition will not appear by asking again.
    pub fn should_retry(&self, error: &StreamError) -> bool {
        !matches!(
            error,
            StreamError::StreamNotFound(_) | StreamError::PartitionNotFound { .. }
        )
    }
}

/// Call `request` until it succeeds, fails permanently, or the policy runs out.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut request: F) -> Result<T, StreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
{
    let mut failures = 0;
    loop {
        let error = match request().await {
            Ok(value) => {
                if failures > 0 {
                    debug!(failures, "Stream request recovered");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !policy.should_retry(&error) || failures >= policy.retries {
            warn!(attempts = failures + 1, error = %error, "Stream request failed");
            return Err(error);
        }

        let delay = policy.delay(failures);
        debug!(
            attempt = failures + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Stream request failed, retrying"
        );
        sleep(delay).await;
        failures += 1;
    }
}
