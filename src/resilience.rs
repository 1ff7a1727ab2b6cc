//! Retry with exponential backoff for transient failures.
//!
//! Every call from a replication engine into the master handler goes
//! through [`with_retry`]: each attempt is bounded by
//! [`RetryConfig::attempt_timeout`], retryable errors are retried with
//! backoff, and non-retryable errors return immediately.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> storage_replication::Result<()> {
//! use storage_replication::resilience::{with_retry, RetryConfig};
//! use tokio::sync::watch;
//!
//! let (_cancel_tx, cancel_rx) = watch::channel(false);
//! let value = with_retry("master_changes_since", &RetryConfig::testing(), &cancel_rx, || async {
//!     Ok::<_, storage_replication::ReplicationError>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Backoff settings for calls into the master.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per call, including the first one.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff. Also the delay before an engine
    /// re-arms after a call exhausted its attempts.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Long-lived links: keep trying for a long time before surfacing.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9+       300s (cap)
    /// ```
    pub fn persistent() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(60),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `canceled` flips to true.
///
/// Each attempt is bounded by `config.attempt_timeout`; a timeout counts as a
/// retryable handler error.
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    config: &RetryConfig,
    canceled: &watch::Receiver<bool>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut canceled = canceled.clone();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if *canceled.borrow() {
            return Err(ReplicationError::Canceled);
        }
        attempt += 1;

        let result = match tokio::time::timeout(config.attempt_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::handler(
                operation,
                format!("attempt timed out after {:?}", config.attempt_timeout),
            )),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                crate::metrics::record_retry(operation);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = canceled.wait_for(|c| *c) => return Err(ReplicationError::Canceled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}
