//! Circuit breakers around master handler calls.
//!
//! A master that keeps failing should not be hammered by both engines at
//! full retry rate. Calls go through a [`MasterCircuit`], which keeps a
//! breaker for pulls (`master_changes_since`, attachment fetches) and one for
//! pushes (`master_write`) so a broken write path does not stop the fork
//! from receiving changes.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Master unhealthy, calls fail fast with a retryable
//!   [`ReplicationError::Handler`]
//! - **HalfOpen**: Probing whether the master recovered
//!
//! Only retryable errors count as failures. A schema violation says nothing
//! about master health and passes through without tripping the breaker.

use crate::error::{ReplicationError, Result};
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips fast, recovers cautiously. Used for pushes.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one master call through the breaker.
    ///
    /// Rejections become a retryable handler error naming `operation`.
    pub async fn call<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        // Non-retryable errors are smuggled past the breaker so they do not
        // count against master health.
        let outcome = self
            .inner
            .call(async {
                match f().await {
                    Ok(value) => Ok(Ok(value)),
                    Err(e) if e.is_retryable() => Err(e),
                    Err(e) => Ok(Err(e)),
                }
            })
            .await;

        match outcome {
            Ok(Ok(value)) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, operation = %operation, "Circuit open, master call rejected");
                crate::metrics::record_circuit_rejection(&self.name);
                Err(ReplicationError::handler(operation, format!("circuit {} open", self.name)))
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, operation = %operation, error = %e, "Master call failed");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Retryable failures seen by the breaker.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Breakers for one replication link's master calls.
pub struct MasterCircuit {
    /// `master_changes_since`, `master_attachment_data`
    pub pulls: CircuitBreaker,
    /// `master_write`
    pub pushes: CircuitBreaker,
}

impl MasterCircuit {
    pub fn new(identifier: &str, config: CircuitConfig) -> Self {
        Self {
            pulls: CircuitBreaker::new(format!("{}_master_pulls", identifier), config.clone()),
            pushes: CircuitBreaker::new(format!("{}_master_pushes", identifier), config),
        }
    }

    pub fn metrics(&self) -> MasterCircuitMetrics {
        MasterCircuitMetrics {
            pulls_total: self.pulls.calls_total(),
            pulls_failures: self.pulls.failures(),
            pulls_rejections: self.pulls.rejections(),
            pushes_total: self.pushes.calls_total(),
            pushes_failures: self.pushes.failures(),
            pushes_rejections: self.pushes.rejections(),
        }
    }
}

/// Counter snapshot of a [`MasterCircuit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterCircuitMetrics {
    pub pulls_total: u64,
    pub pulls_failures: u64,
    pub pulls_rejections: u64,
    pub pushes_total: u64,
    pub pushes_failures: u64,
    pub pushes_rejections: u64,
}
