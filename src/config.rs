//! Configuration for one replication link.
//!
//! [`ReplicationConfig`] holds everything that can be written down in a
//! config file. The live collaborators (fork store, meta store, master
//! handler, conflict handler, hash function, debounce hook) are supplied
//! next to it in a [`ReplicationInput`](crate::coordinator::ReplicationInput).
//!
//! # Quick Start
//!
//! ```rust
//! use storage_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     identifier: "todos-to-server".into(),
//!     pull_batch_size: 50,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── identifier: String            # Namespace of this link's meta records
//! ├── pull_batch_size: usize        # Master changes per downstream fetch
//! ├── push_batch_size: usize        # Fork documents per master write
//! ├── downstream: DownstreamConfig
//! │   └── poll_interval             # Idle poll when the master has no live stream
//! ├── retry: RetrySettings          # Backoff for master calls
//! ├── circuit: CircuitSettings      # Breakers around master calls
//! └── initial_checkpoint            # Where to start when no checkpoint is stored
//!     ├── up
//!     └── down
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! identifier: "todos-to-server"
//! pull_batch_size: 100
//! push_batch_size: 50
//! downstream:
//!   poll_interval: "30s"
//! retry:
//!   max_attempts: 8
//!   initial_delay: "200ms"
//!   max_delay: "1m"
//! initial_checkpoint:
//!   down: { sequence: 1200 }
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{ReplicationError, Result};
use crate::meta::META_ID_SEPARATOR;
use crate::resilience::RetryConfig;
use crate::store::Checkpoint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializable settings of one fork/master replication link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Unique name of the link. Meta records live under this namespace, so
    /// reusing an identifier resumes from its checkpoints.
    pub identifier: String,

    /// Maximum master changes fetched per downstream batch.
    #[serde(default = "default_batch_size")]
    pub pull_batch_size: usize,

    /// Maximum fork documents sent per master write.
    #[serde(default = "default_batch_size")]
    pub push_batch_size: usize,

    #[serde(default)]
    pub downstream: DownstreamConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub circuit: CircuitSettings,

    /// Checkpoints to persist when the meta store holds none yet.
    #[serde(default)]
    pub initial_checkpoint: InitialCheckpoint,
}

fn default_batch_size() -> usize {
    100
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            identifier: "replication".to_string(),
            pull_batch_size: 100,
            push_batch_size: 100,
            downstream: DownstreamConfig::default(),
            retry: RetrySettings::default(),
            circuit: CircuitSettings::default(),
            initial_checkpoint: InitialCheckpoint::default(),
        }
    }
}

impl ReplicationConfig {
    /// Defaults under the given identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    /// Config with fast retries and a short poll, for tests.
    pub fn for_testing(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            pull_batch_size: 100,
            push_batch_size: 100,
            downstream: DownstreamConfig {
                poll_interval: Some("50ms".to_string()),
            },
            retry: RetrySettings {
                max_attempts: 3,
                initial_delay: "5ms".to_string(),
                max_delay: "50ms".to_string(),
                backoff_factor: 2.0,
                attempt_timeout: "5s".to_string(),
            },
            circuit: CircuitSettings {
                failure_threshold: 20,
                success_threshold: 1,
                recovery_timeout: "50ms".to_string(),
            },
            initial_checkpoint: InitialCheckpoint::default(),
        }
    }

    /// Reject configurations the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(ReplicationError::Config("identifier must not be empty".to_string()));
        }
        if self.identifier.contains(META_ID_SEPARATOR) {
            return Err(ReplicationError::Config(format!(
                "identifier {:?} must not contain '{}'",
                self.identifier, META_ID_SEPARATOR
            )));
        }
        if self.pull_batch_size == 0 || self.push_batch_size == 0 {
            return Err(ReplicationError::Config("batch sizes must be at least 1".to_string()));
        }
        if let Some(interval) = &self.downstream.poll_interval {
            parse_duration("downstream.poll_interval", interval)?;
        }
        parse_duration("retry.initial_delay", &self.retry.initial_delay)?;
        parse_duration("retry.max_delay", &self.retry.max_delay)?;
        parse_duration("retry.attempt_timeout", &self.retry.attempt_timeout)?;
        parse_duration("circuit.recovery_timeout", &self.circuit.recovery_timeout)?;
        if !(self.retry.backoff_factor >= 1.0) {
            return Err(ReplicationError::Config("retry.backoff_factor must be >= 1.0".to_string()));
        }
        Ok(())
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{}: invalid duration {:?}: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// DownstreamConfig: master → fork
// ═══════════════════════════════════════════════════════════════════════════════

/// Downstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Idle poll interval as a duration string (e.g. "10s"). `None`
    /// disables polling; the engine then relies on the master's live
    /// stream and explicit resyncs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Option<String>,
}

fn default_poll_interval() -> Option<String> {
    Some("10s".to_string())
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

impl DownstreamConfig {
    /// Parsed poll interval. Unparseable values fall back to 10 seconds.
    pub fn poll_interval_duration(&self) -> Option<Duration> {
        self.poll_interval
            .as_deref()
            .map(|s| humantime::parse_duration(s).unwrap_or(Duration::from_secs(10)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: backoff for master calls
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializable form of [`RetryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Timeout for a single master call.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: String,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_delay() -> String {
    "100ms".to_string()
}

fn default_max_delay() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_attempt_timeout() -> String {
    "30s".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            attempt_timeout: default_attempt_timeout(),
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: humantime::parse_duration(&self.initial_delay).unwrap_or(defaults.initial_delay),
            max_delay: humantime::parse_duration(&self.max_delay).unwrap_or(defaults.max_delay),
            backoff_factor: self.backoff_factor,
            attempt_timeout: humantime::parse_duration(&self.attempt_timeout).unwrap_or(defaults.attempt_timeout),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitSettings: breakers around master calls
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializable form of [`CircuitConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(1),
            success_threshold: self.success_threshold.max(1),
            recovery_timeout: humantime::parse_duration(&self.recovery_timeout).unwrap_or(Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InitialCheckpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// Starting checkpoints, used only when none is stored for a direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialCheckpoint {
    #[serde(default)]
    pub up: Option<Checkpoint>,
    #[serde(default)]
    pub down: Option<Checkpoint>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.pull_batch_size, 100);
        assert_eq!(config.push_batch_size, 100);
        assert_eq!(config.downstream.poll_interval_duration(), Some(Duration::from_secs(10)));
        assert!(config.initial_checkpoint.up.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: ReplicationConfig = serde_json::from_str(r#"{"identifier": "a"}"#).unwrap();
        assert_eq!(config.identifier, "a");
        assert_eq!(config.pull_batch_size, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.downstream.poll_interval.as_deref(), Some("10s"));
    }

    #[test]
    fn test_null_poll_interval_disables_polling() {
        let config: ReplicationConfig =
            serde_json::from_str(r#"{"identifier": "a", "downstream": {"poll_interval": null}}"#).unwrap();
        assert!(config.downstream.poll_interval_duration().is_none());
    }

    #[test]
    fn test_initial_checkpoint_deserializes() {
        let config: ReplicationConfig = serde_json::from_str(
            r#"{"identifier": "a", "initial_checkpoint": {"down": {"sequence": 12}}}"#,
        )
        .unwrap();
        assert_eq!(config.initial_checkpoint.down, Some(Checkpoint::sequence(12)));
        assert!(config.initial_checkpoint.up.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_identifiers() {
        let mut config = ReplicationConfig::for_testing("");
        assert!(matches!(config.validate(), Err(ReplicationError::Config(_))));
        config.identifier = "a|b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = ReplicationConfig::for_testing("a");
        config.push_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_durations() {
        let mut config = ReplicationConfig::for_testing("a");
        config.retry.max_delay = "soon".to_string();
        assert!(config.validate().is_err());

        let mut config = ReplicationConfig::for_testing("a");
        config.downstream.poll_interval = Some("often".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let downstream = DownstreamConfig {
                poll_interval: Some(input.to_string()),
            };
            assert_eq!(downstream.poll_interval_duration(), Some(expected), "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_retry_settings_conversion() {
        let retry = ReplicationConfig::for_testing("a").retry.to_retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(5));
        assert_eq!(retry.max_delay, Duration::from_millis(50));

        let fallback = RetrySettings {
            initial_delay: "nope".to_string(),
            ..Default::default()
        }
        .to_retry_config();
        assert_eq!(fallback.initial_delay, RetryConfig::default().initial_delay);
    }

    #[test]
    fn test_circuit_settings_conversion() {
        let circuit = CircuitSettings::default().to_circuit_config();
        assert_eq!(circuit.failure_threshold, 5);
        assert_eq!(circuit.recovery_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = ReplicationConfig::for_testing("roundtrip");
        config.initial_checkpoint.up = Some(Checkpoint::sequence(3));

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicationConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.identifier, "roundtrip");
        assert_eq!(parsed.downstream.poll_interval.as_deref(), Some("50ms"));
        assert_eq!(parsed.initial_checkpoint.up, Some(Checkpoint::sequence(3)));
    }
}
