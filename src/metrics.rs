//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade; the
//! host application installs the exporter. Covered:
//! - Documents pulled into the fork and pushed to the master
//! - Conflicts detected and resolved
//! - Checkpoint writes (written vs skipped as identical)
//! - Master call latency, retries and circuit rejections
//! - Replication state and per-direction activity
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use storage_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_documents_pulled("todos", 42);
//! metrics::record_master_call("todos", "master_write", Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Document Flow
// =============================================================================

/// Master documents written into the fork.
pub fn record_documents_pulled(identifier: &str, count: usize) {
    counter!("replication_documents_pulled_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Pulled master documents skipped because the fork holds a newer local state.
pub fn record_documents_pull_skipped(identifier: &str, count: usize) {
    counter!("replication_documents_pull_skipped_total", "identifier" => identifier.to_string())
        .increment(count as u64);
}

/// Fork documents accepted by the master.
pub fn record_documents_pushed(identifier: &str, count: usize) {
    counter!("replication_documents_pushed_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Master write rejections routed to the conflict handler.
pub fn record_conflicts(identifier: &str, count: usize) {
    counter!("replication_conflicts_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Conflicts that produced a resolved document written back to the fork.
pub fn record_conflicts_resolved(identifier: &str, count: usize) {
    counter!("replication_conflicts_resolved_total", "identifier" => identifier.to_string())
        .increment(count as u64);
}

/// Downstream resync runs.
pub fn record_resync(identifier: &str) {
    counter!("replication_resyncs_total", "identifier" => identifier.to_string()).increment(1);
}

/// Checkpoint set attempt; `written = false` means identical data was skipped.
pub fn record_checkpoint_write(identifier: &str, direction: &str, written: bool) {
    let outcome = if written { "written" } else { "skipped" };
    counter!(
        "replication_checkpoint_writes_total",
        "identifier" => identifier.to_string(),
        "direction" => direction.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Batch size of one engine cycle.
pub fn record_batch_size(identifier: &str, direction: &str, size: usize) {
    histogram!(
        "replication_batch_size",
        "identifier" => identifier.to_string(),
        "direction" => direction.to_string()
    )
    .record(size as f64);
}

// =============================================================================
// Master Calls
// =============================================================================

/// Latency of one master handler call (successful or not).
pub fn record_master_call(identifier: &str, operation: &str, duration: Duration) {
    histogram!(
        "replication_master_call_duration_seconds",
        "identifier" => identifier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// One retry of a transient failure.
pub fn record_retry(operation: &str) {
    counter!("replication_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "replication_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

/// Error published on the error event.
pub fn record_error(identifier: &str, kind: &str) {
    counter!(
        "replication_errors_total",
        "identifier" => identifier.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// State
// =============================================================================

/// Gauge for replication state.
pub fn set_replication_state(identifier: &str, state: &str) {
    // Numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Canceling" => 2.0,
        "Canceled" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_state", "identifier" => identifier.to_string()).set(value);
}

/// 1 while an engine is processing a batch.
pub fn set_direction_active(identifier: &str, direction: &str, active: bool) {
    gauge!(
        "replication_active",
        "identifier" => identifier.to_string(),
        "direction" => direction.to_string()
    )
    .set(if active { 1.0 } else { 0.0 });
}

// =============================================================================
// Store
// =============================================================================

/// SQLite store retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}
