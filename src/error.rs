// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication protocol.
//!
//! Errors are categorized by where they originate (document store, master
//! handler, conflict handler) and carry enough context to tell which
//! document or operation failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Storage` | Yes | Store unavailable, closed mid-flight, I/O failure |
//! | `Sqlite` | Busy/locked only | SQLite backend errors |
//! | `Handler` | Yes | Master unreachable, timed out, circuit open |
//! | `ConflictHandler` | No | Conflict handler failed; the document stays pending |
//! | `Schema` | No | Write rejected for shape reasons (missing revision, bad height) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Replication state machine violation |
//! | `Canceled` | No | Replication was canceled |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Conflicts are never errors: they are
//! routed to the [`ConflictHandler`](crate::conflict::ConflictHandler).

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Callers observe these through the `error` event stream of a
/// [`ReplicationState`](crate::coordinator::ReplicationState); the engines
/// themselves never crash on them.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Document store failure.
    ///
    /// The store was unreachable, closed, or failed an I/O operation.
    /// Retryable: the store may come back.
    #[error("Storage error ({operation}): {message}")]
    Storage { operation: String, message: String },

    /// SQLite error from the persistent store backend.
    ///
    /// Only SQLITE_BUSY / SQLITE_LOCKED are retryable.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Master handler failure.
    ///
    /// Network or availability problem talking to the master, including
    /// per-call timeouts and circuit breaker rejections. Retryable.
    #[error("Master handler error ({operation}): {message}")]
    Handler { operation: String, message: String },

    /// The conflict handler could not resolve a conflict.
    ///
    /// Fatal for that document's propagation in this cycle. The document is
    /// retried on the next cycle.
    #[error("Conflict handler failed for document {document_id}: {message}")]
    ConflictHandler { document_id: String, message: String },

    /// Schema or shape violation on write.
    ///
    /// Not retryable: writing the same row again fails the same way.
    #[error("Schema violation for document {document_id}: {message}")]
    Schema { document_id: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State machine violation (e.g. starting an already running replication).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Replication was canceled while the operation was waiting.
    #[error("Replication canceled")]
    Canceled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a storage error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a master handler error.
    pub fn handler(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a schema error for a document.
    pub fn schema(document_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            document_id: document_id.into(),
            message: message.into(),
        }
    }

    /// Create a conflict handler error for a document.
    pub fn conflict_handler(document_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConflictHandler {
            document_id: document_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. } => true,
            Self::Sqlite(e) => is_busy(e),
            Self::Handler { .. } => true, // Transport errors are transient
            Self::ConflictHandler { .. } => false,
            Self::Schema { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Canceled => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage { .. } => "storage",
            Self::Sqlite(_) => "sqlite",
            Self::Handler { .. } => "handler",
            Self::ConflictHandler { .. } => "conflict_handler",
            Self::Schema { .. } => "schema",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Canceled => "canceled",
            Self::Internal(_) => "internal",
        }
    }
}

/// SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
pub(crate) fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}
