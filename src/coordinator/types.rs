//! Replication state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ cancel()                   │ cancel()
//!    │                            ↓
//!    │                        Canceling   (engines draining)
//!    │                            │
//!    ↓                            ↓
//! Canceled ←──────────────────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Built from a `ReplicationInput`; no task runs yet.
//! - **Running**: Downstream and upstream engines are running.
//! - **Canceling**: `cancel()` called; engines finish their current step.
//! - **Canceled**: Engines stopped. The stores are untouched and can be reused.

use crate::conflict::ConflictInput;
use crate::document::Document;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::ReplicationState::start) to begin replication.
    Created,

    /// Both engines running.
    Running,

    /// Cancellation in progress.
    Canceling,

    /// Stopped. A canceled replication cannot be restarted; build a new one
    /// with the same identifier to resume from its checkpoints.
    Canceled,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Canceling => write!(f, "Canceling"),
            EngineState::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Fork → master
    Up,
    /// Master → fork
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conflict resolution that produced a new fork state.
#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub input: ConflictInput,
    pub output: Document,
}
