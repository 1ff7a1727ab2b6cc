//! # Storage Replication
//!
//! Bidirectional replication between a writable local document store (the
//! **fork**) and an authoritative peer (the **master**), with conflict
//! resolution and durable checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            ReplicationState                               │
//! │                                                                           │
//! │  ┌─────────────┐   downstream (pull, force-write)   ┌──────────────────┐  │
//! │  │ fork store  │◄───────────────────────────────────│ ReplicationHandler│ │
//! │  │ (Document-  │                                    │ (master access)  │  │
//! │  │  Store)     │───────────────────────────────────►│                  │  │
//! │  └─────────────┘   upstream (push, conflicts)       └──────────────────┘  │
//! │         │                        │                                        │
//! │         ▼                        ▼                                        │
//! │  ┌─────────────────────┐  ┌─────────────────┐                             │
//! │  │ meta store          │  │ ConflictHandler │                             │
//! │  │ checkpoints +       │  │ (is_equal,      │                             │
//! │  │ assumed master state│  │  resolve)       │                             │
//! │  └─────────────────────┘  └─────────────────┘                             │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any [`DocumentStore`] becomes a master through [`StoreReplicationHandler`],
//! so chains compose: the fork of one replication is the master of the next.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storage_replication::{
//!     default_hash_function, replicate_storage, DefaultConflictHandler, MemoryStore,
//!     ReplicationConfig, ReplicationInput, StoreReplicationHandler,
//! };
//!
//! #[tokio::main]
//! async fn main() -> storage_replication::Result<()> {
//!     let master = MemoryStore::shared("master");
//!     let handler = Arc::new(StoreReplicationHandler::new(
//!         master,
//!         Arc::new(DefaultConflictHandler),
//!         default_hash_function(),
//!     ));
//!     let input = ReplicationInput::new(
//!         ReplicationConfig::new("todos"),
//!         MemoryStore::shared("fork"),
//!         MemoryStore::shared("meta"),
//!         handler,
//!     );
//!
//!     let replication = replicate_storage(input).await?;
//!     replication.await_in_sync().await?;
//!     replication.cancel().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod handler;
pub mod meta;
pub mod metrics;
pub mod resilience;
pub mod revision;
pub mod stats;
pub mod store;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, MasterCircuit};
pub use config::ReplicationConfig;
pub use conflict::{ConflictHandler, ConflictInput, DefaultConflictHandler};
pub use coordinator::{
    replicate_storage, Direction, EngineState, ReplicationInput, ReplicationRegistry, ReplicationState,
    ResolvedConflict,
};
pub use document::{AttachmentMeta, Document};
pub use error::{ReplicationError, Result};
pub use handler::{DocumentsWithCheckpoint, MasterWriteRow, PullStreamItem, ReplicationHandler, StoreReplicationHandler};
pub use revision::{default_hash_function, HashFunction, Revision};
pub use stats::StatsSnapshot;
pub use store::memory::MemoryStore;
pub use store::sqlite::SqliteStore;
pub use store::{Checkpoint, DocumentStore};
