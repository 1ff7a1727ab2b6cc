// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication coordinator.
//!
//! A [`ReplicationState`] owns one fork/master link and runs two engines:
//! - **Downstream** (`downstream.rs`): master → fork, checkpointed over the
//!   master's change feed, woken by the master's live stream, explicit
//!   resyncs and an idle poll
//! - **Upstream** (`upstream.rs`): fork → master, checkpointed over the
//!   fork's change feed, woken by the fork's change stream
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────── ReplicationState ────────────────┐
//!                 │                                                  │
//!  fork store ◄───┤ downstream ◄── master_changes_since / stream ────┼──► ReplicationHandler ──► master
//!      │          │                                                  │
//!      └─ change ─┼──► upstream ──► master_write ──► conflicts ──────┤
//!         stream  │                    │                             │
//!                 │                    └──► ConflictHandler          │
//!                 │                                                  │
//!                 │        meta store: checkpoints + assumed states  │
//!                 └──────────────────────────────────────────────────┘
//! ```
//!
//! Master calls go through a [`MasterCircuit`] and [`with_retry`]. Failures
//! that survive retries are published on the `error` channel; checkpoints
//! are not advanced and the engine re-arms after the backoff ceiling.
//!
//! # Events
//!
//! | Channel | Kind | Payload |
//! |---------|------|---------|
//! | `errors()` | broadcast | every surfaced error |
//! | `sent()` | broadcast | rows accepted by the master (processed up) |
//! | `received()` | broadcast | documents written to the fork (processed down) |
//! | `resolved_conflicts()` | broadcast | conflict input and resolved output |
//! | `active(dir)` | watch | engine is processing |
//! | `first_sync_done(dir)` | watch | first full pass finished |
//! | `canceled()` | watch | cancellation requested |
//!
//! Subscribers own their error handling: the engines never look at what a
//! subscriber does with an event.

mod downstream;
mod registry;
mod types;
mod upstream;

pub use registry::ReplicationRegistry;
pub use types::{Direction, EngineState, ResolvedConflict};

use crate::circuit_breaker::{MasterCircuit, MasterCircuitMetrics};
use crate::config::ReplicationConfig;
use crate::conflict::{ConflictHandler, DefaultConflictHandler};
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::handler::{DocumentsWithCheckpoint, MasterWriteRow, ReplicationHandler};
use crate::meta::MetaInstance;
use crate::metrics;
use crate::resilience::{with_retry, RetryConfig};
use crate::revision::{default_hash_function, HashFunction};
use crate::stats::{ReplicationStats, StatsSnapshot};
use crate::store::{Checkpoint, DocumentStore};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Debounce hook awaited before the upstream engine reads a burst of fork
/// changes.
pub type WaitBeforePersist = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const IN_SYNC_POLL: Duration = Duration::from_millis(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to build a [`ReplicationState`].
pub struct ReplicationInput {
    pub config: ReplicationConfig,
    pub fork: Arc<dyn DocumentStore>,
    /// Owned by this replication; never share it between two live
    /// replications with the same identifier.
    pub meta: Arc<dyn DocumentStore>,
    pub handler: Arc<dyn ReplicationHandler>,
    pub conflict_handler: Arc<dyn ConflictHandler>,
    pub hash_function: HashFunction,
    pub wait_before_persist: Option<WaitBeforePersist>,
}

impl ReplicationInput {
    /// Input with the master-wins conflict handler and sha256 revisions.
    pub fn new(
        config: ReplicationConfig,
        fork: Arc<dyn DocumentStore>,
        meta: Arc<dyn DocumentStore>,
        handler: Arc<dyn ReplicationHandler>,
    ) -> Self {
        Self {
            config,
            fork,
            meta,
            handler,
            conflict_handler: Arc::new(DefaultConflictHandler),
            hash_function: default_hash_function(),
            wait_before_persist: None,
        }
    }

    pub fn with_conflict_handler(mut self, conflict_handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = conflict_handler;
        self
    }

    pub fn with_hash_function(mut self, hash_function: HashFunction) -> Self {
        self.hash_function = hash_function;
        self
    }

    pub fn with_wait_before_persist(mut self, wait: WaitBeforePersist) -> Self {
        self.wait_before_persist = Some(wait);
        self
    }

    /// Debounce fork bursts by a fixed delay.
    pub fn with_persist_delay(self, delay: Duration) -> Self {
        self.with_wait_before_persist(Arc::new(move || Box::pin(tokio::time::sleep(delay))))
    }
}

pub(crate) struct Events {
    pub error: broadcast::Sender<Arc<ReplicationError>>,
    pub processed_up: broadcast::Sender<MasterWriteRow>,
    pub processed_down: broadcast::Sender<Document>,
    pub resolved_conflicts: broadcast::Sender<ResolvedConflict>,
    pub active_up: watch::Sender<bool>,
    pub active_down: watch::Sender<bool>,
    pub first_sync_up: watch::Sender<bool>,
    pub first_sync_down: watch::Sender<bool>,
}

impl Events {
    fn new() -> Self {
        Self {
            error: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            processed_up: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            processed_down: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            resolved_conflicts: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            active_up: watch::channel(false).0,
            active_down: watch::channel(false).0,
            first_sync_up: watch::channel(false).0,
            first_sync_down: watch::channel(false).0,
        }
    }

    fn active(&self, direction: Direction) -> &watch::Sender<bool> {
        match direction {
            Direction::Up => &self.active_up,
            Direction::Down => &self.active_down,
        }
    }

    fn first_sync(&self, direction: Direction) -> &watch::Sender<bool> {
        match direction {
            Direction::Up => &self.first_sync_up,
            Direction::Down => &self.first_sync_down,
        }
    }
}

/// State shared by the two engines.
pub(crate) struct Shared {
    pub identifier: String,
    pub config: ReplicationConfig,
    pub retry: RetryConfig,
    pub fork: Arc<dyn DocumentStore>,
    pub meta: MetaInstance,
    pub handler: Arc<dyn ReplicationHandler>,
    pub conflict_handler: Arc<dyn ConflictHandler>,
    pub hash_function: HashFunction,
    pub wait_before_persist: Option<WaitBeforePersist>,
    pub stats: ReplicationStats,
    pub circuit: MasterCircuit,
    pub events: Events,
    pub canceled: watch::Receiver<bool>,
    pub resync_tx: mpsc::UnboundedSender<()>,
    /// Master exposes a live change stream.
    pub master_live: AtomicBool,
    /// Context of fork writes made by the downstream engine.
    pub downstream_flag: String,
}

impl Shared {
    pub(crate) fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    pub(crate) fn emit_error(&self, e: ReplicationError) {
        error!(identifier = %self.identifier, kind = e.kind(), error = %e, "Replication error");
        metrics::record_error(&self.identifier, e.kind());
        // No subscribers is fine
        let _ = self.events.error.send(Arc::new(e));
    }

    pub(crate) fn set_active(&self, direction: Direction, active: bool) {
        let changed = self.events.active(direction).send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
        if changed {
            metrics::set_direction_active(&self.identifier, direction.as_str(), active);
        }
    }

    pub(crate) fn mark_first_sync(&self, direction: Direction) {
        let first = self.events.first_sync(direction).send_if_modified(|done| {
            let was = *done;
            *done = true;
            !was
        });
        if first {
            info!(identifier = %self.identifier, direction = %direction, "First sync done");
        }
    }

    pub(crate) fn request_resync(&self) {
        // Receiver gone means downstream already stopped
        let _ = self.resync_tx.send(());
    }

    /// `master_changes_since` through the pull circuit with retry.
    pub(crate) async fn pull(&self, checkpoint: Option<Checkpoint>) -> Result<DocumentsWithCheckpoint> {
        let started = Instant::now();
        let batch_size = self.config.pull_batch_size;
        let result = with_retry("master_changes_since", &self.retry, &self.canceled, || {
            let checkpoint = checkpoint.clone();
            self.circuit.pulls.call("master_changes_since", move || {
                self.handler.master_changes_since(checkpoint, batch_size)
            })
        })
        .await;
        metrics::record_master_call(&self.identifier, "master_changes_since", started.elapsed());
        result
    }

    /// `master_write` through the push circuit with retry.
    pub(crate) async fn push(&self, rows: Vec<MasterWriteRow>) -> Result<Vec<Document>> {
        let started = Instant::now();
        let result = with_retry("master_write", &self.retry, &self.canceled, || {
            let rows = rows.clone();
            self.circuit
                .pushes
                .call("master_write", move || self.handler.master_write(rows))
        })
        .await;
        metrics::record_master_call(&self.identifier, "master_write", started.elapsed());
        result
    }

    pub(crate) async fn master_attachment(&self, document_id: &str, attachment_id: &str, digest: &str) -> Result<Vec<u8>> {
        with_retry("master_attachment_data", &self.retry, &self.canceled, || {
            self.circuit.pulls.call("master_attachment_data", || {
                self.handler.master_attachment_data(document_id, attachment_id, digest)
            })
        })
        .await
    }
}

/// Whether `candidate` is at or behind `reached`. Only sequence checkpoints
/// can be compared; anything else is treated as new.
pub(crate) fn is_covered(candidate: &Checkpoint, reached: Option<&Checkpoint>) -> bool {
    match (candidate.as_sequence(), reached.and_then(Checkpoint::as_sequence)) {
        (Some(c), Some(r)) => c <= r,
        _ => false,
    }
}

/// One running fork/master replication.
///
/// Create with [`ReplicationState::new`] and [`start`](Self::start), or
/// [`replicate_storage`] for both at once.
pub struct ReplicationState {
    shared: Arc<Shared>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    canceled_tx: watch::Sender<bool>,
    resync_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    /// Engine task handles. The lock also serializes start/cancel.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationState {
    /// Build a replication in `Created` state.
    pub fn new(input: ReplicationInput) -> Result<Self> {
        input.config.validate()?;

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (canceled_tx, canceled_rx) = watch::channel(false);
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let identifier = input.config.identifier.clone();

        let shared = Shared {
            retry: input.config.retry.to_retry_config(),
            circuit: MasterCircuit::new(&identifier, input.config.circuit.to_circuit_config()),
            meta: MetaInstance::new(input.meta, identifier.clone(), input.hash_function.clone()),
            downstream_flag: format!("replication-downstream-{}", identifier),
            identifier,
            config: input.config,
            fork: input.fork,
            handler: input.handler,
            conflict_handler: input.conflict_handler,
            hash_function: input.hash_function,
            wait_before_persist: input.wait_before_persist,
            stats: ReplicationStats::default(),
            events: Events::new(),
            canceled: canceled_rx,
            resync_tx,
            master_live: AtomicBool::new(false),
        };
        metrics::set_replication_state(&shared.identifier, "Created");

        Ok(Self {
            shared: Arc::new(shared),
            state_tx,
            state_rx,
            canceled_tx,
            resync_rx: std::sync::Mutex::new(Some(resync_rx)),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.shared.config
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Start both engines.
    ///
    /// 1. Persists configured initial checkpoints where none are stored
    /// 2. Subscribes to the fork's and master's change streams
    /// 3. Spawns the downstream engine (starts with a resync)
    /// 4. Spawns the upstream engine (starts with the initial sync)
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        let current = self.state();
        if current != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: current.to_string(),
            });
        }

        let shared = &self.shared;
        self.apply_initial_checkpoints().await?;

        let resync_rx = self
            .resync_rx
            .lock()
            .map_err(|_| ReplicationError::Internal("resync receiver lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| ReplicationError::Internal("replication already started".to_string()))?;

        // Subscribe before spawning so nothing written from here on is missed
        let fork_changes = shared.fork.change_stream();
        let down_stream = shared.handler.master_change_stream();
        let up_stream = shared.handler.master_change_stream();
        shared.master_live.store(down_stream.is_some(), Ordering::Relaxed);

        info!(
            identifier = %shared.identifier,
            fork = %shared.fork.name(),
            pull_batch_size = shared.config.pull_batch_size,
            push_batch_size = shared.config.push_batch_size,
            master_live = down_stream.is_some(),
            "Starting replication"
        );

        let down_shared = Arc::clone(shared);
        handles.push(tokio::spawn(async move {
            downstream::run(down_shared, down_stream, resync_rx).await;
        }));
        let up_shared = Arc::clone(shared);
        handles.push(tokio::spawn(async move {
            upstream::run(up_shared, fork_changes, up_stream).await;
        }));

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_replication_state(&shared.identifier, "Running");
        Ok(())
    }

    async fn apply_initial_checkpoints(&self) -> Result<()> {
        let shared = &self.shared;
        let initial = &shared.config.initial_checkpoint;
        for (direction, checkpoint) in [(Direction::Up, &initial.up), (Direction::Down, &initial.down)] {
            let Some(checkpoint) = checkpoint else { continue };
            if shared.meta.last_checkpoint(direction).await?.is_none() {
                info!(identifier = %shared.identifier, direction = %direction, "Applying initial checkpoint");
                shared.meta.set_checkpoint(direction, checkpoint).await?;
            }
        }
        Ok(())
    }

    /// Stop both engines and wait for them to finish their current step.
    ///
    /// Stores are not closed. Safe to call more than once.
    pub async fn cancel(&self) {
        let mut guard = self.handles.lock().await;
        if self.state() == EngineState::Canceled {
            return;
        }
        info!(identifier = %self.shared.identifier, "Canceling replication");
        let _ = self.state_tx.send(EngineState::Canceling);
        metrics::set_replication_state(&self.shared.identifier, "Canceling");
        self.canceled_tx.send_replace(true);

        let handles = std::mem::take(&mut *guard);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Engine stopped"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Engine panicked during cancel"),
                Err(_) => warn!(task = i + 1, "Engine did not stop in time"),
            }
        }

        self.shared.set_active(Direction::Up, false);
        self.shared.set_active(Direction::Down, false);
        let _ = self.state_tx.send(EngineState::Canceled);
        metrics::set_replication_state(&self.shared.identifier, "Canceled");
        info!(identifier = %self.shared.identifier, "Replication canceled");
    }

    /// Ask the downstream engine to re-pull from its checkpoint.
    pub fn resync(&self) {
        self.shared.request_resync();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn circuit_metrics(&self) -> MasterCircuitMetrics {
        self.shared.circuit.metrics()
    }

    pub fn errors(&self) -> broadcast::Receiver<Arc<ReplicationError>> {
        self.shared.events.error.subscribe()
    }

    /// Rows accepted by the master.
    pub fn sent(&self) -> broadcast::Receiver<MasterWriteRow> {
        self.shared.events.processed_up.subscribe()
    }

    /// Master documents written into the fork.
    pub fn received(&self) -> broadcast::Receiver<Document> {
        self.shared.events.processed_down.subscribe()
    }

    pub fn resolved_conflicts(&self) -> broadcast::Receiver<ResolvedConflict> {
        self.shared.events.resolved_conflicts.subscribe()
    }

    pub fn active(&self, direction: Direction) -> watch::Receiver<bool> {
        self.shared.events.active(direction).subscribe()
    }

    pub fn first_sync_done(&self, direction: Direction) -> watch::Receiver<bool> {
        self.shared.events.first_sync(direction).subscribe()
    }

    pub fn canceled(&self) -> watch::Receiver<bool> {
        self.canceled_tx.subscribe()
    }

    /// Resolves once downstream finished its first full pull and upstream
    /// pushed all documents the fork held at start.
    pub async fn await_first_in_sync(&self) -> Result<()> {
        let mut canceled = self.shared.canceled.clone();
        for direction in [Direction::Down, Direction::Up] {
            let mut done = self.first_sync_done(direction);
            tokio::select! {
                result = done.wait_for(|d| *d) => {
                    result.map_err(|_| ReplicationError::Canceled)?;
                }
                _ = canceled.wait_for(|c| *c) => return Err(ReplicationError::Canceled),
            }
        }
        Ok(())
    }

    /// Resolves once both engines are idle and neither change feed holds
    /// anything past its checkpoint. Without a live master stream the master
    /// side settles on the next poll or [`resync`](Self::resync); with
    /// polling disabled it waits for an explicit resync.
    pub async fn await_in_sync(&self) -> Result<()> {
        self.await_first_in_sync().await?;
        loop {
            if self.shared.is_canceled() {
                return Err(ReplicationError::Canceled);
            }
            if self.is_settled().await? {
                return Ok(());
            }
            tokio::time::sleep(IN_SYNC_POLL).await;
        }
    }

    /// Like [`await_in_sync`](Self::await_in_sync), but requires two
    /// consecutive settled observations. Use under concurrent writers.
    pub async fn await_idle(&self) -> Result<()> {
        loop {
            self.await_in_sync().await?;
            tokio::time::sleep(IN_SYNC_POLL).await;
            if self.is_settled().await? {
                return Ok(());
            }
        }
    }

    async fn is_settled(&self) -> Result<bool> {
        let shared = &self.shared;
        let busy = || *shared.events.active_up.borrow() || *shared.events.active_down.borrow();
        if busy() {
            return Ok(false);
        }

        let up = shared.meta.last_checkpoint(Direction::Up).await?;
        if !shared.fork.changes_since(up.as_ref(), 1).await?.documents.is_empty() {
            return Ok(false);
        }
        let down = shared.meta.last_checkpoint(Direction::Down).await?;
        match shared.handler.master_changes_since(down, 1).await {
            Ok(batch) if !batch.documents.is_empty() => return Ok(false),
            Ok(_) => {}
            Err(e) => {
                // Engines surface master failures themselves
                debug!(error = %e, "Master unreachable while checking sync state");
                return Ok(false);
            }
        }
        Ok(!busy())
    }
}

impl Drop for ReplicationState {
    fn drop(&mut self) {
        // Engines hold the shared state; stop them with us
        self.canceled_tx.send_replace(true);
    }
}

/// Build and start a replication.
pub async fn replicate_storage(input: ReplicationInput) -> Result<Arc<ReplicationState>> {
    let state = Arc::new(ReplicationState::new(input)?);
    state.start().await?;
    Ok(state)
}
