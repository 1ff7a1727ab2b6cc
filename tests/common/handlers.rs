//! Mock conflict handlers and failure-injecting handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use storage_replication::handler::{DocumentsWithCheckpoint, MasterWriteRow, PullStream, ReplicationHandler};
use storage_replication::store::BoxFuture;
use storage_replication::{Checkpoint, ConflictHandler, ConflictInput, Document, ReplicationError};

fn age(doc: &Document) -> i64 {
    doc.get("age").and_then(|v| v.as_i64()).unwrap_or(0)
}

/// Higher `age` wins. Equal ages are a caller bug and fail the resolution.
#[derive(Default)]
pub struct HigherAgeConflictHandler {
    resolves: AtomicUsize,
}

impl HigherAgeConflictHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `resolve` calls so far.
    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl ConflictHandler for HigherAgeConflictHandler {
    fn resolve(&self, input: ConflictInput, _context: &str) -> BoxFuture<'_, Document> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let fork_age = age(&input.new_document_state);
            let master_age = age(&input.real_master_state);
            if fork_age > master_age {
                Ok(input.new_document_state)
            } else if master_age > fork_age {
                Ok(input.real_master_state)
            } else {
                Err(ReplicationError::conflict_handler(
                    &input.real_master_state.id,
                    format!("equal age {}", fork_age),
                ))
            }
        })
    }
}

/// Every resolution fails.
#[derive(Default)]
pub struct ThrowingConflictHandler {
    resolves: AtomicUsize,
}

impl ThrowingConflictHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl ConflictHandler for ThrowingConflictHandler {
    fn resolve(&self, input: ConflictInput, _context: &str) -> BoxFuture<'_, Document> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let id = input.real_master_state.id;
        Box::pin(async move { Err(ReplicationError::conflict_handler(id, "resolution refused")) })
    }
}

/// Fails the first `n` resolutions, then lets the fork state win.
pub struct FlakyConflictHandler {
    remaining_failures: AtomicUsize,
    resolves: AtomicUsize,
}

impl FlakyConflictHandler {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicUsize::new(failures),
            resolves: AtomicUsize::new(0),
        })
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl ConflictHandler for FlakyConflictHandler {
    fn resolve(&self, input: ConflictInput, _context: &str) -> BoxFuture<'_, Document> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let fail = FlakyHandler::take_failure(&self.remaining_failures);
        Box::pin(async move {
            if fail {
                return Err(ReplicationError::conflict_handler(
                    &input.new_document_state.id,
                    "injected failure",
                ));
            }
            Ok(input.new_document_state)
        })
    }
}

/// Wraps a master handler, counting calls and failing on demand.
///
/// # Example
/// ```rust,ignore
/// let flaky = FlakyHandler::wrap(handler);
/// flaky.fail_next_pushes(5);
/// // ... replicate ...
/// assert!(flaky.pushed_rows() > 0);
/// ```
pub struct FlakyHandler {
    inner: Arc<dyn ReplicationHandler>,
    fail_pulls: AtomicUsize,
    fail_pushes: AtomicUsize,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    pushed_rows: AtomicUsize,
}

impl FlakyHandler {
    pub fn wrap(inner: Arc<dyn ReplicationHandler>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_pulls: AtomicUsize::new(0),
            fail_pushes: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            pushed_rows: AtomicUsize::new(0),
        })
    }

    pub fn fail_next_pulls(&self, n: usize) {
        self.fail_pulls.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pushes(&self, n: usize) {
        self.fail_pushes.store(n, Ordering::SeqCst);
    }

    /// Successful and failed `master_changes_since` calls.
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Successful and failed `master_write` calls.
    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Rows handed to the master by non-failing `master_write` calls.
    pub fn pushed_rows(&self) -> usize {
        self.pushed_rows.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ReplicationHandler for FlakyHandler {
    fn master_changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> BoxFuture<'_, DocumentsWithCheckpoint> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_pulls) {
            return Box::pin(async { Err(ReplicationError::handler("master_changes_since", "injected failure")) });
        }
        self.inner.master_changes_since(checkpoint, batch_size)
    }

    fn master_write(&self, rows: Vec<MasterWriteRow>) -> BoxFuture<'_, Vec<Document>> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_pushes) {
            return Box::pin(async { Err(ReplicationError::handler("master_write", "injected failure")) });
        }
        self.pushed_rows.fetch_add(rows.len(), Ordering::SeqCst);
        self.inner.master_write(rows)
    }

    fn master_change_stream(&self) -> Option<PullStream> {
        self.inner.master_change_stream()
    }

    fn master_attachment_data(
        &self,
        document_id: &str,
        attachment_id: &str,
        digest: &str,
    ) -> BoxFuture<'_, Vec<u8>> {
        self.inner.master_attachment_data(document_id, attachment_id, digest)
    }
}
