// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store capability interface.
//!
//! Fork, master and meta stores are all consumed through [`DocumentStore`].
//! The replication engines never see a backend type, only this trait, so a
//! store may be in-memory ([`MemoryStore`]), on disk ([`SqliteStore`]), or a
//! proxy to something remote.
//!
//! # Write Semantics
//!
//! Every write row names the `previous` state it was computed from. The
//! store accepts the row only if that matches what it holds:
//!
//! | Stored | `previous` | Result |
//! |--------|------------|--------|
//! | none | none | insert |
//! | none | some | 409, nothing in db |
//! | doc | none | 409 with stored doc |
//! | doc | same rev | update (height must increase, else 400) |
//! | doc | other rev | 409 with stored doc |
//!
//! Deleting a document drops all of its attachment blobs. A live document
//! must reference only blobs that are either supplied with the row or
//! already stored under the same attachment id and digest.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> storage_replication::Result<()> {
//! use storage_replication::store::{upsert, DocumentStore, MemoryStore};
//! use storage_replication::{default_hash_function, Document};
//! use serde_json::json;
//!
//! let store = MemoryStore::new("fork");
//! let hash = default_hash_function();
//! let written = upsert(&store, &hash, Document::new("a", json!({"age": 1})), Default::default()).await?;
//! assert_eq!(written.height(), 1);
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::document::{Document, DocumentData};
use crate::error::{ReplicationError, Result};
use crate::revision::{create_revision, now_lwt, HashFunction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Type alias for boxed async futures (keeps trait signatures readable).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Buffered change bulks per subscriber before it is considered lagged.
pub const CHANGE_STREAM_CAPACITY: usize = 1024;

/// Write error status: optimistic concurrency check failed.
pub const STATUS_CONFLICT: u16 = 409;
/// Write error status: the row itself is malformed.
pub const STATUS_INVALID: u16 = 400;

/// Opaque forward-only cursor over a store's change feed.
///
/// Compared byte-for-byte; the stores in this crate use
/// `{"sequence": n}` but callers must not rely on the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub Value);

impl Checkpoint {
    pub fn sequence(sequence: u64) -> Self {
        Self(serde_json::json!({ "sequence": sequence }))
    }

    /// Sequence number, if this is a sequence checkpoint.
    pub fn as_sequence(&self) -> Option<u64> {
        self.0.get("sequence").and_then(Value::as_u64)
    }

    /// Byte-identical serialized form.
    pub fn is_identical(&self, other: &Checkpoint) -> bool {
        match (serde_json::to_vec(&self.0), serde_json::to_vec(&other.0)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Sequence to resume after. Unknown checkpoint shapes restart from zero.
pub(crate) fn resume_sequence(store: &str, checkpoint: Option<&Checkpoint>) -> u64 {
    match checkpoint {
        None => 0,
        Some(cp) => cp.as_sequence().unwrap_or_else(|| {
            tracing::warn!(store = %store, checkpoint = %cp.0, "Unrecognized checkpoint, reading from start");
            0
        }),
    }
}

/// One row of a bulk write.
#[derive(Debug, Clone)]
pub struct BulkWriteRow {
    pub document: Document,
    pub previous: Option<Document>,
    /// Blob bytes keyed by digest, for attachments the store does not hold yet.
    pub attachment_data: HashMap<String, Vec<u8>>,
}

impl BulkWriteRow {
    pub fn new(document: Document, previous: Option<Document>) -> Self {
        Self {
            document,
            previous,
            attachment_data: HashMap::new(),
        }
    }
}

/// A rejected write row.
#[derive(Debug, Clone)]
pub struct WriteError {
    pub status: u16,
    pub document_id: String,
    /// Current stored state, for 409s.
    pub document_in_db: Option<Document>,
    pub message: String,
}

impl WriteError {
    pub fn conflict(document_id: impl Into<String>, document_in_db: Option<Document>) -> Self {
        Self {
            status: STATUS_CONFLICT,
            document_id: document_id.into(),
            document_in_db,
            message: "previous state does not match stored state".to_string(),
        }
    }

    pub fn invalid(document_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: STATUS_INVALID,
            document_id: document_id.into(),
            document_in_db: None,
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status == STATUS_CONFLICT
    }

    /// Convert to an error for callers that do not handle conflicts.
    pub fn into_error(self) -> ReplicationError {
        if self.is_conflict() {
            ReplicationError::storage(
                "bulk_write",
                format!("conflict writing {}: {}", self.document_id, self.message),
            )
        } else {
            ReplicationError::schema(self.document_id, self.message)
        }
    }
}

/// Result of a bulk write. Rows are independent: some may succeed while
/// others fail.
#[derive(Debug, Clone, Default)]
pub struct BulkWriteResponse {
    pub success: Vec<Document>,
    pub error: Vec<WriteError>,
}

/// Latest versions of documents changed after a checkpoint, in feed order.
#[derive(Debug, Clone)]
pub struct ChangedDocuments {
    pub documents: Vec<Document>,
    /// Checkpoint of the last returned document, or the input checkpoint
    /// when nothing changed.
    pub checkpoint: Option<Checkpoint>,
}

/// One successful bulk write as seen on the change stream.
#[derive(Debug, Clone)]
pub struct ChangeEventBulk {
    pub documents: Vec<Document>,
    pub checkpoint: Checkpoint,
    /// Context string passed to `bulk_write`.
    pub context: String,
}

/// Equality selector over payload fields, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    pub selector: DocumentData,
    pub include_deleted: bool,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl StoreQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.selector.insert(field.into(), value);
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        if document.deleted && !self.include_deleted {
            return false;
        }
        self.selector
            .iter()
            .all(|(field, expected)| document.data.get(field) == Some(expected))
    }

    /// Apply selector, skip and limit to documents already sorted by id.
    pub(crate) fn apply<'a>(&self, sorted: impl Iterator<Item = &'a Document>) -> Vec<Document> {
        sorted
            .filter(|doc| self.matches(doc))
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// Capability interface every store backend provides.
///
/// Arguments are copied before the returned future is created, so futures
/// only borrow the store.
pub trait DocumentStore: Send + Sync + 'static {
    /// Store name for logs and metrics.
    fn name(&self) -> &str;

    /// Write rows with the optimistic concurrency check described in the
    /// module docs. One change bulk is emitted for all successful rows.
    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> BoxFuture<'_, BulkWriteResponse>;

    /// Point lookup. Missing ids are simply absent from the result.
    fn find_documents_by_id(&self, ids: &[String], include_deleted: bool) -> BoxFuture<'_, Vec<Document>>;

    fn query(&self, query: StoreQuery) -> BoxFuture<'_, Vec<Document>>;

    /// Up to `limit` documents changed strictly after `checkpoint`.
    fn changes_since(&self, checkpoint: Option<&Checkpoint>, limit: usize) -> BoxFuture<'_, ChangedDocuments>;

    /// Subscribe to future change bulks.
    fn change_stream(&self) -> broadcast::Receiver<ChangeEventBulk>;

    fn get_attachment_data(&self, document_id: &str, attachment_id: &str, digest: &str) -> BoxFuture<'_, Vec<u8>>;

    /// Stop accepting operations. Data is kept.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Delete all data and close.
    fn remove(&self) -> BoxFuture<'_, ()>;
}

/// Check a row against the stored state.
///
/// `has_blob(attachment_id, digest)` reports whether the store already holds
/// the blob for this document.
pub(crate) fn validate_write(
    current: Option<&Document>,
    row: &BulkWriteRow,
    has_blob: impl Fn(&str, &str) -> bool,
) -> std::result::Result<(), WriteError> {
    let doc = &row.document;
    if doc.id.is_empty() {
        return Err(WriteError::invalid("", "document id is empty"));
    }
    let Some(rev) = doc.rev.as_ref() else {
        return Err(WriteError::invalid(&doc.id, "document has no revision"));
    };

    match (current, row.previous.as_ref()) {
        (None, None) => {}
        (None, Some(_)) => return Err(WriteError::conflict(&doc.id, None)),
        (Some(stored), None) => return Err(WriteError::conflict(&doc.id, Some(stored.clone()))),
        (Some(stored), Some(previous)) => {
            if stored.rev != previous.rev {
                return Err(WriteError::conflict(&doc.id, Some(stored.clone())));
            }
            if rev.height() <= stored.height() {
                return Err(WriteError::invalid(
                    &doc.id,
                    format!(
                        "revision height must increase (stored {}, written {})",
                        stored.height(),
                        rev.height()
                    ),
                ));
            }
        }
    }

    if !doc.deleted {
        for (attachment_id, meta) in &doc.attachments {
            match row.attachment_data.get(&meta.digest) {
                Some(bytes) if bytes.len() as u64 != meta.length => {
                    return Err(WriteError::invalid(
                        &doc.id,
                        format!("attachment {} length mismatch", attachment_id),
                    ));
                }
                Some(_) => {}
                None if has_blob(attachment_id, &meta.digest) => {}
                None => {
                    return Err(WriteError::invalid(
                        &doc.id,
                        format!("missing data for attachment {}", attachment_id),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Index documents by id (last occurrence wins).
pub fn index_by_id(documents: impl IntoIterator<Item = Document>) -> HashMap<String, Document> {
    documents.into_iter().map(|doc| (doc.id.clone(), doc)).collect()
}

/// Application-style write: read the current state, stamp a new revision and
/// write on top of it.
pub async fn upsert(
    store: &dyn DocumentStore,
    hash_function: &HashFunction,
    mut document: Document,
    attachment_data: HashMap<String, Vec<u8>>,
) -> Result<Document> {
    let current = store
        .find_documents_by_id(std::slice::from_ref(&document.id), true)
        .await?
        .into_iter()
        .next();
    document.rev = Some(create_revision(hash_function, &document, current.as_ref()));
    document.meta.lwt = now_lwt();
    let id = document.id.clone();

    let response = store
        .bulk_write(
            vec![BulkWriteRow {
                document,
                previous: current,
                attachment_data,
            }],
            "upsert",
        )
        .await?;
    if let Some(err) = response.error.into_iter().next() {
        return Err(err.into_error());
    }
    response
        .success
        .into_iter()
        .next()
        .ok_or_else(|| ReplicationError::Internal(format!("write of {} returned nothing", id)))
}

/// Application-style delete. Deleting a missing document is an error.
pub async fn delete_document(
    store: &dyn DocumentStore,
    hash_function: &HashFunction,
    id: &str,
) -> Result<Document> {
    let current = store
        .find_documents_by_id(&[id.to_string()], false)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ReplicationError::storage("delete", format!("document {} not found", id)))?;
    upsert(store, hash_function, current.into_tombstone(), HashMap::new()).await
}
