// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master access.
//!
//! The replication engines only ever reach the master through a
//! [`ReplicationHandler`]. A handler can front a remote service, a local
//! store, or the fork of another replication (which is how chains
//! `A → B → C → master` are built: B's fork is wrapped in a
//! [`StoreReplicationHandler`] and used as A's master).
//!
//! # Master Write Rules
//!
//! For every pushed row, [`StoreReplicationHandler`] compares the master's
//! real state with the fork's assumed state:
//!
//! | Master | Assumed | Outcome |
//! |--------|---------|---------|
//! | none | any | insert |
//! | doc | none | conflict, real state returned |
//! | doc | equal to master | write on top of master |
//! | doc | differs | conflict, real state returned |
//!
//! A 409 from the underlying store (a concurrent master writer) is also
//! reported as a conflict. Any other write error is a schema error.

use crate::conflict::ConflictHandler;
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::revision::{create_revision, height_of, now_lwt, HashFunction};
use crate::store::{index_by_id, BoxFuture, BulkWriteRow, Checkpoint, DocumentStore};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Context of bulk writes the handler performs on its store.
pub const MASTER_WRITE_CONTEXT: &str = "replication-master-write";

/// One document pushed to the master.
#[derive(Debug, Clone)]
pub struct MasterWriteRow {
    pub new_document_state: Document,
    /// What the fork believes the master holds.
    pub assumed_master_state: Option<Document>,
    /// Blob bytes keyed by digest for attachments the master may not hold.
    pub attachment_data: HashMap<String, Vec<u8>>,
}

/// A batch of master changes and the checkpoint to continue from.
#[derive(Debug, Clone)]
pub struct DocumentsWithCheckpoint {
    pub documents: Vec<Document>,
    pub checkpoint: Option<Checkpoint>,
}

/// Item of a master's live change stream.
#[derive(Debug, Clone)]
pub enum PullStreamItem {
    Documents(DocumentsWithCheckpoint),
    /// Changes may have been missed; the fork must re-pull.
    Resync,
}

pub type PullStream = BoxStream<'static, PullStreamItem>;

/// Access to a master.
pub trait ReplicationHandler: Send + Sync + 'static {
    /// Up to `batch_size` changes strictly after `checkpoint`, in feed order.
    fn master_changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> BoxFuture<'_, DocumentsWithCheckpoint>;

    /// Write rows under optimistic concurrency. Returns the master's real
    /// state for every row that conflicted; other rows were applied.
    fn master_write(&self, rows: Vec<MasterWriteRow>) -> BoxFuture<'_, Vec<Document>>;

    /// Live change stream, if the master has one. Without it the downstream
    /// engine relies on polling and explicit resyncs.
    fn master_change_stream(&self) -> Option<PullStream> {
        None
    }

    fn master_attachment_data(
        &self,
        document_id: &str,
        attachment_id: &str,
        digest: &str,
    ) -> BoxFuture<'_, Vec<u8>>;
}

/// Exposes a [`DocumentStore`] as a master.
pub struct StoreReplicationHandler {
    store: Arc<dyn DocumentStore>,
    conflict_handler: Arc<dyn ConflictHandler>,
    hash_function: HashFunction,
    live: bool,
}

impl StoreReplicationHandler {
    /// Handler with a live change stream.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        conflict_handler: Arc<dyn ConflictHandler>,
        hash_function: HashFunction,
    ) -> Self {
        Self {
            store,
            conflict_handler,
            hash_function,
            live: true,
        }
    }

    /// Handler without a change stream (pull-only master).
    pub fn without_stream(
        store: Arc<dyn DocumentStore>,
        conflict_handler: Arc<dyn ConflictHandler>,
        hash_function: HashFunction,
    ) -> Self {
        Self {
            live: false,
            ..Self::new(store, conflict_handler, hash_function)
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Stamp a pushed document for writing on top of `master`. The fork's
    /// revision is kept when it is already above the master's height.
    fn stamp(&self, mut document: Document, master: Option<&Document>) -> Document {
        let keep = match (&document.rev, master) {
            (Some(_), None) => true,
            (Some(rev), Some(m)) => rev.height() > height_of(m.rev.as_ref()),
            (None, _) => false,
        };
        if !keep {
            document.rev = Some(create_revision(&self.hash_function, &document, master));
        }
        document.meta.lwt = now_lwt();
        document
    }

    async fn write(&self, rows: Vec<MasterWriteRow>) -> Result<Vec<Document>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = rows.iter().map(|r| r.new_document_state.id.clone()).collect();
        let current = index_by_id(self.store.find_documents_by_id(&ids, true).await?);

        let mut conflicts = Vec::new();
        let mut writes = Vec::with_capacity(rows.len());
        for row in rows {
            let master = current.get(&row.new_document_state.id);
            let writable = match (master, &row.assumed_master_state) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(m), Some(assumed)) => self.conflict_handler.is_equal(m, assumed, MASTER_WRITE_CONTEXT),
            };
            match master {
                Some(m) if !writable => conflicts.push(m.clone()),
                _ => writes.push(BulkWriteRow {
                    document: self.stamp(row.new_document_state, master),
                    previous: master.cloned(),
                    attachment_data: row.attachment_data,
                }),
            }
        }

        if !writes.is_empty() {
            let response = self.store.bulk_write(writes, MASTER_WRITE_CONTEXT).await?;
            for err in response.error {
                if !err.is_conflict() {
                    return Err(ReplicationError::schema(err.document_id, err.message));
                }
                match err.document_in_db {
                    Some(doc) => conflicts.push(doc),
                    None => warn!(
                        store = %self.store.name(),
                        document_id = %err.document_id,
                        "Master write conflict without stored state"
                    ),
                }
            }
        }
        debug!(store = %self.store.name(), conflicts = conflicts.len(), "Master write done");
        Ok(conflicts)
    }
}

impl ReplicationHandler for StoreReplicationHandler {
    fn master_changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> BoxFuture<'_, DocumentsWithCheckpoint> {
        Box::pin(async move {
            let changed = self.store.changes_since(checkpoint.as_ref(), batch_size).await?;
            Ok(DocumentsWithCheckpoint {
                documents: changed.documents,
                checkpoint: changed.checkpoint.or(checkpoint),
            })
        })
    }

    fn master_write(&self, rows: Vec<MasterWriteRow>) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(self.write(rows))
    }

    fn master_change_stream(&self) -> Option<PullStream> {
        if !self.live {
            return None;
        }
        let name = self.store.name().to_string();
        let rx = self.store.change_stream();
        Some(
            stream::unfold((rx, name), |(mut rx, name)| async move {
                let item = match rx.recv().await {
                    Ok(bulk) => PullStreamItem::Documents(DocumentsWithCheckpoint {
                        documents: bulk.documents,
                        checkpoint: Some(bulk.checkpoint),
                    }),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(store = %name, skipped, "Master change stream lagged, requesting resync");
                        PullStreamItem::Resync
                    }
                    Err(RecvError::Closed) => return None,
                };
                Some((item, (rx, name)))
            })
            .boxed(),
        )
    }

    fn master_attachment_data(
        &self,
        document_id: &str,
        attachment_id: &str,
        digest: &str,
    ) -> BoxFuture<'_, Vec<u8>> {
        let (document_id, attachment_id, digest) =
            (document_id.to_string(), attachment_id.to_string(), digest.to_string());
        Box::pin(async move {
            self.store
                .get_attachment_data(&document_id, &attachment_id, &digest)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::DefaultConflictHandler;
    use crate::document::AttachmentMeta;
    use crate::revision::{default_hash_function, Revision};
    use crate::store::{upsert, MemoryStore};
    use serde_json::json;

    fn handler(store: Arc<MemoryStore>) -> StoreReplicationHandler {
        StoreReplicationHandler::new(store, Arc::new(DefaultConflictHandler), default_hash_function())
    }

    fn row(doc: Document, assumed: Option<Document>) -> MasterWriteRow {
        MasterWriteRow {
            new_document_state: doc,
            assumed_master_state: assumed,
            attachment_data: HashMap::new(),
        }
    }

    fn fork_doc(id: &str, data: serde_json::Value, height: u64) -> Document {
        let mut doc = Document::new(id, data);
        doc.rev = Some(Revision::new(height, "fork"));
        doc
    }

    #[tokio::test]
    async fn test_insert_keeps_pushed_revision() {
        let store = MemoryStore::shared("master");
        let h = handler(store.clone());
        let conflicts = h
            .master_write(vec![row(fork_doc("a", json!({"v": 1}), 1), None)])
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        let stored = store.find_documents_by_id(&["a".to_string()], false).await.unwrap();
        assert_eq!(stored[0].rev_string().as_deref(), Some("1-fork"));
    }

    #[tokio::test]
    async fn test_existing_without_assumed_is_conflict() {
        let store = MemoryStore::shared("master");
        let hash = default_hash_function();
        let master = upsert(store.as_ref(), &hash, Document::new("a", json!({"v": 1})), HashMap::new())
            .await
            .unwrap();
        let conflicts = handler(store)
            .master_write(vec![row(fork_doc("a", json!({"v": 2}), 1), None)])
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].rev, master.rev);
    }

    #[tokio::test]
    async fn test_matching_assumed_writes_above_master() {
        let store = MemoryStore::shared("master");
        let hash = default_hash_function();
        let master = upsert(store.as_ref(), &hash, Document::new("a", json!({"v": 1})), HashMap::new())
            .await
            .unwrap();

        // Fork height not above master: master creates a new revision
        let conflicts = handler(store.clone())
            .master_write(vec![row(fork_doc("a", json!({"v": 2}), 1), Some(master.clone()))])
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        let stored = &store.find_documents_by_id(&["a".to_string()], false).await.unwrap()[0];
        assert_eq!(stored.height(), 2);
        assert_eq!(stored.get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_stale_assumed_is_conflict() {
        let store = MemoryStore::shared("master");
        let hash = default_hash_function();
        let first = upsert(store.as_ref(), &hash, Document::new("a", json!({"v": 1})), HashMap::new())
            .await
            .unwrap();
        upsert(store.as_ref(), &hash, Document::new("a", json!({"v": 5})), HashMap::new())
            .await
            .unwrap();

        let conflicts = handler(store)
            .master_write(vec![row(fork_doc("a", json!({"v": 2}), 3), Some(first))])
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].get("v"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_invalid_row_is_schema_error() {
        let store = MemoryStore::shared("master");
        let meta = AttachmentMeta::for_data("text/plain", b"hello");
        let doc = fork_doc("a", json!({}), 1).with_attachment("f", meta);
        // No blob supplied and none stored
        let err = handler(store).master_write(vec![row(doc, None)]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Schema { .. }));
    }

    #[tokio::test]
    async fn test_changes_since_keeps_checkpoint_when_empty() {
        let store = MemoryStore::shared("master");
        let h = handler(store);
        let out = h.master_changes_since(Some(Checkpoint::sequence(3)), 10).await.unwrap();
        assert!(out.documents.is_empty());
        assert_eq!(out.checkpoint, Some(Checkpoint::sequence(3)));
    }

    #[tokio::test]
    async fn test_change_stream_emits_bulks() {
        let store = MemoryStore::shared("master");
        let h = handler(store.clone());
        let mut stream = h.master_change_stream().unwrap();

        upsert(store.as_ref(), &default_hash_function(), Document::new("a", json!({})), HashMap::new())
            .await
            .unwrap();
        match stream.next().await {
            Some(PullStreamItem::Documents(batch)) => {
                assert_eq!(batch.documents.len(), 1);
                assert!(batch.checkpoint.is_some());
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn test_without_stream_has_no_stream() {
        let store = MemoryStore::shared("master");
        let h = StoreReplicationHandler::without_stream(store, Arc::new(DefaultConflictHandler), default_hash_function());
        assert!(h.master_change_stream().is_none());
    }
}
