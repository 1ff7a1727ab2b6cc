//! In-memory document store.
//!
//! Every successful write gets the next value of a per-store sequence; the
//! change feed is the documents ordered by the sequence of their latest
//! write. Change bulks are broadcast while the write lock is held, so
//! subscribers see them in sequence order.

use super::{
    resume_sequence, validate_write, BoxFuture, BulkWriteResponse, BulkWriteRow, ChangeEventBulk,
    ChangedDocuments, Checkpoint, DocumentStore, StoreQuery, CHANGE_STREAM_CAPACITY,
};
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

struct Entry {
    doc: Document,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Entry>,
    by_seq: BTreeMap<u64, String>,
    /// (document id, attachment id) -> (digest, bytes)
    blobs: HashMap<(String, String), (String, Vec<u8>)>,
    last_seq: u64,
    closed: bool,
}

impl Inner {
    fn ensure_open(&self, store: &str, operation: &str) -> Result<()> {
        if self.closed {
            return Err(ReplicationError::storage(
                operation,
                format!("store {} is closed", store),
            ));
        }
        Ok(())
    }

    fn apply(&mut self, row: BulkWriteRow) -> Document {
        let mut doc = row.document;
        let id = doc.id.clone();
        self.last_seq += 1;
        let seq = self.last_seq;

        if let Some(old) = self.docs.get(&id) {
            self.by_seq.remove(&old.seq);
        }

        if doc.deleted {
            doc.attachments.clear();
        }
        let attachments = &doc.attachments;
        self.blobs.retain(|(doc_id, attachment_id), (digest, _)| {
            doc_id != &id
                || attachments
                    .get(attachment_id)
                    .map(|meta| &meta.digest == digest)
                    .unwrap_or(false)
        });
        for (attachment_id, meta) in attachments {
            if let Some(bytes) = row.attachment_data.get(&meta.digest) {
                self.blobs.insert(
                    (id.clone(), attachment_id.clone()),
                    (meta.digest.clone(), bytes.clone()),
                );
            }
        }

        self.by_seq.insert(seq, id.clone());
        self.docs.insert(id, Entry { doc: doc.clone(), seq });
        doc
    }
}

/// Document store held entirely in memory.
pub struct MemoryStore {
    name: String,
    inner: RwLock<Inner>,
    events: broadcast::Sender<ChangeEventBulk>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Convenience for the common `Arc<dyn DocumentStore>` wiring.
    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// Number of live (non-deleted) documents.
    pub async fn count(&self) -> usize {
        self.inner
            .read()
            .await
            .docs
            .values()
            .filter(|entry| !entry.doc.deleted)
            .count()
    }

    /// Number of stored attachment blobs.
    pub async fn blob_count(&self) -> usize {
        self.inner.read().await.blobs.len()
    }
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> BoxFuture<'_, BulkWriteResponse> {
        let context = context.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            inner.ensure_open(&self.name, "bulk_write")?;

            let mut response = BulkWriteResponse::default();
            for row in rows {
                let checked = {
                    let id = &row.document.id;
                    let current = inner.docs.get(id).map(|entry| &entry.doc);
                    validate_write(current, &row, |attachment_id, digest| {
                        inner
                            .blobs
                            .get(&(id.clone(), attachment_id.to_string()))
                            .map(|(stored, _)| stored == digest)
                            .unwrap_or(false)
                    })
                };
                match checked {
                    Ok(()) => response.success.push(inner.apply(row)),
                    Err(err) => response.error.push(err),
                }
            }

            if !response.success.is_empty() {
                debug!(
                    store = %self.name,
                    context = %context,
                    written = response.success.len(),
                    rejected = response.error.len(),
                    "Bulk write applied"
                );
                // No subscribers is fine
                let _ = self.events.send(ChangeEventBulk {
                    documents: response.success.clone(),
                    checkpoint: Checkpoint::sequence(inner.last_seq),
                    context,
                });
            }
            Ok(response)
        })
    }

    fn find_documents_by_id(&self, ids: &[String], include_deleted: bool) -> BoxFuture<'_, Vec<Document>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            let inner = self.inner.read().await;
            inner.ensure_open(&self.name, "find_documents_by_id")?;
            Ok(ids
                .iter()
                .filter_map(|id| inner.docs.get(id))
                .filter(|entry| include_deleted || !entry.doc.deleted)
                .map(|entry| entry.doc.clone())
                .collect())
        })
    }

    fn query(&self, query: StoreQuery) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            inner.ensure_open(&self.name, "query")?;
            Ok(query.apply(inner.docs.values().map(|entry| &entry.doc)))
        })
    }

    fn changes_since(&self, checkpoint: Option<&Checkpoint>, limit: usize) -> BoxFuture<'_, ChangedDocuments> {
        let after = resume_sequence(&self.name, checkpoint);
        let checkpoint = checkpoint.cloned();
        Box::pin(async move {
            let inner = self.inner.read().await;
            inner.ensure_open(&self.name, "changes_since")?;

            let mut last = None;
            let documents: Vec<Document> = inner
                .by_seq
                .range(after + 1..)
                .take(limit)
                .filter_map(|(seq, id)| {
                    last = Some(*seq);
                    inner.docs.get(id).map(|entry| entry.doc.clone())
                })
                .collect();

            Ok(ChangedDocuments {
                documents,
                checkpoint: last.map(Checkpoint::sequence).or(checkpoint),
            })
        })
    }

    fn change_stream(&self) -> broadcast::Receiver<ChangeEventBulk> {
        self.events.subscribe()
    }

    fn get_attachment_data(&self, document_id: &str, attachment_id: &str, digest: &str) -> BoxFuture<'_, Vec<u8>> {
        let key = (document_id.to_string(), attachment_id.to_string());
        let digest = digest.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            inner.ensure_open(&self.name, "get_attachment_data")?;
            match inner.blobs.get(&key) {
                Some((stored, bytes)) if *stored == digest => Ok(bytes.clone()),
                _ => Err(ReplicationError::storage(
                    "get_attachment_data",
                    format!("attachment {}/{} ({}) not found", key.0, key.1, digest),
                )),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.write().await.closed = true;
            debug!(store = %self.name, "Memory store closed");
            Ok(())
        })
    }

    fn remove(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            *inner = Inner::default();
            inner.closed = true;
            debug!(store = %self.name, "Memory store removed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::AttachmentMeta;
    use crate::revision::default_hash_function;
    use crate::store::{delete_document, upsert};
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_update_and_find() {
        let store = MemoryStore::new("test");
        let hash = default_hash_function();

        let v1 = upsert(&store, &hash, Document::new("a", json!({"n": 1})), HashMap::new())
            .await
            .unwrap();
        assert_eq!(v1.height(), 1);

        let v2 = upsert(&store, &hash, Document::new("a", json!({"n": 2})), HashMap::new())
            .await
            .unwrap();
        assert_eq!(v2.height(), 2);

        let found = store.find_documents_by_id(&["a".to_string(), "missing".to_string()], false).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("n"), Some(&json!(2)));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_previous_is_conflict() {
        let store = MemoryStore::new("test");
        let hash = default_hash_function();
        let v1 = upsert(&store, &hash, Document::new("a", json!({"n": 1})), HashMap::new())
            .await
            .unwrap();
        upsert(&store, &hash, Document::new("a", json!({"n": 2})), HashMap::new())
            .await
            .unwrap();

        let mut stale = Document::new("a", json!({"n": 3}));
        stale.rev = Some(crate::revision::create_revision(&hash, &stale, Some(&v1)));
        let response = store
            .bulk_write(vec![BulkWriteRow::new(stale, Some(v1))], "test")
            .await
            .unwrap();
        assert!(response.success.is_empty());
        assert!(response.error[0].is_conflict());
        assert_eq!(
            response.error[0].document_in_db.as_ref().unwrap().get("n"),
            Some(&json!(2))
        );
    }

    #[tokio::test]
    async fn test_changes_since_returns_latest_versions_in_feed_order() {
        let store = MemoryStore::new("test");
        let hash = default_hash_function();
        for id in ["a", "b", "c"] {
            upsert(&store, &hash, Document::new(id, json!({"v": 1})), HashMap::new())
                .await
                .unwrap();
        }
        upsert(&store, &hash, Document::new("a", json!({"v": 2})), HashMap::new())
            .await
            .unwrap();

        let all = store.changes_since(None, 10).await.unwrap();
        let ids: Vec<_> = all.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(all.documents[2].get("v"), Some(&json!(2)));

        let first = store.changes_since(None, 2).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        let rest = store.changes_since(first.checkpoint.as_ref(), 10).await.unwrap();
        assert_eq!(rest.documents.len(), 1);
        assert_eq!(rest.documents[0].id, "a");

        let none = store.changes_since(rest.checkpoint.as_ref(), 10).await.unwrap();
        assert!(none.documents.is_empty());
        assert_eq!(none.checkpoint, rest.checkpoint);
    }

    #[tokio::test]
    async fn test_change_stream_carries_context() {
        let store = MemoryStore::new("test");
        let mut rx = store.change_stream();
        let hash = default_hash_function();
        upsert(&store, &hash, Document::new("a", json!({})), HashMap::new())
            .await
            .unwrap();

        let bulk = rx.recv().await.unwrap();
        assert_eq!(bulk.context, "upsert");
        assert_eq!(bulk.documents.len(), 1);
        assert_eq!(bulk.checkpoint, Checkpoint::sequence(1));
    }

    #[tokio::test]
    async fn test_attachments_stored_and_dropped_on_delete() {
        let store = MemoryStore::new("test");
        let hash = default_hash_function();
        let meta = AttachmentMeta::for_data("text/plain", b"payload");
        let doc = Document::new("a", json!({})).with_attachment("file", meta.clone());
        let mut data = HashMap::new();
        data.insert(meta.digest.clone(), b"payload".to_vec());
        upsert(&store, &hash, doc, data).await.unwrap();

        let bytes = store.get_attachment_data("a", "file", &meta.digest).await.unwrap();
        assert_eq!(bytes, b"payload");
        assert!(store.get_attachment_data("a", "file", "sha256-other").await.is_err());

        let deleted = delete_document(&store, &hash, "a").await.unwrap();
        assert!(deleted.deleted);
        assert!(deleted.attachments.is_empty());
        assert_eq!(store.blob_count().await, 0);
        assert!(store.get_attachment_data("a", "file", &meta.digest).await.is_err());
    }

    #[tokio::test]
    async fn test_update_keeps_existing_blob_without_resending() {
        let store = MemoryStore::new("test");
        let hash = default_hash_function();
        let meta = AttachmentMeta::for_data("text/plain", b"x");
        let mut data = HashMap::new();
        data.insert(meta.digest.clone(), b"x".to_vec());
        upsert(&store, &hash, Document::new("a", json!({"v": 1})).with_attachment("f", meta.clone()), data)
            .await
            .unwrap();

        let updated = Document::new("a", json!({"v": 2})).with_attachment("f", meta.clone());
        upsert(&store, &hash, updated, HashMap::new()).await.unwrap();
        assert_eq!(store.get_attachment_data("a", "f", &meta.digest).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_query_sorted_with_skip_and_limit() {
        let store = MemoryStore::new("test");
        let hash = default_hash_function();
        for (id, kind) in [("c", "x"), ("a", "x"), ("b", "y"), ("d", "x")] {
            upsert(&store, &hash, Document::new(id, json!({"kind": kind})), HashMap::new())
                .await
                .unwrap();
        }
        let query = StoreQuery {
            skip: 1,
            limit: Some(1),
            ..StoreQuery::all().with_field("kind", json!("x"))
        };
        let docs = store.query(query).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c");
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = MemoryStore::new("test");
        store.close().await.unwrap();
        let err = store.changes_since(None, 1).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_remove_clears_data() {
        let store = MemoryStore::new("test");
        let hash = default_hash_function();
        upsert(&store, &hash, Document::new("a", json!({})), HashMap::new())
            .await
            .unwrap();
        store.remove().await.unwrap();
        assert_eq!(store.count().await, 0);
    }
}
