//! Replication meta records.
//!
//! The meta store is an ordinary [`DocumentStore`] owned by one replication
//! state. It holds two record kinds under the replication identifier:
//!
//! ```text
//! <identifier>|<documentId>|0   assumed master state of one fork document
//! <identifier>|up|1             upstream checkpoint (fork change feed)
//! <identifier>|down|1           downstream checkpoint (master change feed)
//! ```
//!
//! Record payload fields: `identifier`, `itemId`, `isCheckpoint` (`"0"`/`"1"`),
//! then `docData` + optional `isResolvedConflict` for assumed states, or
//! `checkpointData` for checkpoints.
//!
//! Setting a checkpoint to byte-identical data is a no-op, so idle polling
//! never grows the meta store.

use crate::coordinator::Direction;
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::revision::{create_revision, now_lwt, HashFunction, Revision};
use crate::store::{index_by_id, BulkWriteRow, Checkpoint, DocumentStore};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Separator inside composed meta ids. Identifiers must not contain it.
pub const META_ID_SEPARATOR: char = '|';

/// Attempts before giving up on a contended meta write.
const META_WRITE_MAX_ATTEMPTS: usize = 5;

/// Composed meta record id.
pub fn composed_id(identifier: &str, item_id: &str, is_checkpoint: bool) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        identifier,
        item_id,
        if is_checkpoint { "1" } else { "0" },
        sep = META_ID_SEPARATOR
    )
}

/// The fork's last-known master state for one document.
#[derive(Debug, Clone)]
pub struct AssumedMasterState {
    pub document: Document,
    /// The stored meta record (used as `previous` when rewriting it).
    pub meta_document: Document,
    /// Fork revision produced by the last conflict resolution, if any.
    pub is_resolved_conflict: Option<String>,
}

/// Access to the meta store for one replication identifier.
pub struct MetaInstance {
    store: Arc<dyn DocumentStore>,
    identifier: String,
    hash_function: HashFunction,
    /// Last known checkpoint record per direction. The lock also
    /// serializes checkpoint writes.
    checkpoints: Mutex<HashMap<Direction, Document>>,
}

impl MetaInstance {
    pub fn new(store: Arc<dyn DocumentStore>, identifier: impl Into<String>, hash_function: HashFunction) -> Self {
        Self {
            store,
            identifier: identifier.into(),
            hash_function,
            checkpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Assumed master states for the given fork document ids. Documents
    /// without a (readable) record are absent.
    pub async fn assumed_master_states(&self, ids: &[String]) -> Result<HashMap<String, AssumedMasterState>> {
        let meta_ids: Vec<String> = ids
            .iter()
            .map(|id| composed_id(&self.identifier, id, false))
            .collect();
        let found = self.store.find_documents_by_id(&meta_ids, false).await?;

        let mut states = HashMap::with_capacity(found.len());
        for meta_document in found {
            let Some(item_id) = meta_document.get("itemId").and_then(Value::as_str).map(str::to_string) else {
                warn!(meta_id = %meta_document.id, "Meta record without itemId, ignoring");
                continue;
            };
            let parsed = meta_document
                .get("docData")
                .cloned()
                .map(serde_json::from_value::<Document>);
            let document = match parsed {
                Some(Ok(doc)) => doc,
                other => {
                    let reason = match other {
                        Some(Err(e)) => e.to_string(),
                        _ => "missing docData".to_string(),
                    };
                    warn!(meta_id = %meta_document.id, reason = %reason, "Unreadable assumed master state, treating as absent");
                    continue;
                }
            };
            let is_resolved_conflict = meta_document
                .get("isResolvedConflict")
                .and_then(Value::as_str)
                .map(str::to_string);
            states.insert(
                item_id,
                AssumedMasterState {
                    document,
                    meta_document,
                    is_resolved_conflict,
                },
            );
        }
        Ok(states)
    }

    /// Row that records `master_state` as the assumed master state.
    pub fn write_row(
        &self,
        master_state: &Document,
        previous: Option<&Document>,
        resolved_conflict_rev: Option<&Revision>,
    ) -> Result<BulkWriteRow> {
        let doc_data = serde_json::to_value(master_state)
            .map_err(|e| ReplicationError::Internal(format!("encode assumed master state: {}", e)))?;
        let mut data = json!({
            "identifier": self.identifier,
            "itemId": master_state.id,
            "isCheckpoint": "0",
            "docData": doc_data,
        });
        if let Some(rev) = resolved_conflict_rev {
            data["isResolvedConflict"] = Value::String(rev.to_string());
        }
        let document = Document::new(composed_id(&self.identifier, &master_state.id, false), data);
        Ok(self.stamp(document, previous.cloned()))
    }

    /// Write assumed-state rows. A row that lost a race against another
    /// meta write is re-applied on top of the stored record.
    pub async fn write_rows(&self, rows: Vec<BulkWriteRow>, context: &str) -> Result<()> {
        let mut pending = rows;
        for _ in 0..META_WRITE_MAX_ATTEMPTS {
            if pending.is_empty() {
                return Ok(());
            }
            let mut by_id = index_by_id(pending.iter().map(|row| row.document.clone()));
            let response = self.store.bulk_write(pending, context).await?;
            pending = Vec::new();
            for err in response.error {
                if !err.is_conflict() {
                    return Err(err.into_error());
                }
                if let Some(doc) = by_id.remove(&err.document_id) {
                    debug!(meta_id = %err.document_id, "Meta write raced, re-applying");
                    pending.push(self.stamp(doc, err.document_in_db));
                }
            }
        }
        if pending.is_empty() {
            Ok(())
        } else {
            Err(ReplicationError::storage(
                context,
                format!("{} meta writes kept conflicting", pending.len()),
            ))
        }
    }

    fn stamp(&self, mut document: Document, previous: Option<Document>) -> BulkWriteRow {
        document.rev = Some(create_revision(&self.hash_function, &document, previous.as_ref()));
        document.meta.lwt = now_lwt();
        BulkWriteRow::new(document, previous)
    }

    async fn checkpoint_document(
        &self,
        cache: &mut HashMap<Direction, Document>,
        direction: Direction,
    ) -> Result<Option<Document>> {
        if let Some(doc) = cache.get(&direction) {
            return Ok(Some(doc.clone()));
        }
        let id = composed_id(&self.identifier, direction.as_str(), true);
        let found = self.store.find_documents_by_id(&[id], false).await?.into_iter().next();
        if let Some(doc) = &found {
            cache.insert(direction, doc.clone());
        }
        Ok(found)
    }

    /// Last stored checkpoint for a direction.
    pub async fn last_checkpoint(&self, direction: Direction) -> Result<Option<Checkpoint>> {
        let mut cache = self.checkpoints.lock().await;
        let doc = self.checkpoint_document(&mut cache, direction).await?;
        Ok(doc
            .and_then(|d| d.get("checkpointData").cloned())
            .filter(|v| !v.is_null())
            .map(Checkpoint))
    }

    /// Persist a checkpoint. Returns `false` when the stored checkpoint was
    /// already byte-identical and nothing was written.
    pub async fn set_checkpoint(&self, direction: Direction, checkpoint: &Checkpoint) -> Result<bool> {
        let mut cache = self.checkpoints.lock().await;
        let mut previous = self.checkpoint_document(&mut cache, direction).await?;

        for _ in 0..META_WRITE_MAX_ATTEMPTS {
            let unchanged = previous
                .as_ref()
                .and_then(|doc| doc.get("checkpointData"))
                .map(|stored| Checkpoint(stored.clone()).is_identical(checkpoint))
                .unwrap_or(false);
            if unchanged {
                crate::metrics::record_checkpoint_write(&self.identifier, direction.as_str(), false);
                return Ok(false);
            }

            let document = Document::new(
                composed_id(&self.identifier, direction.as_str(), true),
                json!({
                    "identifier": self.identifier,
                    "itemId": direction.as_str(),
                    "isCheckpoint": "1",
                    "checkpointData": checkpoint.0,
                }),
            );
            let row = self.stamp(document, previous.clone());
            let response = self.store.bulk_write(vec![row], "replication-set-checkpoint").await?;

            if let Some(written) = response.success.into_iter().next() {
                debug!(identifier = %self.identifier, direction = %direction, "Checkpoint persisted");
                crate::metrics::record_checkpoint_write(&self.identifier, direction.as_str(), true);
                cache.insert(direction, written);
                return Ok(true);
            }
            match response.error.into_iter().next() {
                Some(err) if err.is_conflict() => {
                    // Stored record moved under us; compare again against it
                    previous = err.document_in_db;
                    match &previous {
                        Some(doc) => cache.insert(direction, doc.clone()),
                        None => cache.remove(&direction),
                    };
                }
                Some(err) => return Err(err.into_error()),
                None => return Err(ReplicationError::Internal("checkpoint write returned nothing".to_string())),
            }
        }
        Err(ReplicationError::storage(
            "set_checkpoint",
            format!("checkpoint {} kept conflicting", direction),
        ))
    }
}
