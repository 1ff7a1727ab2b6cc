//! Store and replication setup helpers.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage_replication::store::{delete_document, upsert};
use storage_replication::{
    default_hash_function, ConflictHandler, DefaultConflictHandler, Document, DocumentStore, HashFunction,
    MemoryStore, ReplicationConfig, ReplicationHandler, ReplicationInput, ReplicationState, StoreReplicationHandler,
};

/// Default timeout for sync awaits in tests.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

pub fn hash() -> HashFunction {
    default_hash_function()
}

/// Master handler with a live change stream over `store`.
pub fn live_handler(store: Arc<dyn DocumentStore>) -> Arc<StoreReplicationHandler> {
    Arc::new(StoreReplicationHandler::new(store, Arc::new(DefaultConflictHandler), hash()))
}

/// Master handler without a change stream (polling only).
pub fn polling_handler(store: Arc<dyn DocumentStore>) -> Arc<StoreReplicationHandler> {
    Arc::new(StoreReplicationHandler::without_stream(store, Arc::new(DefaultConflictHandler), hash()))
}

/// One fork/master link over memory stores.
pub struct Link {
    pub fork: Arc<MemoryStore>,
    pub meta: Arc<MemoryStore>,
    pub state: Arc<ReplicationState>,
}

/// Input over fresh memory fork/meta stores.
pub fn memory_input(
    identifier: &str,
    handler: Arc<dyn ReplicationHandler>,
    conflict_handler: Arc<dyn ConflictHandler>,
) -> (ReplicationInput, Arc<MemoryStore>, Arc<MemoryStore>) {
    let fork = MemoryStore::shared(format!("{}-fork", identifier));
    let meta = MemoryStore::shared(format!("{}-meta", identifier));
    let input = ReplicationInput::new(
        ReplicationConfig::for_testing(identifier),
        fork.clone(),
        meta.clone(),
        handler,
    )
    .with_conflict_handler(conflict_handler);
    (input, fork, meta)
}

/// Build a link and start it.
pub async fn start_link(
    identifier: &str,
    handler: Arc<dyn ReplicationHandler>,
    conflict_handler: Arc<dyn ConflictHandler>,
) -> Link {
    let (input, fork, meta) = memory_input(identifier, handler, conflict_handler);
    let state = storage_replication::replicate_storage(input).await.unwrap();
    Link { fork, meta, state }
}

/// Application write of `data` under `id`.
pub async fn write(store: &dyn DocumentStore, id: &str, data: Value) -> Document {
    upsert(store, &hash(), Document::new(id, data), HashMap::new())
        .await
        .unwrap()
}

/// Application write of a document with blobs keyed by digest.
pub async fn write_with_blobs(store: &dyn DocumentStore, doc: Document, blobs: HashMap<String, Vec<u8>>) -> Document {
    upsert(store, &hash(), doc, blobs).await.unwrap()
}

pub async fn delete(store: &dyn DocumentStore, id: &str) -> Document {
    delete_document(store, &hash(), id).await.unwrap()
}

/// Current state including tombstones.
pub async fn get(store: &dyn DocumentStore, id: &str) -> Option<Document> {
    store
        .find_documents_by_id(&[id.to_string()], true)
        .await
        .unwrap()
        .into_iter()
        .next()
}

/// Both stores hold content-equal states for every id in either store.
pub async fn assert_equal_state(a: &dyn DocumentStore, b: &dyn DocumentStore) {
    let left = a.changes_since(None, 100_000).await.unwrap().documents;
    let right = b.changes_since(None, 100_000).await.unwrap().documents;
    let mut ids: Vec<String> = left.iter().chain(right.iter()).map(|d| d.id.clone()).collect();
    ids.sort();
    ids.dedup();
    for id in ids {
        let x = get(a, &id).await;
        let y = get(b, &id).await;
        match (&x, &y) {
            (Some(x), Some(y)) => assert!(
                x.content_eq(y),
                "{} differs between {} and {}: {:?} vs {:?}",
                id,
                a.name(),
                b.name(),
                x,
                y
            ),
            _ => panic!("{} missing on one side: {:?} vs {:?}", id, x, y),
        }
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn in_sync(state: &ReplicationState) {
    tokio::time::timeout(SYNC_TIMEOUT, state.await_in_sync())
        .await
        .expect("replication did not reach in-sync")
        .expect("replication canceled");
}

pub async fn idle(state: &ReplicationState) {
    tokio::time::timeout(SYNC_TIMEOUT, state.await_idle())
        .await
        .expect("replication did not go idle")
        .expect("replication canceled");
}
