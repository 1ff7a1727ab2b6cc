// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistent document store backed by SQLite.
//!
//! Used for forks and meta stores that must survive restarts: replication
//! resumes from the checkpoints and assumed master states kept here.
//!
//! # Layout
//!
//! ```text
//! documents(id PK, seq UNIQUE, deleted, rev, lwt, body, updated_at)
//! attachments(doc_id, attachment_id, digest, data)  PK(doc_id, attachment_id)
//! ```
//!
//! `body` is the full document as JSON. `seq` is the change feed position of
//! the document's latest write, so the feed is `ORDER BY seq`.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement (and every bulk write transaction as a whole)
//! is retried with exponential backoff before the error is surfaced.
//!
//! # Write Ordering
//!
//! Bulk writes are serialized by an async mutex that also owns the last
//! assigned sequence. The change bulk is broadcast before the mutex is
//! released, so subscribers observe bulks in feed order.

use super::{
    resume_sequence, validate_write, BoxFuture, BulkWriteResponse, BulkWriteRow, ChangeEventBulk,
    ChangedDocuments, Checkpoint, DocumentStore, StoreQuery, CHANGE_STREAM_CAPACITY,
};
use crate::document::Document;
use crate::error::{is_busy, ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_busy(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_busy(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn decode_body(body: &str) -> std::result::Result<Document, sqlx::Error> {
    serde_json::from_str(body).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

async fn fetch_document(conn: &mut SqliteConnection, id: &str) -> std::result::Result<Option<Document>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as("SELECT body FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|(body,)| decode_body(&body)).transpose()
}

async fn fetch_digests(
    conn: &mut SqliteConnection,
    id: &str,
) -> std::result::Result<HashMap<String, String>, sqlx::Error> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT attachment_id, digest FROM attachments WHERE doc_id = ?")
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Document store persisted in a SQLite database.
pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
    /// Serializes writers; holds the last assigned feed sequence.
    write_lock: Mutex<u64>,
    events: broadcast::Sender<ChangeEventBulk>,
    closed: AtomicBool,
    path: String,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub async fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(name.into(), pool, path_str).await
    }

    /// Private in-memory database (single connection, gone when closed).
    pub async fn in_memory(name: impl Into<String>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite options: {}", e)))?;
        // Every connection to :memory: is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(name.into(), pool, ":memory:".to_string()).await
    }

    async fn init(name: String, pool: SqlitePool, path: String) -> Result<Self> {
        info!(store = %name, path = %path, "Initializing SQLite document store");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL UNIQUE,
                deleted INTEGER NOT NULL,
                rev TEXT NOT NULL,
                lwt REAL NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                doc_id TEXT NOT NULL,
                attachment_id TEXT NOT NULL,
                digest TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (doc_id, attachment_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let (last_seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM documents")
            .fetch_one(&pool)
            .await?;
        if last_seq > 0 {
            info!(store = %name, last_seq, "Restored document store from previous run");
        }

        let (events, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Ok(Self {
            name,
            pool,
            write_lock: Mutex::new(last_seq as u64),
            events,
            closed: AtomicBool::new(false),
            path,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicationError::storage(
                operation,
                format!("store {} is closed", self.name),
            ));
        }
        Ok(())
    }

    /// Apply all rows in one transaction. Returns the response and the last
    /// sequence assigned.
    async fn apply_bulk(
        &self,
        rows: &[BulkWriteRow],
        mut seq: u64,
    ) -> std::result::Result<(BulkWriteResponse, u64), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut response = BulkWriteResponse::default();
        let now = chrono::Utc::now().timestamp_millis();

        for row in rows {
            let id = row.document.id.as_str();
            let current = fetch_document(&mut tx, id).await?;
            let digests = fetch_digests(&mut tx, id).await?;
            let checked = validate_write(current.as_ref(), row, |attachment_id, digest| {
                digests.get(attachment_id).map(|d| d == digest).unwrap_or(false)
            });
            if let Err(err) = checked {
                response.error.push(err);
                continue;
            }

            let mut doc = row.document.clone();
            if doc.deleted {
                doc.attachments.clear();
            }
            seq += 1;
            let body = serde_json::to_string(&doc).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
            let rev = doc.rev_string().unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO documents (id, seq, deleted, rev, lwt, body, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    seq = excluded.seq,
                    deleted = excluded.deleted,
                    rev = excluded.rev,
                    lwt = excluded.lwt,
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(seq as i64)
            .bind(doc.deleted)
            .bind(&rev)
            .bind(doc.meta.lwt)
            .bind(&body)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for (attachment_id, digest) in &digests {
                let keep = doc
                    .attachments
                    .get(attachment_id)
                    .map(|meta| &meta.digest == digest)
                    .unwrap_or(false);
                if !keep {
                    sqlx::query("DELETE FROM attachments WHERE doc_id = ? AND attachment_id = ?")
                        .bind(id)
                        .bind(attachment_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            for (attachment_id, meta) in &doc.attachments {
                if let Some(bytes) = row.attachment_data.get(&meta.digest) {
                    sqlx::query(
                        r#"
                        INSERT INTO attachments (doc_id, attachment_id, digest, data)
                        VALUES (?, ?, ?, ?)
                        ON CONFLICT(doc_id, attachment_id) DO UPDATE SET
                            digest = excluded.digest,
                            data = excluded.data
                        "#,
                    )
                    .bind(id)
                    .bind(attachment_id)
                    .bind(&meta.digest)
                    .bind(bytes.as_slice())
                    .execute(&mut *tx)
                    .await?;
                }
            }

            response.success.push(doc);
        }

        tx.commit().await?;
        Ok((response, seq))
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!(store = %self.name, "WAL checkpoint complete");
        Ok(())
    }
}

impl DocumentStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> BoxFuture<'_, BulkWriteResponse> {
        let context = context.to_string();
        Box::pin(async move {
            self.ensure_open("bulk_write")?;
            let mut last_seq = self.write_lock.lock().await;
            let start = *last_seq;

            let (response, seq) =
                execute_with_retry("bulk_write", || self.apply_bulk(&rows, start)).await?;
            *last_seq = seq;

            if !response.success.is_empty() {
                debug!(
                    store = %self.name,
                    context = %context,
                    written = response.success.len(),
                    rejected = response.error.len(),
                    "Bulk write committed"
                );
                let _ = self.events.send(ChangeEventBulk {
                    documents: response.success.clone(),
                    checkpoint: Checkpoint::sequence(seq),
                    context,
                });
            }
            Ok(response)
        })
    }

    fn find_documents_by_id(&self, ids: &[String], include_deleted: bool) -> BoxFuture<'_, Vec<Document>> {
        let ids = ids.to_vec();
        Box::pin(async move {
            self.ensure_open("find_documents_by_id")?;
            let pool = &self.pool;
            let mut found = Vec::with_capacity(ids.len());
            for id in &ids {
                let doc = execute_with_retry("find_documents_by_id", || async {
                    let mut conn = pool.acquire().await?;
                    fetch_document(&mut conn, id).await
                })
                .await?;
                if let Some(doc) = doc {
                    if include_deleted || !doc.deleted {
                        found.push(doc);
                    }
                }
            }
            Ok(found)
        })
    }

    fn query(&self, query: StoreQuery) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(async move {
            self.ensure_open("query")?;
            let pool = &self.pool;
            let include_deleted = query.include_deleted;
            // Paging runs in SQL only when no selector filters rows afterwards;
            // LIMIT -1 is unbounded in SQLite
            let paged = query.selector.is_empty();
            let (limit, offset) = if paged {
                (
                    query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX)),
                    i64::try_from(query.skip).unwrap_or(i64::MAX),
                )
            } else {
                (-1, 0)
            };
            let rows: Vec<(String,)> = execute_with_retry("query", || async {
                sqlx::query_as(
                    "SELECT body FROM documents WHERE (?1 OR deleted = 0) ORDER BY id LIMIT ?2 OFFSET ?3",
                )
                .bind(include_deleted)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
            })
            .await?;
            let docs = rows
                .iter()
                .map(|(body,)| decode_body(body))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if paged {
                return Ok(docs);
            }
            Ok(query.apply(docs.iter()))
        })
    }

    fn changes_since(&self, checkpoint: Option<&Checkpoint>, limit: usize) -> BoxFuture<'_, ChangedDocuments> {
        let after = resume_sequence(&self.name, checkpoint);
        let checkpoint = checkpoint.cloned();
        Box::pin(async move {
            self.ensure_open("changes_since")?;
            let pool = &self.pool;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows: Vec<(i64, String)> = execute_with_retry("changes_since", || async {
                sqlx::query_as("SELECT seq, body FROM documents WHERE seq > ? ORDER BY seq LIMIT ?")
                    .bind(after as i64)
                    .bind(limit)
                    .fetch_all(pool)
                    .await
            })
            .await?;

            let last = rows.last().map(|(seq, _)| Checkpoint::sequence(*seq as u64));
            let documents = rows
                .iter()
                .map(|(_, body)| decode_body(body))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ChangedDocuments {
                documents,
                checkpoint: last.or(checkpoint),
            })
        })
    }

    fn change_stream(&self) -> broadcast::Receiver<ChangeEventBulk> {
        self.events.subscribe()
    }

    fn get_attachment_data(&self, document_id: &str, attachment_id: &str, digest: &str) -> BoxFuture<'_, Vec<u8>> {
        let document_id = document_id.to_string();
        let attachment_id = attachment_id.to_string();
        let digest = digest.to_string();
        Box::pin(async move {
            self.ensure_open("get_attachment_data")?;
            let pool = &self.pool;
            let row: Option<(Vec<u8>,)> = execute_with_retry("get_attachment_data", || async {
                sqlx::query_as(
                    "SELECT data FROM attachments WHERE doc_id = ? AND attachment_id = ? AND digest = ?",
                )
                .bind(&document_id)
                .bind(&attachment_id)
                .bind(&digest)
                .fetch_optional(pool)
                .await
            })
            .await?;
            row.map(|(data,)| data).ok_or_else(|| {
                ReplicationError::storage(
                    "get_attachment_data",
                    format!("attachment {}/{} ({}) not found", document_id, attachment_id, digest),
                )
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            // Wait for an in-flight write to finish
            let _guard = self.write_lock.lock().await;
            if let Err(e) = self.checkpoint_wal().await {
                warn!(store = %self.name, error = %e, "Failed to checkpoint WAL on close");
            }
            self.pool.close().await;
            info!(store = %self.name, "SQLite document store closed");
            Ok(())
        })
    }

    fn remove(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open("remove")?;
            {
                let mut last_seq = self.write_lock.lock().await;
                let pool = &self.pool;
                execute_with_retry("remove", || async {
                    sqlx::query("DELETE FROM attachments").execute(pool).await?;
                    sqlx::query("DELETE FROM documents").execute(pool).await
                })
                .await?;
                *last_seq = 0;
            }
            info!(store = %self.name, "SQLite document store removed");
            self.close().await
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
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_store_basic() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open("fork", dir.path().join("fork.db")).await.unwrap();
        let hash = default_hash_function();

        let v1 = upsert(&store, &hash, Document::new("a", json!({"n": 1})), HashMap::new())
            .await
            .unwrap();
        let v2 = upsert(&store, &hash, Document::new("a", json!({"n": 2})), HashMap::new())
            .await
            .unwrap();
        assert_eq!(v1.height(), 1);
        assert_eq!(v2.height(), 2);

        let found = store.find_documents_by_id(&["a".to_string()], false).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rev, v2.rev);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_store_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let hash = default_hash_function();

        {
            let store = SqliteStore::open("fork", &path).await.unwrap();
            upsert(&store, &hash, Document::new("a", json!({"n": 1})), HashMap::new())
                .await
                .unwrap();
            upsert(&store, &hash, Document::new("b", json!({"n": 1})), HashMap::new())
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        {
            let store = SqliteStore::open("fork", &path).await.unwrap();
            let changes = store.changes_since(None, 10).await.unwrap();
            assert_eq!(changes.documents.len(), 2);
            assert_eq!(changes.checkpoint, Some(Checkpoint::sequence(2)));

            // Sequence continues where it left off
            let mut rx = store.change_stream();
            upsert(&store, &hash, Document::new("c", json!({})), HashMap::new())
                .await
                .unwrap();
            assert_eq!(rx.recv().await.unwrap().checkpoint, Checkpoint::sequence(3));
            store.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sqlite_store_conflict_returns_document_in_db() {
        let store = SqliteStore::in_memory("master").await.unwrap();
        let hash = default_hash_function();
        upsert(&store, &hash, Document::new("a", json!({"n": 1})), HashMap::new())
            .await
            .unwrap();

        let mut insert = Document::new("a", json!({"n": 9}));
        insert.rev = Some(crate::revision::create_revision(&hash, &insert, None));
        let response = store
            .bulk_write(vec![BulkWriteRow::new(insert, None)], "test")
            .await
            .unwrap();
        assert!(response.success.is_empty());
        assert!(response.error[0].is_conflict());
        assert_eq!(
            response.error[0].document_in_db.as_ref().unwrap().get("n"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn test_sqlite_store_attachments() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open("fork", dir.path().join("att.db")).await.unwrap();
        let hash = default_hash_function();
        let meta = AttachmentMeta::for_data("image/png", b"\x89PNG");
        let mut data = HashMap::new();
        data.insert(meta.digest.clone(), b"\x89PNG".to_vec());
        upsert(&store, &hash, Document::new("a", json!({})).with_attachment("img", meta.clone()), data)
            .await
            .unwrap();

        assert_eq!(
            store.get_attachment_data("a", "img", &meta.digest).await.unwrap(),
            b"\x89PNG"
        );

        delete_document(&store, &hash, "a").await.unwrap();
        assert!(store.get_attachment_data("a", "img", &meta.digest).await.is_err());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_store_query_and_deleted() {
        let store = SqliteStore::in_memory("q").await.unwrap();
        let hash = default_hash_function();
        for id in ["b", "a", "c"] {
            upsert(&store, &hash, Document::new(id, json!({"kind": "x"})), HashMap::new())
                .await
                .unwrap();
        }
        delete_document(&store, &hash, "b").await.unwrap();

        let live = store.query(StoreQuery::all()).await.unwrap();
        let ids: Vec<_> = live.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let all = store
            .query(StoreQuery { include_deleted: true, ..StoreQuery::all() })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_sqlite_store_query_paging_and_selector() {
        let store = SqliteStore::in_memory("paging").await.unwrap();
        let hash = default_hash_function();
        for (id, kind) in [("a", "x"), ("b", "y"), ("c", "x"), ("d", "x"), ("e", "y")] {
            upsert(&store, &hash, Document::new(id, json!({"kind": kind})), HashMap::new())
                .await
                .unwrap();
        }
        delete_document(&store, &hash, "c").await.unwrap();

        let page = store
            .query(StoreQuery { skip: 1, limit: Some(2), ..StoreQuery::all() })
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);

        let page = store
            .query(StoreQuery { include_deleted: true, skip: 1, limit: Some(2), ..StoreQuery::all() })
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        // Skip and limit count matching rows only
        let xs = store
            .query(StoreQuery { skip: 1, limit: Some(5), ..StoreQuery::all() }.with_field("kind", json!("x")))
            .await
            .unwrap();
        let ids: Vec<_> = xs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d"]);
    }

    #[tokio::test]
    async fn test_sqlite_store_closed_rejects() {
        let store = SqliteStore::in_memory("closed").await.unwrap();
        store.close().await.unwrap();
        assert!(store.changes_since(None, 1).await.is_err());
        // Closing twice is fine
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_store_path() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open("p", dir.path().join("test_path.db")).await.unwrap();
        assert!(store.path().contains("test_path.db"));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }
}
