// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream engine: fork → master.
//!
//! # Phases
//!
//! 1. **Initial sync**: walk the fork's change feed from the up checkpoint
//!    and push everything. Repeats while a pass wrote resolved conflicts
//!    back into the fork, then marks the first sync done.
//! 2. **Live**: react to the fork's change stream. A burst of bulks is
//!    coalesced (optionally after `wait_before_persist`), deduplicated by id
//!    and pushed in `push_batch_size` chunks.
//!
//! Bulks written by the downstream engine are not pushed back, but their
//! checkpoint still advances the cursor. A lagged fork subscription, a
//! `Resync` marker from the master, or a failed cycle falls back to the
//! initial sync, which restarts from the stored checkpoint. Fork bulks that
//! arrive while that retry is pending are left to it, so the checkpoint
//! never moves past a document that failed to push.
//!
//! # Conflicts
//!
//! Rows the master rejects come back with the master's real state and go
//! through the conflict handler:
//! - Fork state already equal to the master: only the assumed state moves
//! - Otherwise: the resolved document is written to the fork on top of the
//!   pushed state, and pushed again by the next cycle
//!
//! A conflict handler error keeps the checkpoint where it is, so the
//! document stays pending and is retried after the backoff ceiling.

use super::{is_covered, Direction, ResolvedConflict, Shared};
use crate::conflict::{resolve_conflict, ConflictInput};
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::handler::{MasterWriteRow, PullStream, PullStreamItem};
use crate::meta::AssumedMasterState;
use crate::metrics;
use crate::stats::bump;
use crate::store::{BulkWriteRow, ChangeEventBulk, Checkpoint};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

const META_CONTEXT: &str = "replication-up-write-meta";
const CONFLICT_CONTEXT: &str = "replication-up-write-conflict";
const CONFLICT_META_CONTEXT: &str = "replication-up-write-conflict-meta";

enum UpTask {
    Bulk(ChangeEventBulk),
    /// Fork changes may have been missed.
    Resync,
}

enum Wake {
    Canceled,
    Fork(std::result::Result<ChangeEventBulk, RecvError>),
    Master(Option<PullStreamItem>),
    Retry,
}

async fn next_master_item(stream: &mut Option<PullStream>) -> Option<PullStreamItem> {
    match stream {
        Some(s) => s.next().await,
        None => futures::future::pending().await,
    }
}

/// Run until canceled or the fork's change stream closes.
pub(super) async fn run(
    shared: Arc<Shared>,
    mut fork_rx: broadcast::Receiver<ChangeEventBulk>,
    mut master_stream: Option<PullStream>,
) {
    let span = info_span!("upstream", identifier = %shared.identifier);

    async move {
        let mut canceled = shared.canceled.clone();
        let retry_delay = shared.retry.max_delay;
        let mut retry_at: Option<Instant> = None;
        let mut initial_sync_pending = true;

        info!(
            debounced = shared.wait_before_persist.is_some(),
            push_batch_size = shared.config.push_batch_size,
            "Upstream started"
        );

        loop {
            if shared.is_canceled() {
                break;
            }

            if initial_sync_pending {
                initial_sync_pending = false;
                shared.set_active(Direction::Up, true);
                let result = initial_sync(&shared, &mut fork_rx).await;
                shared.set_active(Direction::Up, false);
                match result {
                    // The walk covered whatever a pending retry would redo
                    Ok(()) => retry_at = None,
                    Err(ReplicationError::Canceled) => break,
                    Err(e) => {
                        shared.emit_error(e);
                        retry_at = Some(Instant::now() + retry_delay);
                    }
                }
                continue;
            }

            let wake = tokio::select! {
                _ = canceled.wait_for(|c| *c) => Wake::Canceled,
                bulk = fork_rx.recv() => Wake::Fork(bulk),
                item = next_master_item(&mut master_stream) => Wake::Master(item),
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => Wake::Retry,
            };

            match wake {
                Wake::Canceled => break,
                Wake::Retry => {
                    retry_at = None;
                    debug!("Retrying after failure");
                    initial_sync_pending = true;
                }
                Wake::Master(None) => master_stream = None,
                Wake::Master(Some(PullStreamItem::Resync)) => {
                    info!("Master requested resync, re-running initial sync");
                    initial_sync_pending = true;
                }
                // Downstream applies master bulks
                Wake::Master(Some(PullStreamItem::Documents(_))) => {}
                Wake::Fork(Err(RecvError::Closed)) => {
                    warn!("Fork change stream closed, stopping upstream");
                    break;
                }
                Wake::Fork(Err(RecvError::Lagged(skipped))) if retry_at.is_some() => {
                    debug!(skipped, "Fork change stream lagged while a retry is pending");
                }
                Wake::Fork(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Fork change stream lagged, re-running initial sync");
                    initial_sync_pending = true;
                }
                Wake::Fork(Ok(_)) if retry_at.is_some() => {
                    // Pushing a later bulk would move the checkpoint past the
                    // failed documents; the retry walks from the stored one.
                    bump(&shared.stats.up.fork_change_stream_emit);
                    let mut deferred = 1;
                    loop {
                        match fork_rx.try_recv() {
                            Ok(_) => {
                                bump(&shared.stats.up.fork_change_stream_emit);
                                deferred += 1;
                            }
                            Err(TryRecvError::Lagged(_)) => {}
                            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                        }
                    }
                    debug!(deferred, "Fork bulks left for the pending retry");
                }
                Wake::Fork(Ok(bulk)) => {
                    bump(&shared.stats.up.fork_change_stream_emit);
                    shared.set_active(Direction::Up, true);

                    if let Some(wait) = &shared.wait_before_persist {
                        let stop = tokio::select! {
                            _ = wait() => false,
                            _ = canceled.wait_for(|c| *c) => true,
                        };
                        if stop {
                            shared.set_active(Direction::Up, false);
                            break;
                        }
                    }

                    let mut tasks = vec![UpTask::Bulk(bulk)];
                    loop {
                        match fork_rx.try_recv() {
                            Ok(bulk) => {
                                bump(&shared.stats.up.fork_change_stream_emit);
                                tasks.push(UpTask::Bulk(bulk));
                            }
                            Err(TryRecvError::Lagged(_)) => tasks.push(UpTask::Resync),
                            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                        }
                    }

                    let result = process_tasks(&shared, tasks).await;
                    shared.set_active(Direction::Up, false);
                    match result {
                        Ok(resync) => initial_sync_pending = resync,
                        Err(ReplicationError::Canceled) => break,
                        Err(e) => {
                            shared.emit_error(e);
                            retry_at = Some(Instant::now() + retry_delay);
                        }
                    }
                }
            }
        }

        info!("Upstream stopped");
    }
    .instrument(span)
    .await
}

/// Push everything after the up checkpoint, repeating while a pass wrote
/// resolved conflicts into the fork.
async fn initial_sync(shared: &Shared, fork_rx: &mut broadcast::Receiver<ChangeEventBulk>) -> Result<()> {
    loop {
        bump(&shared.stats.up.upstream_initial_sync);

        // Buffered bulks are covered by the walk below
        loop {
            match fork_rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let mut checkpoint = shared.meta.last_checkpoint(Direction::Up).await?;
        let mut had_conflict_writes = false;
        loop {
            if shared.is_canceled() {
                return Err(ReplicationError::Canceled);
            }
            let changed = shared
                .fork
                .changes_since(checkpoint.as_ref(), shared.config.push_batch_size)
                .await?;
            let Some(next) = changed.checkpoint.filter(|_| !changed.documents.is_empty()) else {
                break;
            };
            had_conflict_writes |= persist_to_master(shared, changed.documents, next.clone()).await?;
            checkpoint = Some(next);
        }

        if !had_conflict_writes {
            break;
        }
        debug!("Initial sync wrote resolved conflicts, running another pass");
    }

    shared.mark_first_sync(Direction::Up);
    Ok(())
}

/// Returns whether a full initial sync is needed instead.
async fn process_tasks(shared: &Shared, tasks: Vec<UpTask>) -> Result<bool> {
    bump(&shared.stats.up.process_tasks);

    let mut documents = Vec::new();
    let mut checkpoint = None;
    for task in tasks {
        match task {
            UpTask::Resync => {
                warn!("Fork change stream lagged during burst, re-running initial sync");
                return Ok(true);
            }
            UpTask::Bulk(bulk) => {
                if bulk.context != shared.downstream_flag {
                    documents.extend(bulk.documents);
                }
                checkpoint = Some(bulk.checkpoint);
            }
        }
    }

    let Some(checkpoint) = checkpoint else {
        return Ok(false);
    };
    let reached = shared.meta.last_checkpoint(Direction::Up).await?;
    if is_covered(&checkpoint, reached.as_ref()) {
        debug!(checkpoint = %checkpoint.0, "Fork bulk already pushed, skipping");
        return Ok(false);
    }
    persist_to_master(shared, documents, checkpoint).await?;
    Ok(false)
}

/// Push fork documents, handle conflicts and advance the up checkpoint.
/// Returns whether resolved conflicts were written into the fork.
async fn persist_to_master(shared: &Shared, documents: Vec<Document>, checkpoint: Checkpoint) -> Result<bool> {
    bump(&shared.stats.up.persist_to_master);

    // Latest state per id wins
    let mut ids: Vec<String> = Vec::with_capacity(documents.len());
    let mut latest: HashMap<String, Document> = HashMap::with_capacity(documents.len());
    for doc in documents {
        if !latest.contains_key(&doc.id) {
            ids.push(doc.id.clone());
        }
        latest.insert(doc.id.clone(), doc);
    }

    let assumed_states = shared.meta.assumed_master_states(&ids).await?;
    let mut rows = Vec::with_capacity(ids.len());
    for id in &ids {
        let Some(doc) = latest.remove(id) else { continue };
        let assumed = assumed_states.get(id);
        if let Some(a) = assumed {
            if a.is_resolved_conflict != doc.rev_string()
                && shared.conflict_handler.is_equal(&a.document, &doc, "upstream-check-if-equal")
            {
                continue;
            }
        }
        rows.push(push_row(shared, doc, assumed).await?);
    }

    if rows.is_empty() {
        shared.meta.set_checkpoint(Direction::Up, &checkpoint).await?;
        return Ok(false);
    }
    metrics::record_batch_size(&shared.identifier, Direction::Up.as_str(), rows.len());

    let mut conflicts = Vec::new();
    let mut pushed = 0;
    for chunk in rows.chunks(shared.config.push_batch_size) {
        let rejected = shared.push(chunk.to_vec()).await?;
        let rejected_ids: HashSet<&str> = rejected.iter().map(|d| d.id.as_str()).collect();

        let mut meta_rows = Vec::with_capacity(chunk.len());
        for row in chunk {
            let id = row.new_document_state.id.as_str();
            if rejected_ids.contains(id) {
                continue;
            }
            let previous = assumed_states.get(id).map(|a| &a.meta_document);
            meta_rows.push(shared.meta.write_row(&row.new_document_state, previous, None)?);
            let _ = shared.events.processed_up.send(row.clone());
            pushed += 1;
        }
        shared.meta.write_rows(meta_rows, META_CONTEXT).await?;
        conflicts.extend(rejected);
    }
    metrics::record_documents_pushed(&shared.identifier, pushed);

    if conflicts.is_empty() {
        shared.meta.set_checkpoint(Direction::Up, &checkpoint).await?;
        debug!(pushed, "Pushed fork changes");
        return Ok(false);
    }

    bump(&shared.stats.up.persist_to_master_had_conflicts);
    metrics::record_conflicts(&shared.identifier, conflicts.len());
    let by_id: HashMap<&str, &MasterWriteRow> = rows
        .iter()
        .map(|r| (r.new_document_state.id.as_str(), r))
        .collect();

    let mut failure: Option<ReplicationError> = None;
    let mut fail = |e: ReplicationError| match failure {
        None => failure = Some(e),
        Some(_) => shared.emit_error(e),
    };

    let mut meta_rows = Vec::new();
    let mut fork_rows = Vec::new();
    let mut real_states: HashMap<String, Document> = HashMap::new();

    for real in conflicts {
        let Some(row) = by_id.get(real.id.as_str()) else {
            warn!(document_id = %real.id, "Master reported a conflict for a document that was not pushed");
            continue;
        };
        let previous_meta = assumed_states.get(&real.id).map(|a| &a.meta_document);
        let input = ConflictInput {
            new_document_state: row.new_document_state.clone(),
            assumed_master_state: row.assumed_master_state.clone(),
            real_master_state: real.clone(),
        };

        match resolve_conflict(
            shared.conflict_handler.as_ref(),
            &shared.hash_function,
            &input,
            &row.new_document_state,
        )
        .await
        {
            Ok(None) => {
                debug!(document_id = %real.id, "Fork already equals master, updating assumed state");
                meta_rows.push(shared.meta.write_row(&real, previous_meta, None)?);
            }
            Ok(Some(resolved)) => match missing_master_blobs(shared, &resolved, &row.new_document_state).await {
                Ok(attachment_data) => {
                    let _ = shared.events.resolved_conflicts.send(ResolvedConflict {
                        input,
                        output: resolved.clone(),
                    });
                    fork_rows.push(BulkWriteRow {
                        document: resolved,
                        previous: Some(row.new_document_state.clone()),
                        attachment_data,
                    });
                    real_states.insert(real.id.clone(), real);
                }
                Err(e) => fail(e),
            },
            Err(e) => fail(e),
        }
    }

    let mut conflict_writes = 0;
    if !fork_rows.is_empty() {
        let response = shared.fork.bulk_write(fork_rows, CONFLICT_CONTEXT).await?;
        for written in &response.success {
            if let Some(real) = real_states.get(&written.id) {
                let previous_meta = assumed_states.get(&written.id).map(|a| &a.meta_document);
                meta_rows.push(shared.meta.write_row(real, previous_meta, written.rev.as_ref())?);
            }
        }
        conflict_writes = response.success.len();
        for err in response.error {
            if err.is_conflict() {
                // Newer local write; it is pushed by the next cycle
                debug!(document_id = %err.document_id, "Fork changed before resolved conflict was written");
            } else {
                fail(err.into_error());
            }
        }
    }

    shared.meta.write_rows(meta_rows, CONFLICT_META_CONTEXT).await?;
    if conflict_writes > 0 {
        bump(&shared.stats.up.persist_to_master_conflict_writes);
        metrics::record_conflicts_resolved(&shared.identifier, conflict_writes);
        if !shared.master_live.load(Ordering::Relaxed) {
            // Without a live stream the fork would only learn about the
            // master's state on the next poll
            shared.request_resync();
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    shared.meta.set_checkpoint(Direction::Up, &checkpoint).await?;
    debug!(pushed, conflict_writes, "Pushed fork changes with conflicts");
    Ok(conflict_writes > 0)
}

/// Master write row for a fork document, with blob bytes for attachments
/// the master is not assumed to hold.
async fn push_row(shared: &Shared, doc: Document, assumed: Option<&AssumedMasterState>) -> Result<MasterWriteRow> {
    let mut attachment_data = HashMap::new();
    if !doc.deleted {
        for (attachment_id, meta) in &doc.attachments {
            let known = assumed
                .and_then(|a| a.document.attachments.get(attachment_id))
                .map(|m| m.digest == meta.digest)
                .unwrap_or(false);
            if known || attachment_data.contains_key(&meta.digest) {
                continue;
            }
            let bytes = shared
                .fork
                .get_attachment_data(&doc.id, attachment_id, &meta.digest)
                .await?;
            attachment_data.insert(meta.digest.clone(), bytes);
        }
    }
    Ok(MasterWriteRow {
        new_document_state: doc,
        assumed_master_state: assumed.map(|a| a.document.clone()),
        attachment_data,
    })
}

/// Blob bytes for attachments of a resolved document that the fork state
/// does not carry.
async fn missing_master_blobs(
    shared: &Shared,
    resolved: &Document,
    fork_state: &Document,
) -> Result<HashMap<String, Vec<u8>>> {
    let mut data = HashMap::new();
    if resolved.deleted {
        return Ok(data);
    }
    for (attachment_id, meta) in &resolved.attachments {
        let present = fork_state
            .attachments
            .get(attachment_id)
            .map(|m| m.digest == meta.digest)
            .unwrap_or(false);
        if present || data.contains_key(&meta.digest) {
            continue;
        }
        let bytes = shared
            .master_attachment(&resolved.id, attachment_id, &meta.digest)
            .await?;
        data.insert(meta.digest.clone(), bytes);
    }
    Ok(data)
}
