//! Downstream engine: master → fork.
//!
//! Work is queued as tasks and processed in order:
//! - **Resync**: pull from the stored down checkpoint until a short batch
//! - **Changes**: one bulk from the master's live change stream
//!
//! The engine wakes on stream items, explicit resync requests, the idle poll
//! (masters without a live stream rely on it) and the retry timer armed after
//! a failed task.
//!
//! # Fork Write Rules
//!
//! A pulled master document is force-written into the fork unless the fork
//! holds a local write the master has not seen yet:
//!
//! | Fork | Assumed state | Outcome |
//! |------|---------------|---------|
//! | rev == last resolved conflict rev | any | skip (resolution still pending push) |
//! | exists | none | skip (local insert pending push) |
//! | exists | differs from fork | skip (local update pending push) |
//! | equal to master | equal to fork | skip, assumed state refreshed |
//! | otherwise | | write master state on top of fork |
//!
//! Skipped documents are not lost: upstream pushes the local state, the
//! master reports a conflict, and the conflict handler decides.

use super::{is_covered, Direction, Shared};
use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::handler::{DocumentsWithCheckpoint, PullStream, PullStreamItem};
use crate::metrics;
use crate::revision::{create_revision, now_lwt};
use crate::stats::bump;
use crate::store::{index_by_id, BulkWriteRow, Checkpoint};
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

const META_CONTEXT: &str = "replication-down-write-meta";

enum DownTask {
    /// `counted` resyncs show up in `downstream_resync_once`.
    Resync { counted: bool },
    Changes(DocumentsWithCheckpoint),
}

enum Wake {
    Canceled,
    Resync,
    Stream(Option<PullStreamItem>),
    Poll,
    Retry,
}

async fn next_item(stream: &mut Option<PullStream>) -> Option<PullStreamItem> {
    match stream {
        Some(s) => s.next().await,
        None => futures::future::pending().await,
    }
}

/// Run until canceled.
pub(super) async fn run(shared: Arc<Shared>, mut stream: Option<PullStream>, mut resync_rx: mpsc::UnboundedReceiver<()>) {
    let span = info_span!("downstream", identifier = %shared.identifier);

    async move {
        let mut canceled = shared.canceled.clone();
        let poll_interval = shared.config.downstream.poll_interval_duration();
        let retry_delay = shared.retry.max_delay;
        let mut queue = VecDeque::new();
        let mut retry_at: Option<Instant> = None;

        info!(live = stream.is_some(), poll_interval = ?poll_interval, "Downstream started");
        enqueue(&shared, &mut queue, DownTask::Resync { counted: true });

        loop {
            if shared.is_canceled() {
                break;
            }

            if !queue.is_empty() {
                shared.set_active(Direction::Down, true);
                while let Some(task) = queue.pop_front() {
                    let result = match task {
                        DownTask::Resync { counted } => resync(&shared, &mut stream, counted).await,
                        DownTask::Changes(batch) => process_changes(&shared, batch).await,
                    };
                    match result {
                        Ok(()) => {}
                        Err(ReplicationError::Canceled) => break,
                        Err(e) => {
                            shared.emit_error(e);
                            // The retry resync re-pulls whatever the dropped tasks carried
                            queue.clear();
                            retry_at = Some(Instant::now() + retry_delay);
                            break;
                        }
                    }
                }
                shared.set_active(Direction::Down, false);
                continue;
            }

            let wake = tokio::select! {
                _ = canceled.wait_for(|c| *c) => Wake::Canceled,
                Some(()) = resync_rx.recv() => Wake::Resync,
                item = next_item(&mut stream) => Wake::Stream(item),
                _ = tokio::time::sleep(poll_interval.unwrap_or_default()), if poll_interval.is_some() && retry_at.is_none() => Wake::Poll,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => Wake::Retry,
            };

            match wake {
                Wake::Canceled => break,
                Wake::Resync => {
                    while resync_rx.try_recv().is_ok() {}
                    debug!("Resync requested");
                    enqueue(&shared, &mut queue, DownTask::Resync { counted: true });
                }
                Wake::Stream(None) => {
                    warn!("Master change stream ended, falling back to polling");
                    stream = None;
                }
                Wake::Stream(Some(item)) => {
                    let recovering = retry_at.is_some();
                    on_stream_item(&shared, &mut queue, item, recovering);
                    // Take everything already buffered in one go
                    loop {
                        match stream.as_mut().and_then(|s| s.next().now_or_never()) {
                            Some(Some(item)) => on_stream_item(&shared, &mut queue, item, recovering),
                            Some(None) => {
                                stream = None;
                                break;
                            }
                            None => break,
                        }
                    }
                }
                Wake::Poll => queue.push_back(DownTask::Resync { counted: false }),
                Wake::Retry => {
                    retry_at = None;
                    debug!("Retrying after failure");
                    queue.push_back(DownTask::Resync { counted: false });
                }
            }
        }

        info!("Downstream stopped");
    }
    .instrument(span)
    .await
}

fn enqueue(shared: &Shared, queue: &mut VecDeque<DownTask>, task: DownTask) {
    bump(&shared.stats.down.add_new_task);
    queue.push_back(task);
}

fn on_stream_item(shared: &Shared, queue: &mut VecDeque<DownTask>, item: PullStreamItem, recovering: bool) {
    bump(&shared.stats.down.master_change_stream_emit);
    let task = match item {
        // A bulk past a failed pull would move the checkpoint over the
        // documents that failed; re-pull from the checkpoint instead.
        PullStreamItem::Documents(_) if recovering => DownTask::Resync { counted: false },
        PullStreamItem::Documents(batch) => DownTask::Changes(batch),
        PullStreamItem::Resync => {
            info!("Master requested resync");
            DownTask::Resync { counted: true }
        }
    };
    enqueue(shared, queue, task);
}

/// Pull from the stored checkpoint until the master has nothing more.
async fn resync(shared: &Shared, stream: &mut Option<PullStream>, counted: bool) -> Result<()> {
    if counted {
        bump(&shared.stats.down.downstream_resync_once);
        metrics::record_resync(&shared.identifier);
    }

    // Everything buffered so far is covered by the pull below
    loop {
        match stream.as_mut().and_then(|s| s.next().now_or_never()) {
            Some(Some(_)) => {}
            Some(None) => {
                *stream = None;
                break;
            }
            None => break,
        }
    }

    let mut checkpoint = shared.meta.last_checkpoint(Direction::Down).await?;
    let mut total = 0;
    loop {
        if shared.is_canceled() {
            return Err(ReplicationError::Canceled);
        }
        let batch = shared.pull(checkpoint.clone()).await?;
        let count = batch.documents.len();
        if count == 0 {
            break;
        }
        total += count;
        persist_from_master(shared, batch.documents, batch.checkpoint.clone()).await?;
        checkpoint = batch.checkpoint;
        if count < shared.config.pull_batch_size {
            break;
        }
    }

    debug!(counted, documents = total, "Resync done");
    shared.mark_first_sync(Direction::Down);
    Ok(())
}

async fn process_changes(shared: &Shared, batch: DocumentsWithCheckpoint) -> Result<()> {
    bump(&shared.stats.down.downstream_process_changes);
    if let Some(checkpoint) = &batch.checkpoint {
        let reached = shared.meta.last_checkpoint(Direction::Down).await?;
        if is_covered(checkpoint, reached.as_ref()) {
            debug!(checkpoint = %checkpoint.0, "Master bulk already applied, skipping");
            return Ok(());
        }
    }
    persist_from_master(shared, batch.documents, batch.checkpoint).await
}

/// Write master documents into the fork, record their assumed states and
/// advance the down checkpoint.
async fn persist_from_master(
    shared: &Shared,
    documents: Vec<Document>,
    checkpoint: Option<Checkpoint>,
) -> Result<()> {
    bump(&shared.stats.down.persist_from_master);
    metrics::record_batch_size(&shared.identifier, Direction::Down.as_str(), documents.len());

    // Latest state per id wins
    let mut ids: Vec<String> = Vec::with_capacity(documents.len());
    let mut masters: HashMap<String, Document> = HashMap::with_capacity(documents.len());
    for doc in documents {
        if !masters.contains_key(&doc.id) {
            ids.push(doc.id.clone());
        }
        masters.insert(doc.id.clone(), doc);
    }

    let fork_states = index_by_id(shared.fork.find_documents_by_id(&ids, true).await?);
    let assumed_states = shared.meta.assumed_master_states(&ids).await?;
    let conflict_handler = shared.conflict_handler.as_ref();

    let mut fork_rows = Vec::new();
    let mut meta_rows = Vec::new();
    let mut skipped = 0;

    for id in &ids {
        let Some(master) = masters.get(id) else { continue };
        let fork = fork_states.get(id);
        let assumed = assumed_states.get(id);

        if let Some(fork) = fork {
            if let Some(assumed) = assumed {
                if assumed.is_resolved_conflict.is_some() && assumed.is_resolved_conflict == fork.rev_string() {
                    skipped += 1;
                    continue;
                }
            }
            let assumed_equals_fork = assumed
                .map(|a| conflict_handler.is_equal(&a.document, fork, "downstream-check-if-equal-0"))
                .unwrap_or(false);
            if !assumed_equals_fork {
                skipped += 1;
                continue;
            }
            if conflict_handler.is_equal(master, fork, "downstream-check-if-equal-1") {
                if let Some(assumed) = assumed.filter(|a| a.document.rev != master.rev) {
                    meta_rows.push(shared.meta.write_row(master, Some(&assumed.meta_document), None)?);
                }
                continue;
            }
        }

        let mut new_fork_state = master.clone();
        // Keep the master revision unless the fork is already at or above it
        new_fork_state.rev = match (fork, &master.rev) {
            (None, Some(rev)) => Some(rev.clone()),
            (Some(f), Some(rev)) if rev.height() > f.height() => Some(rev.clone()),
            _ => Some(create_revision(&shared.hash_function, &new_fork_state, fork)),
        };
        new_fork_state.meta.lwt = now_lwt();

        let mut attachment_data = HashMap::new();
        if !new_fork_state.deleted {
            for (attachment_id, meta) in &master.attachments {
                let present = fork
                    .and_then(|f| f.attachments.get(attachment_id))
                    .map(|existing| existing.digest == meta.digest)
                    .unwrap_or(false);
                if present || attachment_data.contains_key(&meta.digest) {
                    continue;
                }
                let bytes = shared.master_attachment(id, attachment_id, &meta.digest).await?;
                attachment_data.insert(meta.digest.clone(), bytes);
            }
        }

        fork_rows.push(BulkWriteRow {
            document: new_fork_state,
            previous: fork.cloned(),
            attachment_data,
        });
    }

    let mut failure = None;
    let mut written = 0;
    if !fork_rows.is_empty() {
        let response = shared.fork.bulk_write(fork_rows, &shared.downstream_flag).await?;
        written = response.success.len();
        for doc in response.success {
            if let Some(master) = masters.get(&doc.id) {
                let previous = assumed_states.get(&doc.id).map(|a| &a.meta_document);
                meta_rows.push(shared.meta.write_row(master, previous, None)?);
            }
            let _ = shared.events.processed_down.send(doc);
        }
        for err in response.error {
            if err.is_conflict() {
                // A local write landed first; upstream pushes it and the
                // master answers with a conflict.
                debug!(document_id = %err.document_id, "Fork changed during pull, leaving it for upstream");
                skipped += 1;
            } else if failure.is_none() {
                failure = Some(err.into_error());
            } else {
                shared.emit_error(err.into_error());
            }
        }
    }

    shared.meta.write_rows(meta_rows, META_CONTEXT).await?;
    metrics::record_documents_pulled(&shared.identifier, written);
    metrics::record_documents_pull_skipped(&shared.identifier, skipped);
    if let Some(e) = failure {
        return Err(e);
    }

    if let Some(checkpoint) = checkpoint {
        shared.meta.set_checkpoint(Direction::Down, &checkpoint).await?;
    }
    debug!(pulled = ids.len(), written, skipped, "Persisted master changes");
    Ok(())
}
