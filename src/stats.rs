//! Live replication counters.
//!
//! Counters are plain atomics bumped by the engines; [`ReplicationStats::snapshot`]
//! copies them into a serializable [`StatsSnapshot`] whose field names match
//! the `stats.up.*` / `stats.down.*` names used in dashboards.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Downstream (master → fork) counters.
#[derive(Debug, Default)]
pub struct DownStats {
    /// Tasks queued for the downstream engine.
    pub add_new_task: AtomicU64,
    /// Counted resync runs (initial pull, resync requests, lag recovery).
    pub downstream_resync_once: AtomicU64,
    /// Live stream bulks processed.
    pub downstream_process_changes: AtomicU64,
    /// Items received from the master change stream.
    pub master_change_stream_emit: AtomicU64,
    pub persist_from_master: AtomicU64,
}

/// Upstream (fork → master) counters.
#[derive(Debug, Default)]
pub struct UpStats {
    pub upstream_initial_sync: AtomicU64,
    pub fork_change_stream_emit: AtomicU64,
    pub process_tasks: AtomicU64,
    pub persist_to_master: AtomicU64,
    pub persist_to_master_had_conflicts: AtomicU64,
    pub persist_to_master_conflict_writes: AtomicU64,
}

#[derive(Debug, Default)]
pub struct ReplicationStats {
    pub down: DownStats,
    pub up: UpStats,
}

/// Bump a counter by one.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ReplicationStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            down: DownSnapshot {
                add_new_task: get(&self.down.add_new_task),
                downstream_resync_once: get(&self.down.downstream_resync_once),
                downstream_process_changes: get(&self.down.downstream_process_changes),
                master_change_stream_emit: get(&self.down.master_change_stream_emit),
                persist_from_master: get(&self.down.persist_from_master),
            },
            up: UpSnapshot {
                upstream_initial_sync: get(&self.up.upstream_initial_sync),
                fork_change_stream_emit: get(&self.up.fork_change_stream_emit),
                process_tasks: get(&self.up.process_tasks),
                persist_to_master: get(&self.up.persist_to_master),
                persist_to_master_had_conflicts: get(&self.up.persist_to_master_had_conflicts),
                persist_to_master_conflict_writes: get(&self.up.persist_to_master_conflict_writes),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownSnapshot {
    pub add_new_task: u64,
    pub downstream_resync_once: u64,
    pub downstream_process_changes: u64,
    pub master_change_stream_emit: u64,
    pub persist_from_master: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpSnapshot {
    pub upstream_initial_sync: u64,
    pub fork_change_stream_emit: u64,
    pub process_tasks: u64,
    pub persist_to_master: u64,
    pub persist_to_master_had_conflicts: u64,
    pub persist_to_master_conflict_writes: u64,
}

/// Point-in-time copy of [`ReplicationStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub down: DownSnapshot,
    pub up: UpSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ReplicationStats::default();
        bump(&stats.down.downstream_resync_once);
        bump(&stats.up.persist_to_master);
        bump(&stats.up.persist_to_master);

        let snap = stats.snapshot();
        assert_eq!(snap.down.downstream_resync_once, 1);
        assert_eq!(snap.up.persist_to_master, 2);
        assert_eq!(snap.up.process_tasks, 0);
    }

    #[test]
    fn test_snapshot_field_names() {
        let json = serde_json::to_value(ReplicationStats::default().snapshot()).unwrap();
        assert!(json["down"].get("downstreamResyncOnce").is_some());
        assert!(json["up"].get("persistToMasterConflictWrites").is_some());
        assert!(json["up"].get("upstreamInitialSync").is_some());
    }
}
