//! Status - キューとマウントの集計
//!
//! Read-only views for operators. Built from a lock-free mount snapshot, so
//! figures may be a pass behind the scheduler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DriveState, ExistingMount, MountKind, PotentialMount};

/// One queue and the mounts serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub kind: MountKind,
    pub tape_pool: String,
    /// Retrieve queues only.
    pub vid: String,
    pub files_queued: u64,
    pub bytes_queued: u64,
    pub priority: u64,
    pub oldest_job_start_time: Option<DateTime<Utc>>,
    /// Drives transferring for this queue.
    pub current_mounts: u64,
    /// Drives reserved for this queue and not yet mounted.
    pub next_mounts: u64,
}

/// Everything `tapesched status` prints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub queues: Vec<QueueSummary>,
    pub drives: Vec<DriveState>,
    pub failed_archive_jobs: usize,
    pub failed_retrieve_jobs: usize,
    pub pending_cancellations: usize,
}

/// Merges candidates and running mounts per queue. Archive queues are keyed
/// by pool, retrieve queues by tape.
pub fn summarize(potential_mounts: &[PotentialMount], existing_mounts: &[ExistingMount]) -> Vec<QueueSummary> {
    let mut queues: BTreeMap<(MountKind, String, String), QueueSummary> = BTreeMap::new();
    let key = |kind: MountKind, tape_pool: &str, vid: &str| match kind {
        MountKind::Archive => (kind, tape_pool.to_string(), String::new()),
        MountKind::Retrieve => (kind, String::new(), vid.to_string()),
    };

    for candidate in potential_mounts {
        let summary = queues
            .entry(key(candidate.kind, &candidate.tape_pool, &candidate.vid))
            .or_insert_with(|| empty(candidate.kind, &candidate.tape_pool, &candidate.vid));
        summary.files_queued += candidate.files_queued;
        summary.bytes_queued += candidate.bytes_queued;
        summary.priority = summary.priority.max(candidate.priority);
        summary.oldest_job_start_time = Some(
            summary
                .oldest_job_start_time
                .map_or(candidate.oldest_job_start_time, |t| t.min(candidate.oldest_job_start_time)),
        );
    }
    for mount in existing_mounts {
        let summary = queues
            .entry(key(mount.kind, &mount.tape_pool, &mount.vid))
            .or_insert_with(|| empty(mount.kind, &mount.tape_pool, &mount.vid));
        if mount.current_mount {
            summary.current_mounts += 1;
        } else {
            summary.next_mounts += 1;
        }
    }
    queues.into_values().collect()
}

fn empty(kind: MountKind, tape_pool: &str, vid: &str) -> QueueSummary {
    QueueSummary {
        kind,
        tape_pool: tape_pool.to_string(),
        vid: match kind {
            MountKind::Archive => String::new(),
            MountKind::Retrieve => vid.to_string(),
        },
        files_queued: 0,
        bytes_queued: 0,
        priority: 0,
        oldest_job_start_time: None,
        current_mounts: 0,
        next_mounts: 0,
    }
}
