//! Mount candidates and the order used to pick the next one.
//!
//! Candidates are compared on, in order:
//! 1. `priority` (higher wins);
//! 2. mount kind: archive beats retrieve at equal priority, unless
//!    `TieBreakPolicy::prefer_archive` is off;
//! 3. `ratio_of_mount_quota_used` (smaller wins);
//! 4. `oldest_job_start_time` (older wins);
//! 5. `vid`, then `tape_pool` (alphabetically first wins).
//!
//! Steps 4 and 5 make the order total, so two passes over the same queues
//! always produce the same decision.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mount::MountKind;
use super::mount_policy::MountPolicy;

/// Summary of one queue's eligibility to be mounted. Recomputed on every
/// scheduling pass, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotentialMount {
    pub kind: MountKind,
    /// Tape to mount (retrieve only, empty for archive).
    pub vid: String,
    pub tape_pool: String,
    /// Highest priority amongst the queued jobs.
    pub priority: u64,
    pub files_queued: u64,
    pub bytes_queued: u64,
    pub oldest_job_start_time: DateTime<Utc>,
    /// Policy of the highest-priority job; its thresholds and quota apply.
    pub mount_policy: MountPolicy,
    /// Logical library holding the tape (retrieve only).
    pub logical_library: String,
    /// existing mounts / quota, in [0.0, 1.0].
    pub ratio_of_mount_quota_used: f64,
}

/// Tie-break knobs of the candidate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TieBreakPolicy {
    /// At equal priority, archive candidates beat retrieve candidates.
    pub prefer_archive: bool,
}

impl Default for TieBreakPolicy {
    fn default() -> Self {
        Self {
            prefer_archive: true,
        }
    }
}

impl PotentialMount {
    /// Compares two candidates; `Greater` means `self` wins over `other`.
    pub fn compare(&self, other: &Self, policy: TieBreakPolicy) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| {
                if !policy.prefer_archive {
                    return Ordering::Equal;
                }
                match (self.kind, other.kind) {
                    (MountKind::Archive, MountKind::Retrieve) => Ordering::Greater,
                    (MountKind::Retrieve, MountKind::Archive) => Ordering::Less,
                    _ => Ordering::Equal,
                }
            })
            // Reversed: a smaller ratio wins.
            .then_with(|| {
                other
                    .ratio_of_mount_quota_used
                    .total_cmp(&self.ratio_of_mount_quota_used)
            })
            .then_with(|| other.oldest_job_start_time.cmp(&self.oldest_job_start_time))
            .then_with(|| other.vid.cmp(&self.vid))
            .then_with(|| other.tape_pool.cmp(&self.tape_pool))
    }
}

/// Sorts candidates best first.
pub fn sort_best_first(candidates: &mut [PotentialMount], policy: TieBreakPolicy) {
    candidates.sort_by(|a, b| b.compare(a, policy));
}

/// The winning candidate, ignoring empty queues.
pub fn best_candidate(
    candidates: &[PotentialMount],
    policy: TieBreakPolicy,
) -> Option<&PotentialMount> {
    candidates
        .iter()
        .filter(|c| c.files_queued > 0)
        .max_by(|a, b| a.compare(b, policy))
}

/// Snapshot of a mount that is running (or reserved) on some drive. Only
/// used to count concurrency per pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingMount {
    pub drive_name: String,
    pub kind: MountKind,
    pub tape_pool: String,
    pub vid: String,
    /// False when the drive only holds a `Starting` reservation.
    pub current_mount: bool,
}

/// Drive dedication: which tape pools a drive may serve. Empty means all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicationEntry {
    pub tape_pools: Vec<String>,
}

impl DedicationEntry {
    pub fn allows(&self, tape_pool: &str) -> bool {
        self.tape_pools.is_empty() || self.tape_pools.iter().any(|p| p == tape_pool)
    }
}
