//! Candidate filtering for one drive.
//!
//! Given the candidates of a [`MountDecision`](crate::ports::MountDecision)
//! and the mounts already running, keeps the queues this drive may serve and
//! that are worth a mount right now, then orders them best first.
//!
//! A queue is worth a mount when, with `n` mounts already serving its pool,
//! - `bytes_queued / (1 + n) >= max_bytes_queued`, or
//! - `files_queued / (1 + n) >= max_files_queued`, or
//! - `n == 0` and its oldest job is older than `max_request_age`.
//!
//! It is never mounted once `n >= max_drives_allowed`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::potential_mount::sort_best_first;
use crate::domain::{
    DedicationEntry, ExistingMount, MountKind, PotentialMount, SchedulerError, TieBreakPolicy,
};

/// The drive asking for work.
#[derive(Debug, Clone, Copy)]
pub struct DriveContext<'a> {
    pub drive_name: &'a str,
    pub logical_library: &'a str,
    pub dedication: Option<&'a DedicationEntry>,
}

#[derive(Debug, Default)]
pub struct Selection {
    /// Best first.
    pub eligible: Vec<PotentialMount>,
    /// Candidates turned down by their mount policy (`QuotaExceeded` or
    /// `PolicyNotMet`).
    pub rejected: Vec<(PotentialMount, SchedulerError)>,
    /// Tapes mounted or reserved on other drives.
    pub tapes_in_use: BTreeSet<String>,
}

pub fn select_candidates(
    potential_mounts: Vec<PotentialMount>,
    existing_mounts: &[ExistingMount],
    drive: DriveContext<'_>,
    now: DateTime<Utc>,
    policy: TieBreakPolicy,
) -> Selection {
    let others: Vec<_> = existing_mounts
        .iter()
        .filter(|m| m.drive_name != drive.drive_name)
        .collect();
    let tapes_in_use: BTreeSet<String> = others
        .iter()
        .filter(|m| !m.vid.is_empty())
        .map(|m| m.vid.clone())
        .collect();
    let mut per_pool: BTreeMap<(&str, MountKind), u64> = BTreeMap::new();
    for mount in &others {
        *per_pool.entry((mount.tape_pool.as_str(), mount.kind)).or_default() += 1;
    }

    let mut selection = Selection::default();
    for mut candidate in potential_mounts {
        if candidate.files_queued == 0 {
            continue;
        }
        if candidate.kind == MountKind::Retrieve {
            if candidate.logical_library != drive.logical_library {
                continue;
            }
            if tapes_in_use.contains(&candidate.vid) {
                debug!(vid = %candidate.vid, "tape already in use");
                continue;
            }
        }
        if drive
            .dedication
            .is_some_and(|d| !d.allows(&candidate.tape_pool))
        {
            debug!(drive = %drive.drive_name, tape_pool = %candidate.tape_pool, "drive not dedicated to pool");
            continue;
        }

        let existing = per_pool
            .get(&(candidate.tape_pool.as_str(), candidate.kind))
            .copied()
            .unwrap_or(0);
        let mount_policy = &candidate.mount_policy;
        if existing >= mount_policy.max_drives_allowed {
            let tape_pool = candidate.tape_pool.clone();
            debug!(%tape_pool, existing, max = mount_policy.max_drives_allowed, "mount quota reached");
            selection
                .rejected
                .push((candidate, SchedulerError::QuotaExceeded { tape_pool }));
            continue;
        }
        let age = (now - candidate.oldest_job_start_time)
            .to_std()
            .unwrap_or_default();
        let worth_mounting = candidate.bytes_queued / (1 + existing) >= mount_policy.max_bytes_queued
            || candidate.files_queued / (1 + existing) >= mount_policy.max_files_queued
            || (existing == 0 && age > mount_policy.max_request_age);
        if !worth_mounting {
            let tape_pool = candidate.tape_pool.clone();
            debug!(
                %tape_pool,
                vid = %candidate.vid,
                files = candidate.files_queued,
                bytes = candidate.bytes_queued,
                age_secs = age.as_secs(),
                "mount policy thresholds not met"
            );
            selection
                .rejected
                .push((candidate, SchedulerError::PolicyNotMet { tape_pool }));
            continue;
        }
        candidate.ratio_of_mount_quota_used = existing as f64 / mount_policy.max_drives_allowed as f64;
        selection.eligible.push(candidate);
    }
    sort_best_first(&mut selection.eligible, policy);
    selection.tapes_in_use = tapes_in_use;
    selection
}
