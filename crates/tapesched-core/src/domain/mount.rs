//! Mount model: one tape bound to one drive for one kind of transfer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MountId;

/// What a mount is for. Archive writes disk files to tape, retrieve reads
/// them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountKind {
    Archive,
    Retrieve,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Archive => f.write_str("ARCHIVE"),
            MountKind::Retrieve => f.write_str("RETRIEVE"),
        }
    }
}

/// Arguments of `MountDecision::create_{archive,retrieve}_mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub vid: String,
    pub tape_pool: String,
    pub drive_name: String,
    pub logical_library: String,
    pub host_name: String,
    pub start_time: DateTime<Utc>,
}

/// Immutable description of a live mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub mount_id: MountId,
    pub kind: MountKind,
    pub vid: String,
    pub tape_pool: String,
    pub logical_library: String,
    pub drive_name: String,
    pub host_name: String,
    pub start_time: DateTime<Utc>,
}

impl MountInfo {
    pub fn new(mount_id: MountId, kind: MountKind, request: MountRequest) -> Self {
        Self {
            mount_id,
            kind,
            vid: request.vid,
            tape_pool: request.tape_pool,
            logical_library: request.logical_library,
            drive_name: request.drive_name,
            host_name: request.host_name,
            start_time: request.start_time,
        }
    }
}

/// Session-level counters of a mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountStats {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub files_failed: u64,
    /// Files written to the tape during this session.
    pub nb_files_currently_on_tape: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MountStats {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}
