//! Archive and retrieve requests as they sit in the queues.
//!
//! A request is immutable once queued. Only its per-copy job status changes,
//! driven by job outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ArchiveFileId, RequestId};
use super::mount_policy::MountPolicy;

/// Who submitted a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequesterIdentity {
    pub name: String,
    pub group: String,
}

impl RequesterIdentity {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl std::fmt::Display for RequesterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.group)
    }
}

/// Identity acting on an existing request. Owners may only touch their own
/// requests; admins may touch any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    Owner(RequesterIdentity),
    Admin(RequesterIdentity),
}

impl Authority {
    pub fn identity(&self) -> &RequesterIdentity {
        match self {
            Authority::Owner(identity) | Authority::Admin(identity) => identity,
        }
    }

    pub fn may_modify(&self, owner: &RequesterIdentity) -> bool {
        match self {
            Authority::Admin(_) => true,
            Authority::Owner(identity) => identity == owner,
        }
    }
}

/// Disk-side location and metadata of a file. The scheduler stores and
/// forwards `status` without looking inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePathAndStatus {
    pub path: String,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl RemotePathAndStatus {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: serde_json::Value::Null,
        }
    }
}

/// Disk→tape request, as submitted by a disk instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub disk_instance: String,
    pub storage_class: String,
    pub requester: RequesterIdentity,
    pub src_url: String,
    pub remote_file: RemotePathAndStatus,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
}

/// Tape→disk request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub disk_instance: String,
    pub archive_file_id: ArchiveFileId,
    pub requester: RequesterIdentity,
    pub dst_url: String,
    pub remote_file: RemotePathAndStatus,
    /// Restrict the recall to this tape.
    #[serde(default)]
    pub vid: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Routing resolved by the catalogue for an archive request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveQueueCriteria {
    pub archive_file_id: ArchiveFileId,
    /// copy number -> destination tape pool.
    pub copy_to_pool: BTreeMap<u32, String>,
    pub mount_policy: MountPolicy,
}

/// One tape copy of an archived file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeFile {
    pub vid: String,
    pub copy_nb: u32,
    pub fseq: u64,
}

/// Routing resolved by the catalogue for a retrieve request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveQueueCriteria {
    pub archive_file_id: ArchiveFileId,
    pub file_size: u64,
    pub tape_files: Vec<TapeFile>,
    pub mount_policy: MountPolicy,
}

impl RetrieveQueueCriteria {
    /// Picks the copy to recall: the pinned tape if any, otherwise the lowest
    /// copy number (this minimises mounts when many dual-copy files are
    /// recalled together).
    pub fn select_tape_file(&self, pinned_vid: Option<&str>) -> Option<&TapeFile> {
        self.tape_files
            .iter()
            .filter(|tf| pinned_vid.is_none_or(|vid| tf.vid == vid))
            .min_by_key(|tf| tf.copy_nb)
    }
}

/// Status of one queued copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Enqueued, creation not yet committed by the submitter.
    PendingCreation,
    /// Waiting in its queue.
    Queued,
    /// Bound to a mount.
    InFlight,
    /// Marked for deletion; held by an agent until the cancellation completes.
    MarkedForDeletion,
    /// Exhausted its retries.
    Failed,
}

/// Snapshot of one queued archive copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveJobEntry {
    pub request_id: RequestId,
    pub archive_file_id: ArchiveFileId,
    pub copy_nb: u32,
    pub tape_pool: String,
    pub request: ArchiveRequest,
    pub mount_policy: MountPolicy,
    pub status: JobStatus,
    pub total_retries: u32,
    pub last_error: Option<String>,
}

/// Snapshot of one queued retrieve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveJobEntry {
    pub request_id: RequestId,
    pub archive_file_id: ArchiveFileId,
    pub tape_file: TapeFile,
    pub file_size: u64,
    pub request: RetrieveRequest,
    pub mount_policy: MountPolicy,
    pub status: JobStatus,
    pub total_retries: u32,
    pub last_error: Option<String>,
}
