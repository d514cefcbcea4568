//! Per-file transfer jobs handed out by a mount.

use serde::{Deserialize, Serialize};

use super::ids::{ArchiveFileId, RequestId};
use super::request::{RemotePathAndStatus, TapeFile};

/// Identifies one copy of one request inside the queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub request_id: RequestId,
    pub copy_nb: u32,
}

/// Kind-specific payload of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Archive {
        archive_file_id: ArchiveFileId,
        copy_nb: u32,
        tape_pool: String,
        src_url: String,
        file_size: u64,
        remote_file: RemotePathAndStatus,
    },
    Retrieve {
        archive_file_id: ArchiveFileId,
        tape_file: TapeFile,
        dst_url: String,
        file_size: u64,
        remote_file: RemotePathAndStatus,
    },
}

impl JobKind {
    pub fn archive_file_id(&self) -> ArchiveFileId {
        match self {
            JobKind::Archive {
                archive_file_id, ..
            }
            | JobKind::Retrieve {
                archive_file_id, ..
            } => *archive_file_id,
        }
    }

    pub fn file_size(&self) -> u64 {
        match self {
            JobKind::Archive { file_size, .. } | JobKind::Retrieve { file_size, .. } => *file_size,
        }
    }

    pub fn remote_file(&self) -> &RemotePathAndStatus {
        match self {
            JobKind::Archive { remote_file, .. } | JobKind::Retrieve { remote_file, .. } => {
                remote_file
            }
        }
    }
}
