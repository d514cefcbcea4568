//! Catalogue port - 永続メタデータサービス（外部協調者）
//!
//! The catalogue owns storage classes, routes, mount policies, tapes and
//! logical libraries. The scheduler only asks it questions; it never
//! reimplements any of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    ArchiveFileId, ArchiveQueueCriteria, RequesterIdentity, RetrieveQueueCriteria, SchedulerError,
};

/// A tape available for writing in a logical library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeForWriting {
    pub vid: String,
    pub tape_pool: String,
    pub logical_library: String,
    /// Last file sequence number written on the tape.
    #[serde(default)]
    pub last_fseq: u64,
}

/// Where a tape lives and which pool it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeInfo {
    pub vid: String,
    pub tape_pool: String,
    pub logical_library: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalLibrary {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Catalogue は routing・認可・mount policy を提供
///
/// # 設計原則
/// - 解決できない routing は `SchedulerError::InvalidRouting`
/// - 一時的な障害は `SchedulerError::Catalogue`（呼び出し側が backoff で再試行）
#[async_trait]
pub trait Catalogue: Send + Sync {
    /// Validates the storage class for this requester and allocates the
    /// archive file id of the new file.
    async fn next_archive_file_id(
        &self,
        disk_instance: &str,
        storage_class: &str,
        requester: &RequesterIdentity,
    ) -> Result<ArchiveFileId, SchedulerError>;

    /// Resolves copy routing and mount policy for an archive.
    async fn archive_queue_criteria(
        &self,
        disk_instance: &str,
        storage_class: &str,
        requester: &RequesterIdentity,
        archive_file_id: ArchiveFileId,
    ) -> Result<ArchiveQueueCriteria, SchedulerError>;

    /// Resolves tape copies and mount policy for a retrieve.
    async fn retrieve_queue_criteria(
        &self,
        disk_instance: &str,
        archive_file_id: ArchiveFileId,
        requester: &RequesterIdentity,
    ) -> Result<RetrieveQueueCriteria, SchedulerError>;

    async fn tapes_for_writing(
        &self,
        logical_library: &str,
    ) -> Result<Vec<TapeForWriting>, SchedulerError>;

    async fn tape(&self, vid: &str) -> Result<Option<TapeInfo>, SchedulerError>;

    async fn logical_library(&self, name: &str) -> Result<Option<LogicalLibrary>, SchedulerError>;

    /// Is this identity allowed to act on other users' requests?
    async fn is_admin(&self, identity: &RequesterIdentity) -> Result<bool, SchedulerError>;
}
