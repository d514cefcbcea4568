//! QueueStore port - アーカイブ／リトリーブ要求キューの正本
//!
//! The store keeps one queue per tape pool (archive) and one per tape
//! (retrieve), each ordered by request creation time. It also owns the
//! global scheduling lock: [`QueueStore::get_mount_info`] takes it, and the
//! returned [`MountDecision`] gives it back either when a mount is created or
//! on [`MountDecision::release`].
//!
//! # 設計原則
//! - enqueue/dequeue は単一要求単位でアトミック
//! - 要求はマウントに割り当てられた瞬間にキューから外れる
//! - ハンドル（[`RequestCreation`], [`RequestCancellation`]）は結果を明示的に選ぶ

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, warn};

use crate::domain::{
    AgentId, ArchiveFileId, ArchiveJobEntry, ArchiveQueueCriteria, ArchiveRequest, Authority,
    DedicationEntry, DriveStatus, ExistingMount, JobKey, JobKind, JobStatus, MountId, MountInfo,
    MountKind, MountRequest, MountStats, PotentialMount, RequestId, RetrieveJobEntry,
    RetrieveQueueCriteria, RetrieveRequest, SchedulerError,
};

// ============================================================================
// Request creation
// ============================================================================

/// Store-side outcome of a [`RequestCreation`].
pub trait CreationFinalizer: Send {
    fn commit(self: Box<Self>) -> Result<(), SchedulerError>;
    fn abort(self: Box<Self>) -> Result<(), SchedulerError>;
}

/// Returned by `queue_archive`/`queue_retrieve`. The caller commits once the
/// namespace side of the operation succeeded, or aborts to undo the entry.
///
/// Dropping the handle without choosing (a panic or a cancelled future in
/// the caller) aborts.
#[must_use = "a queued request must be committed or aborted"]
pub struct RequestCreation {
    request_id: RequestId,
    finalizer: Option<Box<dyn CreationFinalizer>>,
}

impl RequestCreation {
    pub fn new(request_id: RequestId, finalizer: Box<dyn CreationFinalizer>) -> Self {
        Self {
            request_id,
            finalizer: Some(finalizer),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn commit(mut self) -> Result<(), SchedulerError> {
        match self.finalizer.take() {
            Some(finalizer) => finalizer.commit(),
            None => Ok(()),
        }
    }

    pub fn abort(mut self) -> Result<(), SchedulerError> {
        match self.finalizer.take() {
            Some(finalizer) => finalizer.abort(),
            None => Ok(()),
        }
    }
}

impl Drop for RequestCreation {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            warn!(request_id = %self.request_id, "request creation dropped without outcome, aborting");
            if let Err(e) = finalizer.abort() {
                error!(request_id = %self.request_id, error = %e, "implicit abort failed");
            }
        }
    }
}

impl fmt::Debug for RequestCreation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCreation")
            .field("request_id", &self.request_id)
            .field("pending", &self.finalizer.is_some())
            .finish()
    }
}

// ============================================================================
// Two-phase archive deletion
// ============================================================================

/// Store-side outcome of a [`RequestCancellation`].
pub trait CancellationFinalizer: Send {
    fn complete(self: Box<Self>) -> Result<(), SchedulerError>;
    fn revert(self: Box<Self>) -> Result<(), SchedulerError>;
}

/// Returned by `mark_archive_request_for_deletion`. The entry is out of the
/// queues and owned by an agent until `complete` erases it.
///
/// Dropping the handle does nothing: the entry stays in the agent-owned list
/// where the orphan sweep finds it.
#[must_use = "a cancellation must be completed or reverted"]
pub struct RequestCancellation {
    archive_file_id: ArchiveFileId,
    owner: AgentId,
    finalizer: Option<Box<dyn CancellationFinalizer>>,
}

impl RequestCancellation {
    pub fn new(
        archive_file_id: ArchiveFileId,
        owner: AgentId,
        finalizer: Box<dyn CancellationFinalizer>,
    ) -> Self {
        Self {
            archive_file_id,
            owner,
            finalizer: Some(finalizer),
        }
    }

    pub fn archive_file_id(&self) -> ArchiveFileId {
        self.archive_file_id
    }

    pub fn owner(&self) -> AgentId {
        self.owner
    }

    pub fn complete(mut self) -> Result<(), SchedulerError> {
        match self.finalizer.take() {
            Some(finalizer) => finalizer.complete(),
            None => Ok(()),
        }
    }

    /// Puts the request back into its queues.
    pub fn revert(mut self) -> Result<(), SchedulerError> {
        match self.finalizer.take() {
            Some(finalizer) => finalizer.revert(),
            None => Ok(()),
        }
    }
}

impl Drop for RequestCancellation {
    fn drop(&mut self) {
        if self.finalizer.is_some() {
            warn!(
                archive_file_id = self.archive_file_id,
                owner = %self.owner,
                "cancellation handle dropped before completion, left for the orphan sweep"
            );
        }
    }
}

impl fmt::Debug for RequestCancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCancellation")
            .field("archive_file_id", &self.archive_file_id)
            .field("owner", &self.owner)
            .finish()
    }
}

/// An entry marked for deletion and not yet erased. Visible to the orphan
/// sweep through [`QueueStore::pending_cancellations`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCancellation {
    pub owner: AgentId,
    pub archive_file_id: ArchiveFileId,
    pub request_id: RequestId,
    pub tape_pools: Vec<String>,
    /// Copy number -> status before the mark, restored on revert.
    pub prior_status: BTreeMap<u32, JobStatus>,
    pub marked_at: DateTime<Utc>,
}

// ============================================================================
// Jobs and mounts
// ============================================================================

/// Receives job outcomes (the store behind a mount).
#[async_trait]
pub trait JobReporter: Send + Sync {
    async fn report_success(&self, mount_id: MountId, key: JobKey) -> Result<(), SchedulerError>;

    async fn report_failure(
        &self,
        mount_id: MountId,
        key: JobKey,
        reason: String,
    ) -> Result<(), SchedulerError>;
}

/// One queued file's progress through a mount. Obtained only from
/// [`TapeMount::next_job`]; `succeed` and `fail` consume it.
#[must_use = "a job must be reported with succeed() or fail()"]
pub struct Job {
    key: JobKey,
    mount_id: MountId,
    kind: JobKind,
    reporter: Arc<dyn JobReporter>,
}

impl Job {
    pub fn new(key: JobKey, mount_id: MountId, kind: JobKind, reporter: Arc<dyn JobReporter>) -> Self {
        Self {
            key,
            mount_id,
            kind,
            reporter,
        }
    }

    pub fn key(&self) -> JobKey {
        self.key
    }

    pub fn mount_id(&self) -> MountId {
        self.mount_id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    /// Removes the entry from the store.
    pub async fn succeed(self) -> Result<(), SchedulerError> {
        self.reporter.report_success(self.mount_id, self.key).await
    }

    /// Returns the entry to its queue (or to the failed queue once retries
    /// are exhausted).
    pub async fn fail(self, reason: impl Into<String> + Send) -> Result<(), SchedulerError> {
        self.reporter
            .report_failure(self.mount_id, self.key, reason.into())
            .await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("mount_id", &self.mount_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A live mount, owned by the drive session that asked for it.
#[async_trait]
pub trait TapeMount: Send + Sync {
    fn info(&self) -> &MountInfo;

    fn kind(&self) -> MountKind {
        self.info().kind
    }

    /// Next job of the queue feeding this mount, `None` once it is drained.
    /// Concurrent callers never receive the same job.
    async fn next_job(&self) -> Result<Option<Job>, SchedulerError>;

    /// Up to `max_files` jobs, stopping early once `max_bytes` is reached.
    async fn next_job_batch(&self, max_files: u64, max_bytes: u64) -> Result<Vec<Job>, SchedulerError> {
        let mut batch = Vec::new();
        let mut bytes = 0u64;
        while (batch.len() as u64) < max_files && bytes < max_bytes {
            let Some(job) = self.next_job().await? else {
                break;
            };
            bytes = bytes.saturating_add(job.kind().file_size());
            batch.push(job);
        }
        Ok(batch)
    }

    async fn set_drive_status(&self, status: DriveStatus) -> Result<(), SchedulerError>;

    async fn stats(&self) -> Result<MountStats, SchedulerError>;

    /// Ends the mount. Jobs handed out but never reported go back to their
    /// queue, and the drive leaves its session.
    async fn complete(&self, completion_time: DateTime<Utc>) -> Result<MountStats, SchedulerError>;
}

// ============================================================================
// Mount decision
// ============================================================================

/// Store-side creation of mounts, used by [`MountDecision`].
#[async_trait]
pub trait MountFactory: Send + Sync {
    async fn create_mount(
        &self,
        kind: MountKind,
        request: MountRequest,
    ) -> Result<Box<dyn TapeMount>, SchedulerError>;
}

/// Snapshot of candidates and running mounts, taken under the global
/// scheduling lock.
///
/// The lock is given back exactly once: by the first successful
/// `create_*_mount` call, by [`MountDecision::release`], or when the decision
/// is dropped. A failed creation keeps the lock so the caller can try its
/// next candidate.
pub struct MountDecision {
    pub potential_mounts: Vec<PotentialMount>,
    pub existing_mounts: Vec<ExistingMount>,
    /// Drive name -> dedication.
    pub dedication_info: BTreeMap<String, DedicationEntry>,
    lease: Option<OwnedMutexGuard<()>>,
    factory: Arc<dyn MountFactory>,
}

impl MountDecision {
    /// `lease` is `None` for lock-free snapshots, which cannot create mounts.
    pub fn new(
        potential_mounts: Vec<PotentialMount>,
        existing_mounts: Vec<ExistingMount>,
        dedication_info: BTreeMap<String, DedicationEntry>,
        lease: Option<OwnedMutexGuard<()>>,
        factory: Arc<dyn MountFactory>,
    ) -> Self {
        Self {
            potential_mounts,
            existing_mounts,
            dedication_info,
            lease,
            factory,
        }
    }

    pub fn holds_lock(&self) -> bool {
        self.lease.is_some()
    }

    pub async fn create_archive_mount(
        &mut self,
        request: MountRequest,
    ) -> Result<Box<dyn TapeMount>, SchedulerError> {
        self.create_mount(MountKind::Archive, request).await
    }

    pub async fn create_retrieve_mount(
        &mut self,
        request: MountRequest,
    ) -> Result<Box<dyn TapeMount>, SchedulerError> {
        self.create_mount(MountKind::Retrieve, request).await
    }

    async fn create_mount(
        &mut self,
        kind: MountKind,
        request: MountRequest,
    ) -> Result<Box<dyn TapeMount>, SchedulerError> {
        if self.lease.is_none() {
            return Err(SchedulerError::SchedulingLockNotHeld);
        }
        let mount = self.factory.create_mount(kind, request).await?;
        self.release();
        Ok(mount)
    }

    /// Gives the scheduling lock back. Idempotent.
    pub fn release(&mut self) {
        if self.lease.take().is_some() {
            debug!("released global scheduling lock");
        }
    }
}

impl fmt::Debug for dyn TapeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapeMount").field("info", self.info()).finish()
    }
}

impl fmt::Debug for MountDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountDecision")
            .field("potential_mounts", &self.potential_mounts)
            .field("existing_mounts", &self.existing_mounts)
            .field("dedication_info", &self.dedication_info)
            .field("holds_lock", &self.holds_lock())
            .finish()
    }
}

// ============================================================================
// Store
// ============================================================================

/// QueueStore は要求キュー・マウント割り当て・スケジューリングロックの正本
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Cheap liveness check of the backend.
    async fn ping(&self) -> Result<(), SchedulerError>;

    /// Enqueues one job per copy in `criteria.copy_to_pool`.
    async fn queue_archive(
        &self,
        request: ArchiveRequest,
        criteria: ArchiveQueueCriteria,
    ) -> Result<RequestCreation, SchedulerError>;

    /// Enqueues the request on the tape holding the selected copy.
    async fn queue_retrieve(
        &self,
        request: RetrieveRequest,
        criteria: RetrieveQueueCriteria,
    ) -> Result<RequestCreation, SchedulerError>;

    /// Queued archive jobs per tape pool, oldest first.
    async fn get_archive_requests(
        &self,
    ) -> Result<BTreeMap<String, Vec<ArchiveJobEntry>>, SchedulerError>;

    async fn get_archive_requests_for_pool(
        &self,
        tape_pool: &str,
    ) -> Result<Vec<ArchiveJobEntry>, SchedulerError>;

    /// Queued retrieve jobs per tape, oldest first.
    async fn get_retrieve_requests(
        &self,
    ) -> Result<BTreeMap<String, Vec<RetrieveJobEntry>>, SchedulerError>;

    async fn get_retrieve_requests_for_vid(
        &self,
        vid: &str,
    ) -> Result<Vec<RetrieveJobEntry>, SchedulerError>;

    async fn delete_archive_request(
        &self,
        authority: &Authority,
        archive_file_id: ArchiveFileId,
    ) -> Result<(), SchedulerError>;

    /// `remote_file` is the destination path of the retrieve.
    async fn delete_retrieve_request(
        &self,
        authority: &Authority,
        remote_file: &str,
    ) -> Result<(), SchedulerError>;

    async fn mark_archive_request_for_deletion(
        &self,
        authority: &Authority,
        archive_file_id: ArchiveFileId,
    ) -> Result<RequestCancellation, SchedulerError>;

    /// Entries marked for deletion whose handles were never completed.
    async fn pending_cancellations(&self) -> Result<Vec<PendingCancellation>, SchedulerError>;

    /// Orphan sweep: erases a pending cancellation.
    async fn finish_cancellation(&self, archive_file_id: ArchiveFileId) -> Result<(), SchedulerError>;

    /// Orphan sweep: puts a pending cancellation back in its queues.
    async fn revert_cancellation(&self, archive_file_id: ArchiveFileId) -> Result<(), SchedulerError>;

    async fn get_failed_archive_jobs(&self) -> Result<Vec<ArchiveJobEntry>, SchedulerError>;

    async fn get_failed_retrieve_jobs(&self) -> Result<Vec<RetrieveJobEntry>, SchedulerError>;

    /// Takes the global scheduling lock (waiting for it if needed) and
    /// snapshots candidates, running mounts and dedications.
    async fn get_mount_info(&self) -> Result<MountDecision, SchedulerError>;

    /// Same snapshot without the lock, for reporting. Cannot create mounts.
    async fn get_mount_info_no_lock(&self) -> Result<MountDecision, SchedulerError>;
}
