//! Scheduler - 公開 API
//!
//! Ties the catalogue, the queue store and the drive registry together:
//! - disk-side operations: queue/cancel archives and retrieves, list queues
//! - tape-side operations: hand the next mount to a drive
//! - operator operations: drive states, summaries, orphan repair
//!
//! # 設計原則
//! - ルーティングと認可はカタログに問い合わせる（自前で解決しない）
//! - マウント決定はグローバルスケジューリングロックの下でのみ行う

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::app::selection::{DriveContext, select_candidates};
use crate::app::status::{QueueSummary, SchedulerStatus, summarize};
use crate::config::SchedulerConfig;
use crate::domain::{
    AgentId, ArchiveFileId, ArchiveJobEntry, ArchiveRequest, Authority, DesiredDriveState,
    DriveInfo, DriveState, DriveStatus, MountKind, MountRequest, PotentialMount, RequesterIdentity,
    RetrieveJobEntry, RetrieveRequest, SchedulerError, TieBreakPolicy,
};
use crate::ports::{
    Catalogue, Clock, DriveRegistry, QueueStore, RequestCancellation, RequestCreation, TapeMount,
};

pub struct Scheduler {
    store: Arc<dyn QueueStore>,
    catalogue: Arc<dyn Catalogue>,
    drives: Arc<dyn DriveRegistry>,
    clock: Arc<dyn Clock>,
    tie_break: TieBreakPolicy,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        catalogue: Arc<dyn Catalogue>,
        drives: Arc<dyn DriveRegistry>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        info!(
            prefer_archive = config.prefer_archive_on_tie,
            "candidate order: priority, kind bias, quota ratio, oldest job, vid, tape pool"
        );
        Self {
            store,
            catalogue,
            drives,
            clock,
            tie_break: config.tie_break(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn ping(&self) -> Result<(), SchedulerError> {
        self.store.ping().await
    }

    async fn authority(&self, identity: &RequesterIdentity) -> Result<Authority, SchedulerError> {
        Ok(if self.catalogue.is_admin(identity).await? {
            Authority::Admin(identity.clone())
        } else {
            Authority::Owner(identity.clone())
        })
    }

    // ------------------------------------------------------------------
    // Disk side
    // ------------------------------------------------------------------

    /// Queues an archive and leaves the outcome to the caller, who commits
    /// once its own bookkeeping for the file succeeded.
    pub async fn queue_archive_pending(
        &self,
        request: ArchiveRequest,
    ) -> Result<(ArchiveFileId, RequestCreation), SchedulerError> {
        if request.file_size == 0 {
            return Err(SchedulerError::ZeroLengthFile(request.remote_file.path));
        }
        let archive_file_id = self
            .catalogue
            .next_archive_file_id(&request.disk_instance, &request.storage_class, &request.requester)
            .await?;
        let criteria = self
            .catalogue
            .archive_queue_criteria(
                &request.disk_instance,
                &request.storage_class,
                &request.requester,
                archive_file_id,
            )
            .await?;
        let creation = self.store.queue_archive(request, criteria).await?;
        Ok((archive_file_id, creation))
    }

    /// Queues and commits an archive. Returns the new archive file id.
    pub async fn queue_archive(&self, request: ArchiveRequest) -> Result<ArchiveFileId, SchedulerError> {
        let (archive_file_id, creation) = self.queue_archive_pending(request).await?;
        creation.commit()?;
        Ok(archive_file_id)
    }

    pub async fn queue_retrieve_pending(
        &self,
        request: RetrieveRequest,
    ) -> Result<RequestCreation, SchedulerError> {
        let criteria = self
            .catalogue
            .retrieve_queue_criteria(&request.disk_instance, request.archive_file_id, &request.requester)
            .await?;
        self.store.queue_retrieve(request, criteria).await
    }

    pub async fn queue_retrieve(&self, request: RetrieveRequest) -> Result<(), SchedulerError> {
        self.queue_retrieve_pending(request).await?.commit()
    }

    /// First half of an archive deletion: the request leaves its queues and
    /// is held by this process until the handle is completed.
    pub async fn begin_archive_deletion(
        &self,
        requester: &RequesterIdentity,
        archive_file_id: ArchiveFileId,
    ) -> Result<RequestCancellation, SchedulerError> {
        let authority = self.authority(requester).await?;
        self.store
            .mark_archive_request_for_deletion(&authority, archive_file_id)
            .await
    }

    pub async fn delete_archive(
        &self,
        requester: &RequesterIdentity,
        archive_file_id: ArchiveFileId,
    ) -> Result<(), SchedulerError> {
        self.begin_archive_deletion(requester, archive_file_id)
            .await?
            .complete()
    }

    /// Cancels a retrieve by its destination path.
    pub async fn abort_retrieve(
        &self,
        requester: &RequesterIdentity,
        remote_file: &str,
    ) -> Result<(), SchedulerError> {
        let authority = self.authority(requester).await?;
        self.store.delete_retrieve_request(&authority, remote_file).await
    }

    pub async fn get_pending_archive_jobs(
        &self,
    ) -> Result<BTreeMap<String, Vec<ArchiveJobEntry>>, SchedulerError> {
        self.store.get_archive_requests().await
    }

    pub async fn get_pending_archive_jobs_for_pool(
        &self,
        tape_pool: &str,
    ) -> Result<Vec<ArchiveJobEntry>, SchedulerError> {
        self.store.get_archive_requests_for_pool(tape_pool).await
    }

    pub async fn get_pending_retrieve_jobs(
        &self,
    ) -> Result<BTreeMap<String, Vec<RetrieveJobEntry>>, SchedulerError> {
        self.store.get_retrieve_requests().await
    }

    pub async fn get_pending_retrieve_jobs_for_vid(
        &self,
        vid: &str,
    ) -> Result<Vec<RetrieveJobEntry>, SchedulerError> {
        self.store.get_retrieve_requests_for_vid(vid).await
    }

    pub async fn get_failed_archive_jobs(&self) -> Result<Vec<ArchiveJobEntry>, SchedulerError> {
        self.store.get_failed_archive_jobs().await
    }

    pub async fn get_failed_retrieve_jobs(&self) -> Result<Vec<RetrieveJobEntry>, SchedulerError> {
        self.store.get_failed_retrieve_jobs().await
    }

    /// Puts back every pending cancellation whose owner is not in
    /// `live_agents`. Returns how many were reverted.
    pub async fn revert_orphaned_cancellations(
        &self,
        live_agents: &BTreeSet<AgentId>,
    ) -> Result<usize, SchedulerError> {
        let mut reverted = 0;
        for pending in self.store.pending_cancellations().await? {
            if live_agents.contains(&pending.owner) {
                continue;
            }
            self.store.revert_cancellation(pending.archive_file_id).await?;
            warn!(
                archive_file_id = pending.archive_file_id,
                owner = %pending.owner,
                "reverted orphaned archive deletion"
            );
            reverted += 1;
        }
        Ok(reverted)
    }

    // ------------------------------------------------------------------
    // Tape side
    // ------------------------------------------------------------------

    /// Fills in pool and library of retrieve candidates from the catalogue.
    /// Tapes the catalogue does not know, or has disabled, are dropped.
    async fn resolve_tapes(
        &self,
        candidates: Vec<PotentialMount>,
    ) -> Result<Vec<PotentialMount>, SchedulerError> {
        let mut resolved = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            if candidate.kind == MountKind::Retrieve {
                match self.catalogue.tape(&candidate.vid).await? {
                    Some(tape) if !tape.disabled => {
                        candidate.tape_pool = tape.tape_pool;
                        candidate.logical_library = tape.logical_library;
                    }
                    Some(_) => {
                        debug!(vid = %candidate.vid, "tape disabled, not mounting");
                        continue;
                    }
                    None => {
                        warn!(vid = %candidate.vid, "retrieve queue for a tape unknown to the catalogue");
                        continue;
                    }
                }
            }
            resolved.push(candidate);
        }
        Ok(resolved)
    }

    /// Picks and creates the next mount for a drive, or `None` when there is
    /// nothing worth mounting.
    ///
    /// A candidate whose creation fails for an ordinary reason is skipped in
    /// favour of the next one. A `ConcurrentMountConflict` aborts the pass.
    pub async fn get_next_mount(
        &self,
        logical_library: &str,
        drive_name: &str,
    ) -> Result<Option<Box<dyn TapeMount>>, SchedulerError> {
        match self.catalogue.logical_library(logical_library).await? {
            None => {
                error!(library = %logical_library, drive = %drive_name, "unknown logical library");
                return Ok(None);
            }
            Some(library) if library.disabled => {
                info!(library = %logical_library, drive = %drive_name, "logical library disabled, not scheduling");
                return Ok(None);
            }
            Some(_) => {}
        }
        let drive = self.drives.drive_state(drive_name).await?;
        if !drive.is_schedulable() {
            debug!(drive = %drive_name, status = ?drive.status, up = drive.desired.up, "drive not schedulable");
            return Ok(None);
        }

        let mut decision = self.store.get_mount_info().await?;
        // An operator may have changed the drive while we waited for the lock.
        let drive = self.drives.drive_state(drive_name).await?;
        if !drive.is_schedulable() {
            decision.release();
            info!(
                drive = %drive_name,
                status = ?drive.status,
                up = drive.desired.up,
                "drive left Up while waiting for the scheduling lock"
            );
            return Ok(None);
        }
        if decision.existing_mounts.iter().any(|m| m.drive_name == drive_name) {
            decision.release();
            warn!(drive = %drive_name, "drive still has an open mount, not scheduling");
            return Ok(None);
        }
        let now = self.clock.now();
        let potential = std::mem::take(&mut decision.potential_mounts);
        let candidates = self.resolve_tapes(potential).await?;
        let selection = select_candidates(
            candidates,
            &decision.existing_mounts,
            DriveContext {
                drive_name,
                logical_library,
                dedication: decision.dedication_info.get(drive_name),
            },
            now,
            self.tie_break,
        );
        debug!(
            drive = %drive_name,
            eligible = selection.eligible.len(),
            rejected = selection.rejected.len(),
            "scheduling pass"
        );

        let mut writable = None;
        for candidate in &selection.eligible {
            let request = match candidate.kind {
                MountKind::Archive => {
                    if writable.is_none() {
                        writable = Some(self.catalogue.tapes_for_writing(logical_library).await?);
                    }
                    let tape = writable.iter().flatten().find(|t| {
                        t.tape_pool == candidate.tape_pool && !selection.tapes_in_use.contains(&t.vid)
                    });
                    let Some(tape) = tape else {
                        debug!(tape_pool = %candidate.tape_pool, "no writable tape for pool");
                        continue;
                    };
                    MountRequest {
                        vid: tape.vid.clone(),
                        tape_pool: candidate.tape_pool.clone(),
                        drive_name: drive_name.to_string(),
                        logical_library: logical_library.to_string(),
                        host_name: drive.host.clone(),
                        start_time: now,
                    }
                }
                MountKind::Retrieve => MountRequest {
                    vid: candidate.vid.clone(),
                    tape_pool: candidate.tape_pool.clone(),
                    drive_name: drive_name.to_string(),
                    logical_library: logical_library.to_string(),
                    host_name: drive.host.clone(),
                    start_time: now,
                },
            };
            let vid = request.vid.clone();
            let created = match candidate.kind {
                MountKind::Archive => decision.create_archive_mount(request).await,
                MountKind::Retrieve => decision.create_retrieve_mount(request).await,
            };
            match created {
                Ok(mount) => {
                    info!(
                        drive = %drive_name,
                        kind = %candidate.kind,
                        %vid,
                        tape_pool = %candidate.tape_pool,
                        priority = candidate.priority,
                        files_queued = candidate.files_queued,
                        "mount scheduled"
                    );
                    return Ok(Some(mount));
                }
                Err(e) if e.is_fatal() => {
                    error!(drive = %drive_name, %vid, error = %e, "lock discipline violated, aborting scheduling pass");
                    return Err(e);
                }
                Err(e) => {
                    warn!(drive = %drive_name, %vid, error = %e, "mount creation failed, trying next candidate");
                }
            }
        }
        decision.release();
        debug!(drive = %drive_name, "nothing to mount");
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Drives
    // ------------------------------------------------------------------

    pub async fn register_drive(&self, info: DriveInfo) -> Result<DriveState, SchedulerError> {
        self.drives.register_drive(info, self.clock.now()).await
    }

    pub async fn report_drive_status(
        &self,
        drive_name: &str,
        status: DriveStatus,
    ) -> Result<DriveState, SchedulerError> {
        self.drives
            .report_drive_status(drive_name, status, self.clock.now())
            .await
    }

    pub async fn set_desired_drive_state(
        &self,
        drive_name: &str,
        desired: DesiredDriveState,
    ) -> Result<DriveState, SchedulerError> {
        self.drives
            .set_desired_drive_state(drive_name, desired, self.clock.now())
            .await
    }

    pub async fn get_drive_states(&self) -> Result<Vec<DriveState>, SchedulerError> {
        self.drives.drive_states().await
    }

    pub async fn remove_drive(&self, drive_name: &str) -> Result<(), SchedulerError> {
        self.drives.remove_drive(drive_name).await
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    pub async fn queues_and_mounts_summary(
        &self,
    ) -> Result<Vec<QueueSummary>, SchedulerError> {
        let snapshot = self.store.get_mount_info_no_lock().await?;
        let mut candidates = Vec::with_capacity(snapshot.potential_mounts.len());
        for mut candidate in snapshot.potential_mounts.iter().cloned() {
            if candidate.kind == MountKind::Retrieve
                && let Some(tape) = self.catalogue.tape(&candidate.vid).await?
            {
                candidate.tape_pool = tape.tape_pool;
                candidate.logical_library = tape.logical_library;
            }
            candidates.push(candidate);
        }
        Ok(summarize(&candidates, &snapshot.existing_mounts))
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        Ok(SchedulerStatus {
            queues: self.queues_and_mounts_summary().await?,
            drives: self.get_drive_states().await?,
            failed_archive_jobs: self.store.get_failed_archive_jobs().await?.len(),
            failed_retrieve_jobs: self.store.get_failed_retrieve_jobs().await?.len(),
            pending_cancellations: self.store.pending_cancellations().await?.len(),
        })
    }
}
