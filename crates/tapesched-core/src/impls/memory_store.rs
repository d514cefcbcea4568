//! InMemoryQueueStore - 開発用・テスト用の要求キュー
//!
//! # 実装詳細
//! - 全キュー状態を 1 つの `std::sync::Mutex` で保護（await を跨いで保持しない）
//! - グローバルスケジューリングロックは `tokio::sync::Mutex<()>`、`lock_owned` で
//!   取得したガードを [`MountDecision`] に渡す
//! - キューは (created_at, 挿入順) の BTreeSet。ULID の下位ビットは乱数なので
//!   同一ミリ秒内の順序には使わない
//!
//! Every entry lives in a [`Lane`] (one for archive, one for retrieve) and is
//! linked into its named queue only while it is pending creation or queued.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::domain::{
    AgentId, ArchiveFileId, ArchiveJobEntry, ArchiveQueueCriteria, ArchiveRequest, Authority,
    DriveState, DriveStatus, ExistingMount, JobKey, JobKind, JobStatus, MountId, MountInfo,
    MountKind, MountPolicy, MountRequest, MountStats, PotentialMount, RequestId, RetrieveJobEntry,
    RetrieveQueueCriteria, RetrieveRequest, SchedulerError,
};
use crate::ports::{
    CancellationFinalizer, Clock, CreationFinalizer, DriveRegistry, IdGenerator, Job, JobReporter,
    MountDecision, MountFactory, PendingCancellation, QueueStore, RequestCancellation,
    RequestCreation, TapeMount,
};

// ============================================================================
// Lanes
// ============================================================================

/// Position of an entry in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueuePosition {
    created_at: DateTime<Utc>,
    seq: u64,
    key: JobKey,
}

/// Entries that can sit in a lane.
trait LaneEntry: Clone {
    /// Tape pool (archive) or vid (retrieve).
    fn queue_name(&self) -> &str;
    fn status(&self) -> JobStatus;
    fn set_status(&mut self, status: JobStatus);
    fn mount_policy(&self) -> &MountPolicy;
    fn file_size(&self) -> u64;
    fn created_at(&self) -> DateTime<Utc>;
    fn job_kind(&self) -> JobKind;

    /// Records a failure and returns the new retry count.
    fn record_failure(&mut self, reason: String) -> u32;
}

impl LaneEntry for ArchiveJobEntry {
    fn queue_name(&self) -> &str {
        &self.tape_pool
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    fn mount_policy(&self) -> &MountPolicy {
        &self.mount_policy
    }

    fn file_size(&self) -> u64 {
        self.request.file_size
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.request.created_at
    }

    fn job_kind(&self) -> JobKind {
        JobKind::Archive {
            archive_file_id: self.archive_file_id,
            copy_nb: self.copy_nb,
            tape_pool: self.tape_pool.clone(),
            src_url: self.request.src_url.clone(),
            file_size: self.request.file_size,
            remote_file: self.request.remote_file.clone(),
        }
    }

    fn record_failure(&mut self, reason: String) -> u32 {
        self.total_retries += 1;
        self.last_error = Some(reason);
        self.total_retries
    }
}

impl LaneEntry for RetrieveJobEntry {
    fn queue_name(&self) -> &str {
        &self.tape_file.vid
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    fn mount_policy(&self) -> &MountPolicy {
        &self.mount_policy
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.request.created_at
    }

    fn job_kind(&self) -> JobKind {
        JobKind::Retrieve {
            archive_file_id: self.archive_file_id,
            tape_file: self.tape_file.clone(),
            dst_url: self.request.dst_url.clone(),
            file_size: self.file_size,
            remote_file: self.request.remote_file.clone(),
        }
    }

    fn record_failure(&mut self, reason: String) -> u32 {
        self.total_retries += 1;
        self.last_error = Some(reason);
        self.total_retries
    }
}

fn is_listed(status: JobStatus) -> bool {
    matches!(status, JobStatus::PendingCreation | JobStatus::Queued)
}

struct Slot<E> {
    entry: E,
    position: QueuePosition,
}

/// All entries of one kind, plus the named queues linking the listed ones.
struct Lane<E> {
    kind: MountKind,
    slots: BTreeMap<JobKey, Slot<E>>,
    queues: BTreeMap<String, BTreeSet<QueuePosition>>,
}

impl<E: LaneEntry> Lane<E> {
    fn new(kind: MountKind) -> Self {
        Self {
            kind,
            slots: BTreeMap::new(),
            queues: BTreeMap::new(),
        }
    }

    fn insert(&mut self, position: QueuePosition, entry: E) {
        if is_listed(entry.status()) {
            self.queues
                .entry(entry.queue_name().to_string())
                .or_default()
                .insert(position);
        }
        self.slots.insert(position.key, Slot { entry, position });
    }

    fn get(&self, key: &JobKey) -> Option<&E> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    fn remove(&mut self, key: &JobKey) -> Option<E> {
        let slot = self.slots.remove(key)?;
        self.unlink(slot.entry.queue_name(), &slot.position);
        Some(slot.entry)
    }

    /// Changes the status, linking or unlinking the entry from its queue.
    fn set_status(&mut self, key: &JobKey, status: JobStatus) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        slot.entry.set_status(status);
        let name = slot.entry.queue_name().to_string();
        let position = slot.position;
        if is_listed(status) {
            self.queues.entry(name).or_default().insert(position);
        } else {
            self.unlink(&name, &position);
        }
        true
    }

    fn unlink(&mut self, name: &str, position: &QueuePosition) {
        if let Some(queue) = self.queues.get_mut(name) {
            queue.remove(position);
            if queue.is_empty() {
                self.queues.remove(name);
            }
        }
    }

    /// Keys of every copy of a request.
    fn keys_of(&self, request_id: RequestId) -> Vec<JobKey> {
        let first = JobKey {
            request_id,
            copy_nb: 0,
        };
        let last = JobKey {
            request_id,
            copy_nb: u32::MAX,
        };
        self.slots.range(first..=last).map(|(key, _)| *key).collect()
    }

    fn listing(&self) -> BTreeMap<String, Vec<E>> {
        self.queues
            .keys()
            .map(|name| (name.clone(), self.listing_for(name)))
            .collect()
    }

    fn listing_for(&self, name: &str) -> Vec<E> {
        self.queues
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|position| self.get(&position.key).cloned())
            .collect()
    }

    fn with_status(&self, status: JobStatus) -> Vec<E> {
        let mut found: Vec<_> = self
            .slots
            .values()
            .filter(|slot| slot.entry.status() == status)
            .collect();
        found.sort_by_key(|slot| slot.position);
        found.into_iter().map(|slot| slot.entry.clone()).collect()
    }

    /// Binds the oldest committed entry of a queue to a mount.
    fn pop_queued(&mut self, name: &str) -> Option<(JobKey, JobKind)> {
        let key = self.queues.get(name)?.iter().map(|p| p.key).find(|key| {
            self.get(key)
                .is_some_and(|entry| entry.status() == JobStatus::Queued)
        })?;
        self.set_status(&key, JobStatus::InFlight);
        self.get(&key).map(|entry| (key, entry.job_kind()))
    }

    /// Records a failure; the entry goes back to its queue or, once
    /// `max_total_retries` is reached, to the failed list.
    fn fail(&mut self, key: &JobKey, reason: String, max_total_retries: u32) -> Option<(JobStatus, u32)> {
        let retries = self.slots.get_mut(key)?.entry.record_failure(reason);
        let next = if retries >= max_total_retries {
            JobStatus::Failed
        } else {
            JobStatus::Queued
        };
        self.set_status(key, next);
        Some((next, retries))
    }

    /// One candidate per queue with at least one committed entry.
    fn potential_mounts(&self) -> Vec<PotentialMount> {
        let mut candidates = Vec::new();
        for (name, queue) in &self.queues {
            let mut summary: Option<PotentialMount> = None;
            for entry in queue.iter().filter_map(|p| self.get(&p.key)) {
                if entry.status() != JobStatus::Queued {
                    continue;
                }
                let policy = entry.mount_policy();
                let priority = policy.priority(self.kind);
                match summary.as_mut() {
                    None => {
                        let (vid, tape_pool) = match self.kind {
                            MountKind::Archive => (String::new(), name.clone()),
                            MountKind::Retrieve => (name.clone(), String::new()),
                        };
                        summary = Some(PotentialMount {
                            kind: self.kind,
                            vid,
                            tape_pool,
                            priority,
                            files_queued: 1,
                            bytes_queued: entry.file_size(),
                            oldest_job_start_time: entry.created_at(),
                            mount_policy: policy.clone(),
                            logical_library: String::new(),
                            ratio_of_mount_quota_used: 0.0,
                        });
                    }
                    Some(candidate) => {
                        candidate.files_queued += 1;
                        candidate.bytes_queued = candidate.bytes_queued.saturating_add(entry.file_size());
                        candidate.oldest_job_start_time =
                            candidate.oldest_job_start_time.min(entry.created_at());
                        if priority > candidate.priority {
                            candidate.priority = priority;
                            candidate.mount_policy = policy.clone();
                        }
                    }
                }
            }
            candidates.extend(summary);
        }
        candidates
    }
}

// ============================================================================
// Store state
// ============================================================================

/// An open mount. Removed from the store by `complete()`.
struct Session {
    info: MountInfo,
    stats: MountStats,
    in_flight: BTreeSet<JobKey>,
}

impl Session {
    fn existing_mount(&self) -> ExistingMount {
        ExistingMount {
            drive_name: self.info.drive_name.clone(),
            kind: self.info.kind,
            tape_pool: self.info.tape_pool.clone(),
            vid: self.info.vid.clone(),
            current_mount: true,
        }
    }
}

struct StoreState {
    archive: Lane<ArchiveJobEntry>,
    retrieve: Lane<RetrieveJobEntry>,
    /// One live archive request per archive file.
    archive_files: HashMap<ArchiveFileId, RequestId>,
    cancellations: BTreeMap<ArchiveFileId, PendingCancellation>,
    sessions: HashMap<MountId, Session>,
    next_seq: u64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            archive: Lane::new(MountKind::Archive),
            retrieve: Lane::new(MountKind::Retrieve),
            archive_files: HashMap::new(),
            cancellations: BTreeMap::new(),
            sessions: HashMap::new(),
            next_seq: 0,
        }
    }

    fn next_position(&mut self, created_at: DateTime<Utc>, key: JobKey) -> QueuePosition {
        self.next_seq += 1;
        QueuePosition {
            created_at,
            seq: self.next_seq,
            key,
        }
    }

    /// Copies of an archive request an authority may act on. Fails if the
    /// request is unknown, owned by someone else, or partly bound to a mount.
    fn modifiable_archive(
        &self,
        authority: &Authority,
        archive_file_id: ArchiveFileId,
    ) -> Result<(RequestId, Vec<JobKey>), SchedulerError> {
        let not_found = || SchedulerError::NotFound(format!("archive request for file {archive_file_id}"));
        if self.cancellations.contains_key(&archive_file_id) {
            return Err(not_found());
        }
        let request_id = *self.archive_files.get(&archive_file_id).ok_or_else(not_found)?;
        let keys = self.archive.keys_of(request_id);
        let owner = keys
            .first()
            .and_then(|key| self.archive.get(key))
            .map(|entry| &entry.request.requester)
            .ok_or_else(not_found)?;
        if !authority.may_modify(owner) {
            return Err(SchedulerError::PermissionDenied {
                requester: authority.identity().to_string(),
                what: format!("archive file {archive_file_id}"),
            });
        }
        let in_flight = keys.iter().any(|key| {
            self.archive
                .get(key)
                .is_some_and(|entry| entry.status == JobStatus::InFlight)
        });
        if in_flight {
            return Err(SchedulerError::RequestInFlight(format!("archive file {archive_file_id}")));
        }
        Ok((request_id, keys))
    }

    fn drop_archive_request(&mut self, request_id: RequestId, archive_file_id: ArchiveFileId) {
        for key in self.archive.keys_of(request_id) {
            self.archive.remove(&key);
        }
        self.archive_files.remove(&archive_file_id);
    }
}

// ============================================================================
// Store
// ============================================================================

struct StoreInner {
    state: Mutex<StoreState>,
    scheduling_lock: Arc<AsyncMutex<()>>,
    drives: Arc<dyn DriveRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    agent_id: AgentId,
    max_total_retries: u32,
}

/// In-memory [`QueueStore`]. Cloning shares the same queues.
#[derive(Clone)]
pub struct InMemoryQueueStore {
    inner: Arc<StoreInner>,
}

impl InMemoryQueueStore {
    pub fn new(
        drives: Arc<dyn DriveRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        max_total_retries: u32,
    ) -> Self {
        let agent_id = ids.generate_agent_id();
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::new()),
                scheduling_lock: Arc::new(AsyncMutex::new(())),
                drives,
                clock,
                ids,
                agent_id,
                max_total_retries,
            }),
        }
    }

    /// Agent owning the entries this store marks for deletion.
    pub fn agent_id(&self) -> AgentId {
        self.inner.agent_id
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn snapshot(&self, lease: Option<OwnedMutexGuard<()>>) -> Result<MountDecision, SchedulerError> {
        let drives = self.inner.drives.drive_states().await?;
        let (potential_mounts, sessions) = {
            let state = self.state();
            let mut candidates = state.archive.potential_mounts();
            candidates.extend(state.retrieve.potential_mounts());
            let sessions: Vec<ExistingMount> = state
                .sessions
                .values()
                .map(|session| session.existing_mount())
                .collect();
            (candidates, sessions)
        };
        let mut existing_mounts: Vec<ExistingMount> =
            drives.iter().filter_map(DriveState::existing_mount).collect();
        // A session stays open until complete(), even when its drive was
        // forced down meanwhile.
        for session in sessions {
            let reported = existing_mounts
                .iter()
                .any(|m| m.drive_name == session.drive_name && m.vid == session.vid);
            if !reported {
                debug!(drive = %session.drive_name, vid = %session.vid, "open mount not reported by its drive");
                existing_mounts.push(session);
            }
        }
        let dedication_info = drives
            .iter()
            .map(|drive| (drive.name.clone(), drive.dedication.clone()))
            .collect();
        Ok(MountDecision::new(
            potential_mounts,
            existing_mounts,
            dedication_info,
            lease,
            Arc::new(self.clone()),
        ))
    }

    fn commit_creation(&self, kind: MountKind, request_id: RequestId) -> Result<(), SchedulerError> {
        let mut state = self.state();
        let committed = match kind {
            MountKind::Archive => commit_pending(&mut state.archive, request_id),
            MountKind::Retrieve => commit_pending(&mut state.retrieve, request_id),
        };
        if committed == 0 {
            return Err(SchedulerError::NotFound(format!("pending request {request_id}")));
        }
        debug!(%request_id, %kind, copies = committed, "request creation committed");
        Ok(())
    }

    fn abort_creation(&self, kind: MountKind, request_id: RequestId) -> Result<(), SchedulerError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let aborted = match kind {
            MountKind::Archive => {
                let removed = remove_pending(&mut state.archive, request_id);
                if let Some(entry) = removed.first()
                    && state.archive.keys_of(request_id).is_empty()
                {
                    state.archive_files.remove(&entry.archive_file_id);
                }
                removed.len()
            }
            MountKind::Retrieve => remove_pending(&mut state.retrieve, request_id).len(),
        };
        info!(%request_id, %kind, copies = aborted, "request creation aborted");
        Ok(())
    }

    fn finish_cancellation_now(&self, archive_file_id: ArchiveFileId) -> Result<(), SchedulerError> {
        let mut state = self.state();
        let cancellation = state.cancellations.remove(&archive_file_id).ok_or_else(|| {
            SchedulerError::NotFound(format!("pending cancellation of file {archive_file_id}"))
        })?;
        state.drop_archive_request(cancellation.request_id, archive_file_id);
        info!(archive_file_id, owner = %cancellation.owner, "archive request deleted");
        Ok(())
    }

    fn revert_cancellation_now(&self, archive_file_id: ArchiveFileId) -> Result<(), SchedulerError> {
        let mut state = self.state();
        let cancellation = state.cancellations.remove(&archive_file_id).ok_or_else(|| {
            SchedulerError::NotFound(format!("pending cancellation of file {archive_file_id}"))
        })?;
        for key in state.archive.keys_of(cancellation.request_id) {
            let status = cancellation
                .prior_status
                .get(&key.copy_nb)
                .copied()
                .unwrap_or(JobStatus::Queued);
            state.archive.set_status(&key, status);
        }
        info!(archive_file_id, owner = %cancellation.owner, "archive deletion reverted");
        Ok(())
    }

    fn next_job(&self, info: &MountInfo) -> Result<Option<Job>, SchedulerError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let session = state
            .sessions
            .get_mut(&info.mount_id)
            .ok_or_else(|| SchedulerError::NotFound(info.mount_id.to_string()))?;
        let popped = match info.kind {
            MountKind::Archive => state.archive.pop_queued(&info.tape_pool),
            MountKind::Retrieve => state.retrieve.pop_queued(&info.vid),
        };
        let Some((key, kind)) = popped else {
            debug!(mount_id = %info.mount_id, "queue drained");
            return Ok(None);
        };
        session.in_flight.insert(key);
        debug!(
            mount_id = %info.mount_id,
            request_id = %key.request_id,
            archive_file_id = kind.archive_file_id(),
            "job bound to mount"
        );
        Ok(Some(Job::new(key, info.mount_id, kind, Arc::new(self.clone()))))
    }

    fn mount_stats(&self, mount_id: MountId) -> Result<MountStats, SchedulerError> {
        self.state()
            .sessions
            .get(&mount_id)
            .map(|session| session.stats.clone())
            .ok_or_else(|| SchedulerError::NotFound(mount_id.to_string()))
    }

    /// Closes a session and re-queues what it never reported. The session
    /// leaves the store; its final stats are returned to the mount.
    fn close_session(
        &self,
        mount_id: MountId,
        completion_time: DateTime<Utc>,
    ) -> Result<MountStats, SchedulerError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let mut session = state
            .sessions
            .remove(&mount_id)
            .ok_or_else(|| SchedulerError::MountCompleted(mount_id))?;
        session.stats.completed_at = Some(completion_time);
        for key in &session.in_flight {
            match session.info.kind {
                MountKind::Archive => state.archive.set_status(key, JobStatus::Queued),
                MountKind::Retrieve => state.retrieve.set_status(key, JobStatus::Queued),
            };
        }
        if !session.in_flight.is_empty() {
            warn!(%mount_id, requeued = session.in_flight.len(), "mount completed with unreported jobs");
        }
        Ok(session.stats)
    }
}

fn commit_pending<E: LaneEntry>(lane: &mut Lane<E>, request_id: RequestId) -> usize {
    let keys = lane.keys_of(request_id);
    let mut committed = 0;
    for key in &keys {
        if lane
            .get(key)
            .is_some_and(|entry| entry.status() == JobStatus::PendingCreation)
        {
            lane.set_status(key, JobStatus::Queued);
            committed += 1;
        }
    }
    committed
}

fn remove_pending<E: LaneEntry>(lane: &mut Lane<E>, request_id: RequestId) -> Vec<E> {
    let pending: Vec<JobKey> = lane
        .keys_of(request_id)
        .into_iter()
        .filter(|key| {
            lane.get(key)
                .is_some_and(|entry| entry.status() == JobStatus::PendingCreation)
        })
        .collect();
    pending.iter().filter_map(|key| lane.remove(key)).collect()
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ping(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn queue_archive(
        &self,
        request: ArchiveRequest,
        criteria: ArchiveQueueCriteria,
    ) -> Result<RequestCreation, SchedulerError> {
        if criteria.copy_to_pool.is_empty() {
            return Err(SchedulerError::InvalidRouting(format!(
                "storage class {}",
                request.storage_class
            )));
        }
        let request_id = self.inner.ids.generate_request_id();
        let archive_file_id = criteria.archive_file_id;
        {
            let mut state = self.state();
            if state.archive_files.contains_key(&archive_file_id) {
                return Err(SchedulerError::DuplicateArchiveFile(archive_file_id));
            }
            for (copy_nb, tape_pool) in &criteria.copy_to_pool {
                let key = JobKey {
                    request_id,
                    copy_nb: *copy_nb,
                };
                let position = state.next_position(request.created_at, key);
                state.archive.insert(
                    position,
                    ArchiveJobEntry {
                        request_id,
                        archive_file_id,
                        copy_nb: *copy_nb,
                        tape_pool: tape_pool.clone(),
                        request: request.clone(),
                        mount_policy: criteria.mount_policy.clone(),
                        status: JobStatus::PendingCreation,
                        total_retries: 0,
                        last_error: None,
                    },
                );
            }
            state.archive_files.insert(archive_file_id, request_id);
        }
        info!(
            %request_id,
            archive_file_id,
            copies = criteria.copy_to_pool.len(),
            mount_policy = %criteria.mount_policy.name,
            "queued archive request"
        );
        Ok(RequestCreation::new(
            request_id,
            Box::new(CreationOutcome {
                store: self.clone(),
                kind: MountKind::Archive,
                request_id,
            }),
        ))
    }

    async fn queue_retrieve(
        &self,
        request: RetrieveRequest,
        criteria: RetrieveQueueCriteria,
    ) -> Result<RequestCreation, SchedulerError> {
        let tape_file = criteria
            .select_tape_file(request.vid.as_deref())
            .cloned()
            .ok_or_else(|| match &request.vid {
                Some(vid) => SchedulerError::InvalidRouting(format!(
                    "archive file {} on tape {vid}",
                    criteria.archive_file_id
                )),
                None => SchedulerError::InvalidRouting(format!(
                    "archive file {} (no tape copy)",
                    criteria.archive_file_id
                )),
            })?;
        let request_id = self.inner.ids.generate_request_id();
        let key = JobKey {
            request_id,
            copy_nb: tape_file.copy_nb,
        };
        let vid = tape_file.vid.clone();
        {
            let mut state = self.state();
            let position = state.next_position(request.created_at, key);
            state.retrieve.insert(
                position,
                RetrieveJobEntry {
                    request_id,
                    archive_file_id: criteria.archive_file_id,
                    tape_file,
                    file_size: criteria.file_size,
                    request,
                    mount_policy: criteria.mount_policy.clone(),
                    status: JobStatus::PendingCreation,
                    total_retries: 0,
                    last_error: None,
                },
            );
        }
        info!(
            %request_id,
            archive_file_id = criteria.archive_file_id,
            %vid,
            copy_nb = key.copy_nb,
            "queued retrieve request"
        );
        Ok(RequestCreation::new(
            request_id,
            Box::new(CreationOutcome {
                store: self.clone(),
                kind: MountKind::Retrieve,
                request_id,
            }),
        ))
    }

    async fn get_archive_requests(
        &self,
    ) -> Result<BTreeMap<String, Vec<ArchiveJobEntry>>, SchedulerError> {
        Ok(self.state().archive.listing())
    }

    async fn get_archive_requests_for_pool(
        &self,
        tape_pool: &str,
    ) -> Result<Vec<ArchiveJobEntry>, SchedulerError> {
        Ok(self.state().archive.listing_for(tape_pool))
    }

    async fn get_retrieve_requests(
        &self,
    ) -> Result<BTreeMap<String, Vec<RetrieveJobEntry>>, SchedulerError> {
        Ok(self.state().retrieve.listing())
    }

    async fn get_retrieve_requests_for_vid(
        &self,
        vid: &str,
    ) -> Result<Vec<RetrieveJobEntry>, SchedulerError> {
        Ok(self.state().retrieve.listing_for(vid))
    }

    async fn delete_archive_request(
        &self,
        authority: &Authority,
        archive_file_id: ArchiveFileId,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state();
        let (request_id, _) = state.modifiable_archive(authority, archive_file_id)?;
        state.drop_archive_request(request_id, archive_file_id);
        info!(archive_file_id, %request_id, by = %authority.identity(), "archive request deleted");
        Ok(())
    }

    async fn delete_retrieve_request(
        &self,
        authority: &Authority,
        remote_file: &str,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state();
        let matching: Vec<_> = state
            .retrieve
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.request.remote_file.path == remote_file)
            .map(|(key, slot)| (*key, slot.entry.status, slot.entry.request.requester.clone()))
            .collect();
        if matching.is_empty() {
            return Err(SchedulerError::NotFound(format!("retrieve request to {remote_file}")));
        }
        if let Some((_, _, owner)) = matching.iter().find(|(_, _, owner)| !authority.may_modify(owner)) {
            return Err(SchedulerError::PermissionDenied {
                requester: authority.identity().to_string(),
                what: format!("retrieve request of {owner} to {remote_file}"),
            });
        }
        if matching.iter().any(|(_, status, _)| *status == JobStatus::InFlight) {
            return Err(SchedulerError::RequestInFlight(format!("retrieve to {remote_file}")));
        }
        for (key, _, _) in &matching {
            state.retrieve.remove(key);
        }
        info!(remote_file, by = %authority.identity(), "retrieve request deleted");
        Ok(())
    }

    async fn mark_archive_request_for_deletion(
        &self,
        authority: &Authority,
        archive_file_id: ArchiveFileId,
    ) -> Result<RequestCancellation, SchedulerError> {
        let owner = self.inner.agent_id;
        let marked_at = self.inner.clock.now();
        {
            let mut state = self.state();
            let (request_id, keys) = state.modifiable_archive(authority, archive_file_id)?;
            let copies: Vec<_> = keys
                .iter()
                .filter_map(|key| state.archive.get(key).map(|entry| (*key, entry.clone())))
                .collect();
            // Uncommitted requests are undone through their creation handle.
            if copies
                .iter()
                .any(|(_, entry)| entry.status == JobStatus::PendingCreation)
            {
                return Err(SchedulerError::NotFound(format!(
                    "committed archive request for file {archive_file_id}"
                )));
            }
            let mut tape_pools = Vec::with_capacity(copies.len());
            let mut prior_status = BTreeMap::new();
            for (key, entry) in copies {
                tape_pools.push(entry.tape_pool);
                prior_status.insert(entry.copy_nb, entry.status);
                state.archive.set_status(&key, JobStatus::MarkedForDeletion);
            }
            state.cancellations.insert(
                archive_file_id,
                PendingCancellation {
                    owner,
                    archive_file_id,
                    request_id,
                    tape_pools,
                    prior_status,
                    marked_at,
                },
            );
        }
        debug!(archive_file_id, %owner, "archive request marked for deletion");
        Ok(RequestCancellation::new(
            archive_file_id,
            owner,
            Box::new(CancellationOutcome {
                store: self.clone(),
                archive_file_id,
            }),
        ))
    }

    async fn pending_cancellations(&self) -> Result<Vec<PendingCancellation>, SchedulerError> {
        Ok(self.state().cancellations.values().cloned().collect())
    }

    async fn finish_cancellation(&self, archive_file_id: ArchiveFileId) -> Result<(), SchedulerError> {
        self.finish_cancellation_now(archive_file_id)
    }

    async fn revert_cancellation(&self, archive_file_id: ArchiveFileId) -> Result<(), SchedulerError> {
        self.revert_cancellation_now(archive_file_id)
    }

    async fn get_failed_archive_jobs(&self) -> Result<Vec<ArchiveJobEntry>, SchedulerError> {
        Ok(self.state().archive.with_status(JobStatus::Failed))
    }

    async fn get_failed_retrieve_jobs(&self) -> Result<Vec<RetrieveJobEntry>, SchedulerError> {
        Ok(self.state().retrieve.with_status(JobStatus::Failed))
    }

    async fn get_mount_info(&self) -> Result<MountDecision, SchedulerError> {
        let lease = self.inner.scheduling_lock.clone().lock_owned().await;
        debug!("acquired global scheduling lock");
        self.snapshot(Some(lease)).await
    }

    async fn get_mount_info_no_lock(&self) -> Result<MountDecision, SchedulerError> {
        self.snapshot(None).await
    }
}

#[async_trait]
impl MountFactory for InMemoryQueueStore {
    async fn create_mount(
        &self,
        kind: MountKind,
        request: MountRequest,
    ) -> Result<Box<dyn TapeMount>, SchedulerError> {
        let now = self.inner.clock.now();
        let info = MountInfo::new(self.inner.ids.generate_mount_id(), kind, request);
        let conflict = self
            .state()
            .sessions
            .values()
            .find(|s| {
                s.info.drive_name == info.drive_name || (!info.vid.is_empty() && s.info.vid == info.vid)
            })
            .map(|s| format!("{} already runs on drive {} with tape {}", s.info.mount_id, s.info.drive_name, s.info.vid));
        if let Some(detail) = conflict {
            error!(drive = %info.drive_name, vid = %info.vid, %detail, "refusing concurrent mount");
            return Err(SchedulerError::ConcurrentMountConflict(detail));
        }
        if let Err(e) = self.inner.drives.reserve_for_mount(&info, now).await {
            if e.is_fatal() {
                error!(drive = %info.drive_name, vid = %info.vid, error = %e, "drive reservation refused");
            }
            return Err(e);
        }
        self.state().sessions.insert(
            info.mount_id,
            Session {
                info: info.clone(),
                stats: MountStats::default(),
                in_flight: BTreeSet::new(),
            },
        );
        info!(
            mount_id = %info.mount_id,
            %kind,
            vid = %info.vid,
            tape_pool = %info.tape_pool,
            drive = %info.drive_name,
            "mount created"
        );
        Ok(Box::new(MemoryMount {
            info,
            store: self.clone(),
            completed: Mutex::new(None),
        }))
    }
}

#[async_trait]
impl JobReporter for InMemoryQueueStore {
    async fn report_success(&self, mount_id: MountId, key: JobKey) -> Result<(), SchedulerError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let session = state
            .sessions
            .get_mut(&mount_id)
            .ok_or_else(|| SchedulerError::NotFound(mount_id.to_string()))?;
        if !session.in_flight.remove(&key) {
            return Err(SchedulerError::NotFound(format!(
                "job {} in flight on {mount_id}",
                key.request_id
            )));
        }
        match session.info.kind {
            MountKind::Archive => {
                let entry = state
                    .archive
                    .remove(&key)
                    .ok_or_else(|| SchedulerError::NotFound(key.request_id.to_string()))?;
                session.stats.files_transferred += 1;
                session.stats.bytes_transferred += entry.request.file_size;
                session.stats.nb_files_currently_on_tape += 1;
                if state.archive.keys_of(entry.request_id).is_empty() {
                    state.archive_files.remove(&entry.archive_file_id);
                    info!(archive_file_id = entry.archive_file_id, "all copies archived");
                }
                debug!(%mount_id, archive_file_id = entry.archive_file_id, copy_nb = entry.copy_nb, "archive job succeeded");
            }
            MountKind::Retrieve => {
                let entry = state
                    .retrieve
                    .remove(&key)
                    .ok_or_else(|| SchedulerError::NotFound(key.request_id.to_string()))?;
                session.stats.files_transferred += 1;
                session.stats.bytes_transferred += entry.file_size;
                debug!(%mount_id, archive_file_id = entry.archive_file_id, "retrieve job succeeded");
            }
        }
        Ok(())
    }

    async fn report_failure(
        &self,
        mount_id: MountId,
        key: JobKey,
        reason: String,
    ) -> Result<(), SchedulerError> {
        let max_total_retries = self.inner.max_total_retries;
        let mut guard = self.state();
        let state = &mut *guard;
        let session = state
            .sessions
            .get_mut(&mount_id)
            .ok_or_else(|| SchedulerError::NotFound(mount_id.to_string()))?;
        if !session.in_flight.remove(&key) {
            return Err(SchedulerError::NotFound(format!(
                "job {} in flight on {mount_id}",
                key.request_id
            )));
        }
        session.stats.files_failed += 1;
        let outcome = match session.info.kind {
            MountKind::Archive => state.archive.fail(&key, reason.clone(), max_total_retries),
            MountKind::Retrieve => state.retrieve.fail(&key, reason.clone(), max_total_retries),
        };
        match outcome {
            Some((JobStatus::Failed, retries)) => {
                warn!(%mount_id, request_id = %key.request_id, retries, %reason, "job failed for good");
            }
            Some((_, retries)) => {
                warn!(%mount_id, request_id = %key.request_id, retries, %reason, "job failed, requeued");
            }
            None => return Err(SchedulerError::NotFound(key.request_id.to_string())),
        }
        Ok(())
    }
}

// ============================================================================
// Handles
// ============================================================================

struct CreationOutcome {
    store: InMemoryQueueStore,
    kind: MountKind,
    request_id: RequestId,
}

impl CreationFinalizer for CreationOutcome {
    fn commit(self: Box<Self>) -> Result<(), SchedulerError> {
        self.store.commit_creation(self.kind, self.request_id)
    }

    fn abort(self: Box<Self>) -> Result<(), SchedulerError> {
        self.store.abort_creation(self.kind, self.request_id)
    }
}

struct CancellationOutcome {
    store: InMemoryQueueStore,
    archive_file_id: ArchiveFileId,
}

impl CancellationFinalizer for CancellationOutcome {
    fn complete(self: Box<Self>) -> Result<(), SchedulerError> {
        self.store.finish_cancellation_now(self.archive_file_id)
    }

    fn revert(self: Box<Self>) -> Result<(), SchedulerError> {
        self.store.revert_cancellation_now(self.archive_file_id)
    }
}

struct MemoryMount {
    info: MountInfo,
    store: InMemoryQueueStore,
    /// Final stats, once `complete()` closed the session.
    completed: Mutex<Option<MountStats>>,
}

impl MemoryMount {
    fn completed(&self) -> MutexGuard<'_, Option<MountStats>> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TapeMount for MemoryMount {
    fn info(&self) -> &MountInfo {
        &self.info
    }

    async fn next_job(&self) -> Result<Option<Job>, SchedulerError> {
        if self.completed().is_some() {
            return Err(SchedulerError::MountCompleted(self.info.mount_id));
        }
        self.store.next_job(&self.info)
    }

    async fn set_drive_status(&self, status: DriveStatus) -> Result<(), SchedulerError> {
        let now = self.store.inner.clock.now();
        self.store
            .inner
            .drives
            .report_drive_status(&self.info.drive_name, status, now)
            .await
            .map(|_| ())
    }

    async fn stats(&self) -> Result<MountStats, SchedulerError> {
        if let Some(stats) = self.completed().clone() {
            return Ok(stats);
        }
        self.store.mount_stats(self.info.mount_id)
    }

    async fn complete(&self, completion_time: DateTime<Utc>) -> Result<MountStats, SchedulerError> {
        let stats = self.store.close_session(self.info.mount_id, completion_time)?;
        *self.completed() = Some(stats.clone());
        let drive = self
            .store
            .inner
            .drives
            .end_session(&self.info.drive_name, completion_time)
            .await?;
        info!(
            mount_id = %self.info.mount_id,
            drive = %self.info.drive_name,
            files = stats.files_transferred,
            failed = stats.files_failed,
            drive_status = ?drive.status,
            "mount completed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        DedicationEntry, DesiredDriveState, DriveInfo, RemotePathAndStatus, RequesterIdentity,
        TapeFile,
    };
    use crate::impls::InMemoryDriveRegistry;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn policy(name: &str, priority: u64) -> MountPolicy {
        MountPolicy {
            name: name.into(),
            archive_priority: priority,
            retrieve_priority: priority,
            max_files_queued: 1,
            max_bytes_queued: 1,
            max_request_age: Duration::from_secs(60),
            max_drives_allowed: 2,
        }
    }

    fn alice() -> RequesterIdentity {
        RequesterIdentity::new("alice", "atlas")
    }

    fn archive(file: &str, size: u64, at: DateTime<Utc>) -> ArchiveRequest {
        ArchiveRequest {
            disk_instance: "eosdev".into(),
            storage_class: "dual".into(),
            requester: alice(),
            src_url: format!("root://eos/{file}"),
            remote_file: RemotePathAndStatus::new(format!("/eos/{file}")),
            file_size: size,
            created_at: at,
        }
    }

    fn archive_criteria(id: ArchiveFileId, pools: &[(u32, &str)], priority: u64) -> ArchiveQueueCriteria {
        ArchiveQueueCriteria {
            archive_file_id: id,
            copy_to_pool: pools.iter().map(|(nb, p)| (*nb, p.to_string())).collect(),
            mount_policy: policy("default", priority),
        }
    }

    fn retrieve(file: &str, vid: Option<&str>) -> RetrieveRequest {
        RetrieveRequest {
            disk_instance: "eosdev".into(),
            archive_file_id: 7,
            requester: alice(),
            dst_url: format!("root://eos/{file}"),
            remote_file: RemotePathAndStatus::new(format!("/eos/{file}")),
            vid: vid.map(str::to_string),
            created_at: t0(),
        }
    }

    fn retrieve_criteria() -> RetrieveQueueCriteria {
        RetrieveQueueCriteria {
            archive_file_id: 7,
            file_size: 500,
            tape_files: vec![
                TapeFile {
                    vid: "V00002".into(),
                    copy_nb: 2,
                    fseq: 4,
                },
                TapeFile {
                    vid: "V00001".into(),
                    copy_nb: 1,
                    fseq: 9,
                },
            ],
            mount_policy: policy("default", 1),
        }
    }

    async fn fixture() -> (InMemoryQueueStore, Arc<InMemoryDriveRegistry>) {
        fixture_with_retries(3).await
    }

    async fn fixture_with_retries(retries: u32) -> (InMemoryQueueStore, Arc<InMemoryDriveRegistry>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let drives = Arc::new(InMemoryDriveRegistry::new());
        for name in ["D1", "D2"] {
            drives
                .register_drive(
                    DriveInfo {
                        name: name.into(),
                        logical_library: "LIB1".into(),
                        host: "tpsrv01".into(),
                        dedication: DedicationEntry::default(),
                    },
                    t0(),
                )
                .await
                .unwrap();
            drives
                .set_desired_drive_state(name, DesiredDriveState::up(), t0())
                .await
                .unwrap();
        }
        let store = InMemoryQueueStore::new(
            drives.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
            retries,
        );
        (store, drives)
    }

    fn mount_request(drive: &str, vid: &str, pool: &str) -> MountRequest {
        MountRequest {
            vid: vid.into(),
            tape_pool: pool.into(),
            drive_name: drive.into(),
            logical_library: "LIB1".into(),
            host_name: "tpsrv01".into(),
            start_time: t0(),
        }
    }

    async fn queue_committed(store: &InMemoryQueueStore, id: ArchiveFileId, at: DateTime<Utc>) {
        store
            .queue_archive(archive(&format!("f{id}"), 100, at), archive_criteria(id, &[(1, "pool_a")], 1))
            .await
            .unwrap()
            .commit()
            .unwrap();
    }

    #[tokio::test]
    async fn each_copy_is_queued_in_its_own_pool() {
        let (store, _) = fixture().await;
        store
            .queue_archive(
                archive("f1", 100, t0()),
                archive_criteria(1, &[(1, "pool_a"), (2, "pool_b")], 1),
            )
            .await
            .unwrap()
            .commit()
            .unwrap();

        let all = store.get_archive_requests().await.unwrap();
        assert_eq!(all.keys().map(String::as_str).collect::<Vec<_>>(), vec!["pool_a", "pool_b"]);
        assert_eq!(all["pool_b"][0].copy_nb, 2);
        assert_eq!(all["pool_a"][0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn uncommitted_requests_are_listed_but_not_mountable() {
        let (store, _) = fixture().await;
        let creation = store
            .queue_archive(archive("f1", 100, t0()), archive_criteria(1, &[(1, "pool_a")], 1))
            .await
            .unwrap();

        let listed = store.get_archive_requests_for_pool("pool_a").await.unwrap();
        assert_eq!(listed[0].status, JobStatus::PendingCreation);
        let decision = store.get_mount_info_no_lock().await.unwrap();
        assert!(decision.potential_mounts.is_empty());

        creation.commit().unwrap();
        let decision = store.get_mount_info_no_lock().await.unwrap();
        assert_eq!(decision.potential_mounts.len(), 1);
    }

    #[tokio::test]
    async fn dropped_creation_is_aborted() {
        let (store, _) = fixture().await;
        {
            let _creation = store
                .queue_archive(archive("f1", 100, t0()), archive_criteria(1, &[(1, "pool_a")], 1))
                .await
                .unwrap();
        }
        assert!(store.get_archive_requests().await.unwrap().is_empty());

        // The archive file id is free again.
        queue_committed(&store, 1, t0()).await;
    }

    #[tokio::test]
    async fn duplicate_archive_file_is_rejected() {
        let (store, _) = fixture().await;
        queue_committed(&store, 1, t0()).await;
        let err = store
            .queue_archive(archive("f1", 100, t0()), archive_criteria(1, &[(1, "pool_a")], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateArchiveFile(1)));
    }

    #[tokio::test]
    async fn retrieve_goes_to_the_lowest_copy_unless_pinned() {
        let (store, _) = fixture().await;
        store
            .queue_retrieve(retrieve("a", None), retrieve_criteria())
            .await
            .unwrap()
            .commit()
            .unwrap();
        store
            .queue_retrieve(retrieve("b", Some("V00002")), retrieve_criteria())
            .await
            .unwrap()
            .commit()
            .unwrap();

        let all = store.get_retrieve_requests().await.unwrap();
        assert_eq!(all["V00001"][0].request.remote_file.path, "/eos/a");
        assert_eq!(all["V00002"][0].request.remote_file.path, "/eos/b");

        let err = store
            .queue_retrieve(retrieve("c", Some("V00009")), retrieve_criteria())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRouting(_)));
    }

    #[tokio::test]
    async fn candidates_aggregate_their_queue() {
        let (store, _) = fixture().await;
        store
            .queue_archive(archive("f1", 100, t0()), archive_criteria(1, &[(1, "pool_a")], 10))
            .await
            .unwrap()
            .commit()
            .unwrap();
        store
            .queue_archive(
                archive("f2", 300, t0() - ChronoDuration::minutes(5)),
                archive_criteria(2, &[(1, "pool_a")], 50),
            )
            .await
            .unwrap()
            .commit()
            .unwrap();

        let decision = store.get_mount_info_no_lock().await.unwrap();
        let candidate = &decision.potential_mounts[0];
        assert_eq!(candidate.tape_pool, "pool_a");
        assert_eq!(candidate.files_queued, 2);
        assert_eq!(candidate.bytes_queued, 400);
        assert_eq!(candidate.priority, 50);
        assert_eq!(candidate.oldest_job_start_time, t0() - ChronoDuration::minutes(5));
    }

    #[tokio::test]
    async fn mount_info_serialises_schedulers() {
        let (store, _) = fixture().await;
        let mut first = store.get_mount_info().await.unwrap();
        assert!(first.holds_lock());

        let blocked = tokio::time::timeout(Duration::from_millis(50), store.get_mount_info()).await;
        assert!(blocked.is_err());

        first.release();
        first.release();
        let second = tokio::time::timeout(Duration::from_millis(500), store.get_mount_info())
            .await
            .expect("lock released")
            .unwrap();
        assert!(second.holds_lock());
    }

    #[tokio::test]
    async fn lock_free_snapshot_cannot_create_mounts() {
        let (store, _) = fixture().await;
        let mut snapshot = store.get_mount_info_no_lock().await.unwrap();
        let err = snapshot
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SchedulingLockNotHeld));
    }

    #[tokio::test]
    async fn jobs_come_out_oldest_first_and_only_once() {
        let (store, _) = fixture().await;
        queue_committed(&store, 3, t0() + ChronoDuration::seconds(3)).await;
        queue_committed(&store, 1, t0() + ChronoDuration::seconds(1)).await;
        queue_committed(&store, 2, t0() + ChronoDuration::seconds(2)).await;

        let mut decision = store.get_mount_info().await.unwrap();
        let mount = decision
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();
        assert!(!decision.holds_lock());

        let mut order = Vec::new();
        while let Some(job) = mount.next_job().await.unwrap() {
            order.push(job.kind().archive_file_id());
            job.succeed().await.unwrap();
        }
        assert_eq!(order, vec![1, 2, 3]);
        assert!(store.get_archive_requests().await.unwrap().is_empty());

        let stats = mount.stats().await.unwrap();
        assert_eq!(stats.files_transferred, 3);
        assert_eq!(stats.bytes_transferred, 300);
    }

    #[tokio::test]
    async fn failed_jobs_are_requeued_then_parked() {
        let (store, _) = fixture_with_retries(2).await;
        queue_committed(&store, 1, t0()).await;
        queue_committed(&store, 2, t0() + ChronoDuration::seconds(1)).await;

        let mut decision = store.get_mount_info().await.unwrap();
        let mount = decision
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();

        let job = mount.next_job().await.unwrap().unwrap();
        job.fail("write error").await.unwrap();
        let queued = store.get_archive_requests_for_pool("pool_a").await.unwrap();
        assert_eq!(queued[0].archive_file_id, 1);
        assert_eq!(queued[0].total_retries, 1);
        assert_eq!(queued[0].last_error.as_deref(), Some("write error"));

        let job = mount.next_job().await.unwrap().unwrap();
        assert_eq!(job.kind().archive_file_id(), 1);
        job.fail("write error again").await.unwrap();

        let failed = store.get_failed_archive_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, JobStatus::Failed);
        let queued = store.get_archive_requests_for_pool("pool_a").await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(mount.stats().await.unwrap().files_failed, 2);
    }

    #[tokio::test]
    async fn completion_requeues_unreported_jobs_and_frees_the_drive() {
        let (store, drives) = fixture().await;
        queue_committed(&store, 1, t0()).await;

        let mut decision = store.get_mount_info().await.unwrap();
        let mount = decision
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();
        assert_eq!(drives.drive_state("D1").await.unwrap().status, DriveStatus::Starting);

        let job = mount.next_job().await.unwrap().unwrap();
        assert!(store.get_archive_requests().await.unwrap().is_empty());

        let stats = mount.complete(t0()).await.unwrap();
        assert!(stats.is_complete());
        assert_eq!(store.get_archive_requests_for_pool("pool_a").await.unwrap().len(), 1);
        assert_eq!(drives.drive_state("D1").await.unwrap().status, DriveStatus::Up);

        assert!(matches!(mount.next_job().await, Err(SchedulerError::MountCompleted(_))));
        assert!(job.succeed().await.is_err());
    }

    #[tokio::test]
    async fn tape_cannot_be_mounted_twice() {
        let (store, _) = fixture().await;
        let mut decision = store.get_mount_info().await.unwrap();
        let _mount = decision
            .create_retrieve_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();

        let mut decision = store.get_mount_info().await.unwrap();
        let err = decision
            .create_retrieve_mount(mount_request("D2", "V00001", "pool_a"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(decision.holds_lock());
    }

    #[tokio::test]
    async fn deletion_checks_ownership() {
        let (store, _) = fixture().await;
        queue_committed(&store, 1, t0()).await;

        let bob = Authority::Owner(RequesterIdentity::new("bob", "atlas"));
        let err = store.delete_archive_request(&bob, 1).await.unwrap_err();
        assert!(matches!(err, SchedulerError::PermissionDenied { .. }));

        let admin = Authority::Admin(RequesterIdentity::new("ops", "tape"));
        store.delete_archive_request(&admin, 1).await.unwrap();
        assert!(matches!(
            store.delete_archive_request(&admin, 1).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retrieve_is_deleted_by_destination() {
        let (store, _) = fixture().await;
        store
            .queue_retrieve(retrieve("a", None), retrieve_criteria())
            .await
            .unwrap()
            .commit()
            .unwrap();

        let owner = Authority::Owner(alice());
        store.delete_retrieve_request(&owner, "/eos/a").await.unwrap();
        assert!(store.get_retrieve_requests().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_retrieve_request(&owner, "/eos/a").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn marked_requests_leave_the_queue_until_reverted() {
        let (store, _) = fixture().await;
        queue_committed(&store, 1, t0()).await;
        let owner = Authority::Owner(alice());

        let cancellation = store.mark_archive_request_for_deletion(&owner, 1).await.unwrap();
        assert!(store.get_archive_requests().await.unwrap().is_empty());
        assert_eq!(cancellation.owner(), store.agent_id());

        cancellation.revert().unwrap();
        assert_eq!(store.get_archive_requests_for_pool("pool_a").await.unwrap().len(), 1);
        assert!(store.pending_cancellations().await.unwrap().is_empty());

        store
            .mark_archive_request_for_deletion(&owner, 1)
            .await
            .unwrap()
            .complete()
            .unwrap();
        assert!(store.get_archive_requests().await.unwrap().is_empty());
        assert!(store.pending_cancellations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_cancellation_is_visible_to_the_sweep() {
        let (store, _) = fixture().await;
        queue_committed(&store, 1, t0()).await;

        drop(
            store
                .mark_archive_request_for_deletion(&Authority::Owner(alice()), 1)
                .await
                .unwrap(),
        );

        let pending = store.pending_cancellations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].owner, store.agent_id());
        assert_eq!(pending[0].tape_pools, vec!["pool_a".to_string()]);

        store.finish_cancellation(1).await.unwrap();
        assert!(store.pending_cancellations().await.unwrap().is_empty());
        assert!(store.get_archive_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncommitted_requests_cannot_be_marked_for_deletion() {
        let (store, _) = fixture().await;
        let creation = store
            .queue_archive(archive("f1", 100, t0()), archive_criteria(1, &[(1, "pool_a")], 1))
            .await
            .unwrap();

        let err = store
            .mark_archive_request_for_deletion(&Authority::Owner(alice()), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
        assert!(store.pending_cancellations().await.unwrap().is_empty());

        creation.abort().unwrap();
        assert!(store.get_archive_requests().await.unwrap().is_empty());
        assert!(store.get_mount_info_no_lock().await.unwrap().potential_mounts.is_empty());
    }

    #[tokio::test]
    async fn reverted_deletion_keeps_failed_copies_failed() {
        let (store, _) = fixture_with_retries(1).await;
        queue_committed(&store, 1, t0()).await;
        let mut decision = store.get_mount_info().await.unwrap();
        let mount = decision
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();
        mount.next_job().await.unwrap().unwrap().fail("bad block").await.unwrap();
        assert_eq!(store.get_failed_archive_jobs().await.unwrap().len(), 1);

        let cancellation = store
            .mark_archive_request_for_deletion(&Authority::Owner(alice()), 1)
            .await
            .unwrap();
        assert!(store.get_failed_archive_jobs().await.unwrap().is_empty());
        assert_eq!(
            store.pending_cancellations().await.unwrap()[0].prior_status[&1],
            JobStatus::Failed
        );
        cancellation.revert().unwrap();

        let failed = store.get_failed_archive_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].total_retries, 1);
        assert!(store.get_archive_requests().await.unwrap().is_empty());
        assert!(mount.next_job().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pulls_never_share_a_job() {
        let (store, _) = fixture().await;
        for id in 1..=40 {
            queue_committed(&store, id, t0() + ChronoDuration::seconds(id as i64)).await;
        }
        let mut decision = store.get_mount_info().await.unwrap();
        let mount: Arc<dyn TapeMount> = Arc::from(
            decision
                .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
                .await
                .unwrap(),
        );

        let pullers: Vec<_> = (0..4)
            .map(|_| {
                let mount = Arc::clone(&mount);
                tokio::spawn(async move {
                    let mut pulled = Vec::new();
                    while let Some(job) = mount.next_job().await.unwrap() {
                        pulled.push(job.kind().archive_file_id());
                        tokio::task::yield_now().await;
                        job.succeed().await.unwrap();
                    }
                    pulled
                })
            })
            .collect();
        let mut all = Vec::new();
        for puller in pullers {
            all.extend(puller.await.unwrap());
        }

        all.sort_unstable();
        assert_eq!(all, (1..=40).collect::<Vec<ArchiveFileId>>());
        assert_eq!(mount.stats().await.unwrap().files_transferred, 40);
        assert!(store.get_archive_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_stop_at_file_or_byte_limits() {
        let (store, _) = fixture().await;
        for id in 1..=6 {
            queue_committed(&store, id, t0() + ChronoDuration::seconds(id as i64)).await;
        }
        let mut decision = store.get_mount_info().await.unwrap();
        let mount = decision
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();

        let batch = mount.next_job_batch(3, u64::MAX).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|job| job.kind().archive_file_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        for job in batch {
            job.succeed().await.unwrap();
        }

        // Files are 100 bytes: the second one crosses 150.
        let batch = mount.next_job_batch(10, 150).await.unwrap();
        assert_eq!(batch.len(), 2);
        for job in batch {
            job.succeed().await.unwrap();
        }
        let rest = mount.next_job_batch(10, u64::MAX).await.unwrap();
        assert_eq!(rest.len(), 1);
        for job in rest {
            job.succeed().await.unwrap();
        }
        assert!(mount.next_job_batch(10, u64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_mounts_leave_the_store() {
        let (store, _) = fixture().await;
        queue_committed(&store, 1, t0()).await;
        let mut decision = store.get_mount_info().await.unwrap();
        let mount = decision
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();
        mount.next_job().await.unwrap().unwrap().succeed().await.unwrap();
        assert_eq!(store.state().sessions.len(), 1);

        let stats = mount.complete(t0()).await.unwrap();
        assert!(store.state().sessions.is_empty());
        assert_eq!(mount.stats().await.unwrap(), stats);
        assert!(matches!(
            mount.complete(t0()).await,
            Err(SchedulerError::MountCompleted(_))
        ));

        // The drive and tape are free for the next decision.
        let mut decision = store.get_mount_info().await.unwrap();
        assert!(decision.existing_mounts.is_empty());
        decision
            .create_archive_mount(mount_request("D1", "V00001", "pool_a"))
            .await
            .unwrap();
    }
}
