//! InMemoryCatalogue - テスト・デモ用のカタログ
//!
//! # 使用例
//! ```ignore
//! let catalogue = InMemoryCatalogue::builder()
//!     .logical_library("LIB1")
//!     .mount_policy(policy)
//!     .storage_class("dual", [(1, "pool_a"), (2, "pool_b")], "default")
//!     .tape("V00001", "pool_a", "LIB1")
//!     .build()?;
//! ```
//!
//! # Fail-fast 設計
//! build() 時に storage class → mount policy、tape → logical library の
//! 参照がすべて解決できるかをチェックする

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    ArchiveFileId, ArchiveQueueCriteria, MountPolicy, RequesterIdentity, RetrieveQueueCriteria,
    SchedulerError, TapeFile,
};
use crate::ports::{Catalogue, LogicalLibrary, TapeForWriting, TapeInfo};

/// Routing of a storage class: one tape pool per copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClass {
    pub name: String,
    pub copy_to_pool: BTreeMap<u32, String>,
    /// Mount policy applied unless the requester has its own.
    pub mount_policy: String,
}

#[derive(Debug, Clone)]
struct ArchivedFile {
    storage_class: String,
    file_size: u64,
    tape_files: Vec<TapeFile>,
}

#[derive(Debug, Clone)]
struct TapeRecord {
    info: TapeInfo,
    last_fseq: u64,
    full: bool,
}

#[derive(Debug, Default)]
pub struct CatalogueBuilder {
    libraries: BTreeMap<String, LogicalLibrary>,
    mount_policies: BTreeMap<String, MountPolicy>,
    storage_classes: BTreeMap<String, StorageClass>,
    requester_policies: HashMap<String, String>,
    tapes: BTreeMap<String, TapeRecord>,
    admins: BTreeSet<String>,
    first_archive_file_id: u64,
}

impl CatalogueBuilder {
    pub fn logical_library(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.libraries.insert(
            name.clone(),
            LogicalLibrary {
                name,
                disabled: false,
            },
        );
        self
    }

    pub fn disabled_logical_library(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.libraries.insert(
            name.clone(),
            LogicalLibrary {
                name,
                disabled: true,
            },
        );
        self
    }

    pub fn mount_policy(mut self, policy: MountPolicy) -> Self {
        self.mount_policies.insert(policy.name.clone(), policy);
        self
    }

    pub fn storage_class<I, P>(mut self, name: impl Into<String>, copies: I, mount_policy: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (u32, P)>,
        P: Into<String>,
    {
        let name = name.into();
        self.storage_classes.insert(
            name.clone(),
            StorageClass {
                name,
                copy_to_pool: copies.into_iter().map(|(nb, pool)| (nb, pool.into())).collect(),
                mount_policy: mount_policy.into(),
            },
        );
        self
    }

    /// Requests from `requester` use `mount_policy` whatever their storage class.
    pub fn requester_mount_policy(mut self, requester: impl Into<String>, mount_policy: impl Into<String>) -> Self {
        self.requester_policies.insert(requester.into(), mount_policy.into());
        self
    }

    pub fn tape(
        mut self,
        vid: impl Into<String>,
        tape_pool: impl Into<String>,
        logical_library: impl Into<String>,
    ) -> Self {
        let vid = vid.into();
        self.tapes.insert(
            vid.clone(),
            TapeRecord {
                info: TapeInfo {
                    vid,
                    tape_pool: tape_pool.into(),
                    logical_library: logical_library.into(),
                    disabled: false,
                },
                last_fseq: 0,
                full: false,
            },
        );
        self
    }

    pub fn admin(mut self, name: impl Into<String>) -> Self {
        self.admins.insert(name.into());
        self
    }

    pub fn first_archive_file_id(mut self, id: ArchiveFileId) -> Self {
        self.first_archive_file_id = id;
        self
    }

    pub fn build(self) -> Result<InMemoryCatalogue, SchedulerError> {
        let known_policy = |name: &String| self.mount_policies.contains_key(name);
        if let Some(sc) = self
            .storage_classes
            .values()
            .find(|sc| !known_policy(&sc.mount_policy))
        {
            return Err(SchedulerError::Catalogue(format!(
                "storage class {} uses unknown mount policy {}",
                sc.name, sc.mount_policy
            )));
        }
        if let Some((requester, policy)) = self
            .requester_policies
            .iter()
            .find(|(_, policy)| !known_policy(policy))
        {
            return Err(SchedulerError::Catalogue(format!(
                "requester {requester} uses unknown mount policy {policy}"
            )));
        }
        if let Some(tape) = self
            .tapes
            .values()
            .find(|t| !self.libraries.contains_key(&t.info.logical_library))
        {
            return Err(SchedulerError::Catalogue(format!(
                "tape {} is in unknown logical library {}",
                tape.info.vid, tape.info.logical_library
            )));
        }
        Ok(InMemoryCatalogue {
            next_archive_file_id: AtomicU64::new(self.first_archive_file_id.max(1)),
            libraries: self.libraries,
            mount_policies: self.mount_policies,
            storage_classes: self.storage_classes,
            requester_policies: self.requester_policies,
            admins: self.admins,
            tapes: Mutex::new(self.tapes),
            files: Mutex::new(HashMap::new()),
        })
    }
}

/// Catalogue held in memory. Tape contents are recorded through
/// [`InMemoryCatalogue::record_tape_file`] as archives complete.
#[derive(Debug)]
pub struct InMemoryCatalogue {
    next_archive_file_id: AtomicU64,
    libraries: BTreeMap<String, LogicalLibrary>,
    mount_policies: BTreeMap<String, MountPolicy>,
    storage_classes: BTreeMap<String, StorageClass>,
    requester_policies: HashMap<String, String>,
    admins: BTreeSet<String>,
    tapes: Mutex<BTreeMap<String, TapeRecord>>,
    files: Mutex<HashMap<ArchiveFileId, ArchivedFile>>,
}

impl InMemoryCatalogue {
    pub fn builder() -> CatalogueBuilder {
        CatalogueBuilder::default()
    }

    fn tapes(&self) -> MutexGuard<'_, BTreeMap<String, TapeRecord>> {
        self.tapes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn files(&self) -> MutexGuard<'_, HashMap<ArchiveFileId, ArchivedFile>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn storage_class(&self, name: &str) -> Result<&StorageClass, SchedulerError> {
        self.storage_classes
            .get(name)
            .ok_or_else(|| SchedulerError::InvalidRouting(format!("storage class {name}")))
    }

    fn policy_for(&self, requester: &RequesterIdentity, storage_class: &StorageClass) -> Result<MountPolicy, SchedulerError> {
        let name = self
            .requester_policies
            .get(&requester.name)
            .unwrap_or(&storage_class.mount_policy);
        self.mount_policies
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::Catalogue(format!("unknown mount policy {name}")))
    }

    /// Records a copy written to tape. Returns the fseq it was written at.
    pub fn record_tape_file(
        &self,
        archive_file_id: ArchiveFileId,
        storage_class: &str,
        file_size: u64,
        copy_nb: u32,
        vid: &str,
    ) -> Result<u64, SchedulerError> {
        let fseq = {
            let mut tapes = self.tapes();
            let tape = tapes
                .get_mut(vid)
                .ok_or_else(|| SchedulerError::NotFound(format!("tape {vid}")))?;
            tape.last_fseq += 1;
            tape.last_fseq
        };
        let mut files = self.files();
        let file = files.entry(archive_file_id).or_insert_with(|| ArchivedFile {
            storage_class: storage_class.to_string(),
            file_size,
            tape_files: Vec::new(),
        });
        file.tape_files.retain(|tf| tf.copy_nb != copy_nb);
        file.tape_files.push(TapeFile {
            vid: vid.to_string(),
            copy_nb,
            fseq,
        });
        Ok(fseq)
    }

    /// A full tape is no longer offered for writing.
    pub fn set_tape_full(&self, vid: &str, full: bool) -> Result<(), SchedulerError> {
        self.tapes()
            .get_mut(vid)
            .map(|tape| tape.full = full)
            .ok_or_else(|| SchedulerError::NotFound(format!("tape {vid}")))
    }

    pub fn set_tape_disabled(&self, vid: &str, disabled: bool) -> Result<(), SchedulerError> {
        self.tapes()
            .get_mut(vid)
            .map(|tape| tape.info.disabled = disabled)
            .ok_or_else(|| SchedulerError::NotFound(format!("tape {vid}")))
    }
}

#[async_trait]
impl Catalogue for InMemoryCatalogue {
    async fn next_archive_file_id(
        &self,
        _disk_instance: &str,
        storage_class: &str,
        _requester: &RequesterIdentity,
    ) -> Result<ArchiveFileId, SchedulerError> {
        self.storage_class(storage_class)?;
        Ok(self.next_archive_file_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn archive_queue_criteria(
        &self,
        _disk_instance: &str,
        storage_class: &str,
        requester: &RequesterIdentity,
        archive_file_id: ArchiveFileId,
    ) -> Result<ArchiveQueueCriteria, SchedulerError> {
        let sc = self.storage_class(storage_class)?;
        if sc.copy_to_pool.is_empty() {
            return Err(SchedulerError::InvalidRouting(format!("storage class {storage_class}")));
        }
        Ok(ArchiveQueueCriteria {
            archive_file_id,
            copy_to_pool: sc.copy_to_pool.clone(),
            mount_policy: self.policy_for(requester, sc)?,
        })
    }

    async fn retrieve_queue_criteria(
        &self,
        _disk_instance: &str,
        archive_file_id: ArchiveFileId,
        requester: &RequesterIdentity,
    ) -> Result<RetrieveQueueCriteria, SchedulerError> {
        let file = self
            .files()
            .get(&archive_file_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("archive file {archive_file_id}")))?;
        let sc = self.storage_class(&file.storage_class)?;
        Ok(RetrieveQueueCriteria {
            archive_file_id,
            file_size: file.file_size,
            tape_files: file.tape_files,
            mount_policy: self.policy_for(requester, sc)?,
        })
    }

    async fn tapes_for_writing(&self, logical_library: &str) -> Result<Vec<TapeForWriting>, SchedulerError> {
        Ok(self
            .tapes()
            .values()
            .filter(|t| t.info.logical_library == logical_library && !t.info.disabled && !t.full)
            .map(|t| TapeForWriting {
                vid: t.info.vid.clone(),
                tape_pool: t.info.tape_pool.clone(),
                logical_library: t.info.logical_library.clone(),
                last_fseq: t.last_fseq,
            })
            .collect())
    }

    async fn tape(&self, vid: &str) -> Result<Option<TapeInfo>, SchedulerError> {
        Ok(self.tapes().get(vid).map(|t| t.info.clone()))
    }

    async fn logical_library(&self, name: &str) -> Result<Option<LogicalLibrary>, SchedulerError> {
        Ok(self.libraries.get(name).cloned())
    }

    async fn is_admin(&self, identity: &RequesterIdentity) -> Result<bool, SchedulerError> {
        Ok(self.admins.contains(&identity.name))
    }
}
