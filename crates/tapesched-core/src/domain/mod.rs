//! Domain model (IDs, requests, policies, candidates, drives, jobs).
//!
//! このモジュールは永続化や通信を前提としません。値と状態遷移のみを定義します。

pub mod drive;
pub mod errors;
pub mod ids;
pub mod job;
pub mod mount;
pub mod mount_policy;
pub mod potential_mount;
pub mod request;

pub use drive::{DesiredDriveState, DriveInfo, DriveState, DriveStatus};
pub use errors::{ErrorKind, SchedulerError};
pub use ids::{AgentId, ArchiveFileId, MountId, RequestId};
pub use job::{JobKey, JobKind};
pub use mount::{MountInfo, MountKind, MountRequest, MountStats};
pub use mount_policy::MountPolicy;
pub use potential_mount::{DedicationEntry, ExistingMount, PotentialMount, TieBreakPolicy};
pub use request::{
    ArchiveJobEntry, ArchiveQueueCriteria, Authority, ArchiveRequest, JobStatus, RemotePathAndStatus,
    RequesterIdentity, RetrieveJobEntry, RetrieveQueueCriteria, RetrieveRequest, TapeFile,
};
