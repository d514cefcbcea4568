//! DriveRegistry port - ドライブ状態の正本
//!
//! Written by drive-owning sessions and operators, read by the scheduler to
//! count existing mounts and to keep a drive out of candidacy while it is
//! not `Up`. All mutation goes through these operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DesiredDriveState, DriveInfo, DriveState, DriveStatus, MountInfo, SchedulerError};

#[async_trait]
pub trait DriveRegistry: Send + Sync {
    /// Registers a drive (idempotent: an existing entry keeps its state but
    /// picks up the new library, host and dedication).
    async fn register_drive(&self, info: DriveInfo, now: DateTime<Utc>) -> Result<DriveState, SchedulerError>;

    async fn remove_drive(&self, name: &str) -> Result<(), SchedulerError>;

    async fn drive_state(&self, name: &str) -> Result<DriveState, SchedulerError>;

    /// All drives, sorted by name.
    async fn drive_states(&self) -> Result<Vec<DriveState>, SchedulerError>;

    /// Session-driven status change.
    async fn report_drive_status(
        &self,
        name: &str,
        status: DriveStatus,
        now: DateTime<Utc>,
    ) -> Result<DriveState, SchedulerError>;

    /// Operator override.
    async fn set_desired_drive_state(
        &self,
        name: &str,
        desired: DesiredDriveState,
        now: DateTime<Utc>,
    ) -> Result<DriveState, SchedulerError>;

    /// Up -> Starting for a newly created mount. Only called while the
    /// global scheduling lock is held.
    async fn reserve_for_mount(&self, mount: &MountInfo, now: DateTime<Utc>) -> Result<(), SchedulerError>;

    /// Session over: back to Up (or Down if requested meanwhile).
    async fn end_session(&self, name: &str, now: DateTime<Utc>) -> Result<DriveState, SchedulerError>;
}
