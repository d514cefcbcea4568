//! InMemoryDriveRegistry - 開発用のドライブ登録簿
//!
//! # 実装詳細
//! - BTreeMap<String, DriveState> で drive 名順に管理（一覧が安定する）
//! - Mutex で排他制御、await を跨いで保持しない

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{
    DesiredDriveState, DriveInfo, DriveState, DriveStatus, MountInfo, SchedulerError,
};
use crate::ports::DriveRegistry;

#[derive(Debug, Default)]
pub struct InMemoryDriveRegistry {
    drives: Mutex<BTreeMap<String, DriveState>>,
}

impl InMemoryDriveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn drives(&self) -> MutexGuard<'_, BTreeMap<String, DriveState>> {
        self.drives.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut DriveState) -> Result<R, SchedulerError>,
    ) -> Result<R, SchedulerError> {
        let mut drives = self.drives();
        let drive = drives
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownDrive(name.to_string()))?;
        f(drive)
    }
}

#[async_trait]
impl DriveRegistry for InMemoryDriveRegistry {
    async fn register_drive(
        &self,
        info: DriveInfo,
        now: DateTime<Utc>,
    ) -> Result<DriveState, SchedulerError> {
        let mut drives = self.drives();
        let drive = drives.entry(info.name.clone()).or_insert_with(|| {
            info!(drive = %info.name, library = %info.logical_library, "registered drive");
            DriveState::new(info.clone(), now)
        });
        // Re-registration refreshes placement, never the session state.
        drive.logical_library = info.logical_library;
        drive.host = info.host;
        drive.dedication = info.dedication;
        Ok(drive.clone())
    }

    async fn remove_drive(&self, name: &str) -> Result<(), SchedulerError> {
        self.drives()
            .remove(name)
            .map(|_| info!(drive = %name, "removed drive"))
            .ok_or_else(|| SchedulerError::UnknownDrive(name.to_string()))
    }

    async fn drive_state(&self, name: &str) -> Result<DriveState, SchedulerError> {
        self.update(name, |drive| Ok(drive.clone()))
    }

    async fn drive_states(&self) -> Result<Vec<DriveState>, SchedulerError> {
        Ok(self.drives().values().cloned().collect())
    }

    async fn report_drive_status(
        &self,
        name: &str,
        status: DriveStatus,
        now: DateTime<Utc>,
    ) -> Result<DriveState, SchedulerError> {
        self.update(name, |drive| {
            let from = drive.status;
            drive.transition(status, now)?;
            debug!(drive = %name, ?from, to = ?status, "drive status reported");
            Ok(drive.clone())
        })
    }

    async fn set_desired_drive_state(
        &self,
        name: &str,
        desired: DesiredDriveState,
        now: DateTime<Utc>,
    ) -> Result<DriveState, SchedulerError> {
        self.update(name, |drive| {
            info!(
                drive = %name,
                up = desired.up,
                force = desired.force_down,
                reason = desired.reason.as_deref().unwrap_or(""),
                "desired drive state changed"
            );
            drive.apply_desired_state(desired, now);
            Ok(drive.clone())
        })
    }

    async fn reserve_for_mount(
        &self,
        mount: &MountInfo,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.update(&mount.drive_name, |drive| drive.reserve(mount, now))
    }

    async fn end_session(&self, name: &str, now: DateTime<Utc>) -> Result<DriveState, SchedulerError> {
        self.update(name, |drive| {
            drive.end_session(now);
            debug!(drive = %name, status = ?drive.status, "drive session ended");
            Ok(drive.clone())
        })
    }
}
