//! Drive state machine.
//!
//! Session-driven transitions:
//! - Down -> Up
//! - Up -> Starting -> Mounting -> Transferring -> Unloading -> Unmounting
//! - Unmounting -> Up | DrainingToDisk | CleaningUp
//! - DrainingToDisk -> Up, CleaningUp -> Up
//! - Starting -> Up (reservation abandoned), Mounting -> Unloading (mount failed)
//!
//! Operators can force `Up` or `Down` from any state through
//! [`DriveState::apply_desired_state`]. `Starting` is the reservation taken
//! under the scheduling lock, so that the next decision already counts the
//! drive as busy before the tape is physically mounted.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::SchedulerError;
use super::ids::MountId;
use super::mount::{MountInfo, MountKind};
use super::potential_mount::{DedicationEntry, ExistingMount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriveStatus {
    Down,
    Up,
    Starting,
    Mounting,
    Transferring,
    Unloading,
    Unmounting,
    DrainingToDisk,
    CleaningUp,
}

impl DriveStatus {
    /// Is `next` a legal session-driven successor of `self`?
    pub fn can_transition_to(self, next: DriveStatus) -> bool {
        use DriveStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Down, Up)
                | (Up, Starting)
                | (Starting, Mounting)
                | (Starting, Up)
                | (Mounting, Transferring)
                | (Mounting, Unloading)
                | (Transferring, Unloading)
                | (Unloading, Unmounting)
                | (Unmounting, Up)
                | (Unmounting, DrainingToDisk)
                | (Unmounting, CleaningUp)
                | (DrainingToDisk, Up)
                | (CleaningUp, Up)
        )
    }

    /// Does a drive in this status hold (or reserve) a tape?
    pub fn is_in_session(self) -> bool {
        !matches!(self, DriveStatus::Down | DriveStatus::Up)
    }
}

/// Operator intent for a drive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredDriveState {
    pub up: bool,
    /// Go down immediately instead of at the end of the current session.
    pub force_down: bool,
    pub reason: Option<String>,
}

impl DesiredDriveState {
    pub fn up() -> Self {
        Self {
            up: true,
            force_down: false,
            reason: None,
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            up: false,
            force_down: false,
            reason: Some(reason.into()),
        }
    }

    pub fn force_down(reason: impl Into<String>) -> Self {
        Self {
            up: false,
            force_down: true,
            reason: Some(reason.into()),
        }
    }
}

/// Static description of a drive, reported by its owning process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub name: String,
    pub logical_library: String,
    pub host: String,
    #[serde(default)]
    pub dedication: DedicationEntry,
}

/// Last known state of a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveState {
    pub name: String,
    pub logical_library: String,
    pub host: String,
    pub session_id: Option<MountId>,
    pub status: DriveStatus,
    pub desired: DesiredDriveState,
    pub current_vid: Option<String>,
    pub current_tape_pool: Option<String>,
    pub current_mount_kind: Option<MountKind>,
    pub dedication: DedicationEntry,
    /// When each phase was last entered.
    pub phase_started_at: BTreeMap<DriveStatus, DateTime<Utc>>,
    pub last_update_time: DateTime<Utc>,
}

impl DriveState {
    /// A freshly registered drive is down until an operator sets it up.
    pub fn new(info: DriveInfo, now: DateTime<Utc>) -> Self {
        let mut phase_started_at = BTreeMap::new();
        phase_started_at.insert(DriveStatus::Down, now);
        Self {
            name: info.name,
            logical_library: info.logical_library,
            host: info.host,
            session_id: None,
            status: DriveStatus::Down,
            desired: DesiredDriveState::default(),
            current_vid: None,
            current_tape_pool: None,
            current_mount_kind: None,
            dedication: info.dedication,
            phase_started_at,
            last_update_time: now,
        }
    }

    /// Can the scheduler hand this drive a new mount?
    pub fn is_schedulable(&self) -> bool {
        self.status == DriveStatus::Up && self.desired.up
    }

    pub fn existing_mount(&self) -> Option<ExistingMount> {
        if !self.status.is_in_session() {
            return None;
        }
        let (Some(kind), Some(tape_pool)) = (self.current_mount_kind, &self.current_tape_pool)
        else {
            return None;
        };
        Some(ExistingMount {
            drive_name: self.name.clone(),
            kind,
            tape_pool: tape_pool.clone(),
            vid: self.current_vid.clone().unwrap_or_default(),
            current_mount: self.status != DriveStatus::Starting,
        })
    }

    /// Time spent in the current status, for external stall detection.
    pub fn time_in_status(&self, now: DateTime<Utc>) -> Duration {
        self.phase_started_at
            .get(&self.status)
            .map(|since| now - *since)
            .unwrap_or_else(Duration::zero)
    }

    /// Session-driven transition.
    pub fn transition(&mut self, next: DriveStatus, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidDriveTransition {
                drive: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.enter(next, now);
        Ok(())
    }

    /// Reserves an idle drive for a mount (Up -> Starting).
    ///
    /// A drive already in a session is a double mount. A drive that is down,
    /// or that an operator wants down, is merely unavailable.
    pub fn reserve(&mut self, mount: &MountInfo, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.status.is_in_session() {
            return Err(SchedulerError::ConcurrentMountConflict(format!(
                "drive {} is {:?} with {} and cannot take {}",
                self.name,
                self.status,
                self.session_id.map(|id| id.to_string()).unwrap_or_default(),
                mount.mount_id
            )));
        }
        if !self.is_schedulable() {
            return Err(SchedulerError::DriveUnavailable {
                drive: self.name.clone(),
                status: self.status,
                desired_up: self.desired.up,
            });
        }
        self.enter(DriveStatus::Starting, now);
        self.session_id = Some(mount.mount_id);
        self.current_vid = Some(mount.vid.clone());
        self.current_tape_pool = Some(mount.tape_pool.clone());
        self.current_mount_kind = Some(mount.kind);
        Ok(())
    }

    /// Ends the current session: back to `Up`, or `Down` if an operator
    /// asked for it meanwhile.
    pub fn end_session(&mut self, now: DateTime<Utc>) {
        let next = if self.desired.up {
            DriveStatus::Up
        } else {
            DriveStatus::Down
        };
        self.enter(next, now);
    }

    /// Operator override.
    pub fn apply_desired_state(&mut self, desired: DesiredDriveState, now: DateTime<Utc>) {
        let in_session = self.status.is_in_session();
        if desired.up && self.status == DriveStatus::Down {
            self.enter(DriveStatus::Up, now);
        } else if !desired.up && (desired.force_down || !in_session) {
            self.enter(DriveStatus::Down, now);
        }
        self.desired = desired;
        self.last_update_time = now;
    }

    fn enter(&mut self, next: DriveStatus, now: DateTime<Utc>) {
        if next != self.status {
            self.phase_started_at.insert(next, now);
        }
        self.status = next;
        self.last_update_time = now;
        if !next.is_in_session() {
            self.session_id = None;
            self.current_vid = None;
            self.current_tape_pool = None;
            self.current_mount_kind = None;
        }
    }
}
