//! Errors - エラー型と分類
//!
//! `ErrorKind` tells the caller what to do with a failure; the variants of
//! `SchedulerError` tell it what happened.

use thiserror::Error;

use super::drive::DriveStatus;
use super::ids::{ArchiveFileId, MountId};

/// Operational classification of a [`SchedulerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with backoff (catalogue or store hiccup).
    Transient,
    /// Surfaced to the caller, never retried automatically.
    Permanent,
    /// Lock-discipline violation. Must be logged loudly and not retried.
    Fatal,
    /// Not an error: no mount this pass, poll again later.
    NothingToDo,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no tape pool route for {0}")]
    InvalidRouting(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("requester {requester} may not modify {what}")]
    PermissionDenied { requester: String, what: String },

    #[error("rejecting archive request for zero-length file: {0}")]
    ZeroLengthFile(String),

    #[error("mount quota reached for tape pool {tape_pool}")]
    QuotaExceeded { tape_pool: String },

    #[error("mount policy thresholds not met for tape pool {tape_pool}")]
    PolicyNotMet { tape_pool: String },

    #[error("concurrent mount conflict: {0}")]
    ConcurrentMountConflict(String),

    #[error("the global scheduling lock is not held by this mount decision")]
    SchedulingLockNotHeld,

    #[error("{0} is already complete")]
    MountCompleted(MountId),

    #[error("drive {drive}: invalid transition {from:?} -> {to:?}")]
    InvalidDriveTransition {
        drive: String,
        from: DriveStatus,
        to: DriveStatus,
    },

    #[error("unknown drive {0}")]
    UnknownDrive(String),

    #[error("drive {drive} is {status:?} (desired up: {desired_up}) and cannot take a mount")]
    DriveUnavailable {
        drive: String,
        status: DriveStatus,
        desired_up: bool,
    },

    #[error("{0} is bound to a mount and can no longer be cancelled")]
    RequestInFlight(String),

    #[error("archive file {0} already has a queued request")]
    DuplicateArchiveFile(ArchiveFileId),

    #[error("catalogue error: {0}")]
    Catalogue(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::QuotaExceeded { .. } | SchedulerError::PolicyNotMet { .. } => {
                ErrorKind::NothingToDo
            }
            SchedulerError::ConcurrentMountConflict(_) => ErrorKind::Fatal,
            SchedulerError::Catalogue(_) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
