//! Drive sessions - ドライブごとのマウント実行ループ
//!
//! One tokio task per drive: ask the scheduler for a mount, drain it job by
//! job through a [`TransferHandler`], complete it, repeat. With nothing to
//! mount the task sleeps `poll_interval`.
//!
//! Shutdown (`watch` channel) stops the loop between jobs. The current job
//! is reported and the mount completed before the task exits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::scheduler::Scheduler;
use crate::domain::{DriveInfo, DriveStatus, JobKind, MountInfo};
use crate::ports::TapeMount;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransferError(pub String);

/// Moves one file between disk and tape.
#[async_trait]
pub trait TransferHandler: Send + Sync {
    async fn transfer(&self, mount: &MountInfo, job: &JobKind) -> Result<(), TransferError>;
}

/// Drive session group handle.
/// - `request_shutdown` で全セッションが次のジョブ境界で止まる
/// - `shutdown_and_join()` で全セッションの終了を待てる
pub struct DriveSessionGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl DriveSessionGroup {
    pub fn spawn(
        scheduler: Arc<Scheduler>,
        drives: Vec<DriveInfo>,
        handler: Arc<dyn TransferHandler>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = drives
            .into_iter()
            .map(|drive| {
                let scheduler = Arc::clone(&scheduler);
                let handler = Arc::clone(&handler);
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    drive_session(drive, scheduler, handler, poll_interval, &mut rx).await;
                })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "drive session task panicked");
            }
        }
    }
}

async fn drive_session(
    drive: DriveInfo,
    scheduler: Arc<Scheduler>,
    handler: Arc<dyn TransferHandler>,
    poll_interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    info!(drive = %drive.name, library = %drive.logical_library, "drive session started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Not raced against shutdown: a mount created and then dropped here
        // would leave its drive reserved.
        match scheduler
            .get_next_mount(&drive.logical_library, &drive.name)
            .await
        {
            Ok(Some(mount)) => {
                run_mount(mount.as_ref(), &scheduler, handler.as_ref(), shutdown_rx).await;
                continue;
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                error!(drive = %drive.name, error = %e, "stopping drive session");
                break;
            }
            Err(e) => {
                warn!(drive = %drive.name, error = %e, "scheduling pass failed");
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    info!(drive = %drive.name, "drive session stopped");
}

async fn set_status(mount: &dyn TapeMount, status: DriveStatus) {
    if let Err(e) = mount.set_drive_status(status).await {
        warn!(drive = %mount.info().drive_name, ?status, error = %e, "drive status report failed");
    }
}

async fn run_mount(
    mount: &dyn TapeMount,
    scheduler: &Scheduler,
    handler: &dyn TransferHandler,
    shutdown_rx: &watch::Receiver<bool>,
) {
    let info = mount.info();
    set_status(mount, DriveStatus::Mounting).await;
    set_status(mount, DriveStatus::Transferring).await;

    while !*shutdown_rx.borrow() {
        let job = match mount.next_job().await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                warn!(mount_id = %info.mount_id, error = %e, "next_job failed");
                break;
            }
        };
        let reported = match handler.transfer(info, job.kind()).await {
            Ok(()) => job.succeed().await,
            Err(e) => {
                debug!(mount_id = %info.mount_id, error = %e, "transfer failed");
                job.fail(e.to_string()).await
            }
        };
        if let Err(e) = reported {
            warn!(mount_id = %info.mount_id, error = %e, "job report failed");
        }
    }

    set_status(mount, DriveStatus::Unloading).await;
    set_status(mount, DriveStatus::Unmounting).await;
    if let Err(e) = mount.complete(scheduler.now()).await {
        error!(mount_id = %info.mount_id, error = %e, "mount completion failed");
    }
}
