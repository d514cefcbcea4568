mod fleet;
mod trace;
mod transfer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tapesched_core::app::{DriveSessionGroup, Scheduler};
use tapesched_core::config::SchedulerConfig;
use tapesched_core::domain::{
    ArchiveFileId, ArchiveRequest, DesiredDriveState, RemotePathAndStatus, RequesterIdentity,
    RetrieveRequest,
};
use tapesched_core::impls::{InMemoryDriveRegistry, InMemoryQueueStore};
use tapesched_core::ports::{Clock, SystemClock, UlidGenerator};
use tracing::{info, warn};

use crate::fleet::Fleet;
use crate::transfer::SimulatedTransfer;

#[derive(Debug, Parser)]
#[command(name = "tapesched", about = "Tape mount scheduler playground")]
struct Cli {
    /// Scheduler settings and fleet fixture (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Archive files, read them back, then print the final status.
    Demo {
        #[arg(long, default_value_t = 8)]
        files: u32,
        /// Simulated time per file.
        #[arg(long, default_value_t = 20)]
        transfer_ms: u64,
        /// Give up on a phase after this long.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Queue archives without running any drive and print the queues.
    Status {
        #[arg(long, default_value_t = 8)]
        files: u32,
    },
}

impl Default for Command {
    fn default() -> Self {
        Command::Demo {
            files: 8,
            transfer_ms: 20,
            timeout_secs: 60,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SchedulerConfig::load(cli.config.as_deref())?;
    trace::init(config.log_format)?;
    let fleet = Fleet::load(cli.config.as_deref())?;

    // (A) カタログ・ドライブ・キューを用意
    let catalogue = Arc::new(fleet.catalogue()?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let drives = Arc::new(InMemoryDriveRegistry::new());
    let store = Arc::new(InMemoryQueueStore::new(
        drives.clone(),
        clock.clone(),
        Arc::new(UlidGenerator::new(clock.clone())),
        config.max_total_retries,
    ));
    let scheduler = Arc::new(Scheduler::new(
        store,
        catalogue.clone(),
        drives,
        clock,
        &config,
    ));

    // (B) ドライブを登録して Up にする
    let drive_infos = fleet.drive_infos();
    for drive in &drive_infos {
        scheduler.register_drive(drive.clone()).await?;
        scheduler
            .set_desired_drive_state(&drive.name, DesiredDriveState::up())
            .await?;
    }

    match cli.command.unwrap_or_default() {
        Command::Status { files } => {
            let transfer = SimulatedTransfer::new(catalogue, Duration::ZERO);
            queue_archives(&scheduler, &fleet, &transfer, files).await?;
        }
        Command::Demo {
            files,
            transfer_ms,
            timeout_secs,
        } => {
            let transfer = Arc::new(SimulatedTransfer::new(
                catalogue,
                Duration::from_millis(transfer_ms),
            ));
            let timeout = Duration::from_secs(timeout_secs);
            let archived = queue_archives(&scheduler, &fleet, &transfer, files).await?;

            // (C) ドライブセッションを起動
            let sessions = DriveSessionGroup::spawn(
                scheduler.clone(),
                drive_infos,
                transfer.clone(),
                config.poll_interval(),
            );

            if wait_until_idle(&scheduler, timeout).await? {
                queue_retrieves(&scheduler, &archived).await?;
                wait_until_idle(&scheduler, timeout).await?;
            }

            // (D) 停止
            sessions.shutdown_and_join().await;
        }
    }

    let status = scheduler.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn requester() -> RequesterIdentity {
    RequesterIdentity::new("demo", "users")
}

async fn queue_archives(
    scheduler: &Scheduler,
    fleet: &Fleet,
    transfer: &SimulatedTransfer,
    files: u32,
) -> anyhow::Result<Vec<ArchiveFileId>> {
    let mut archived = Vec::with_capacity(files as usize);
    for i in 0..files as usize {
        let storage_class = &fleet
            .storage_classes
            .get(i % fleet.storage_classes.len().max(1))
            .context("fleet has no storage class")?
            .name;
        let path = format!("/eos/demo/file{i:04}");
        let archive_file_id = scheduler
            .queue_archive(ArchiveRequest {
                disk_instance: "eosdemo".into(),
                storage_class: storage_class.clone(),
                requester: requester(),
                src_url: format!("root://eosdemo/{path}"),
                remote_file: RemotePathAndStatus::new(path),
                file_size: 1 << 20,
                created_at: scheduler.now(),
            })
            .await?;
        transfer.expect_archive(archive_file_id, storage_class);
        archived.push(archive_file_id);
    }
    info!(files, "archives queued");
    Ok(archived)
}

async fn queue_retrieves(scheduler: &Scheduler, archived: &[ArchiveFileId]) -> anyhow::Result<()> {
    for &archive_file_id in archived {
        let path = format!("/eos/demo/restored/{archive_file_id}");
        scheduler
            .queue_retrieve(RetrieveRequest {
                disk_instance: "eosdemo".into(),
                archive_file_id,
                requester: requester(),
                dst_url: format!("root://eosdemo/{path}"),
                remote_file: RemotePathAndStatus::new(path),
                vid: None,
                created_at: scheduler.now(),
            })
            .await?;
    }
    info!(files = archived.len(), "retrieves queued");
    Ok(())
}

/// Waits until no job is queued and no drive is mounted. Returns `false`
/// on timeout or Ctrl-C.
async fn wait_until_idle(scheduler: &Scheduler, timeout: Duration) -> anyhow::Result<bool> {
    let poll = async {
        loop {
            let status = scheduler.status().await?;
            let idle = status
                .queues
                .iter()
                .all(|q| q.files_queued == 0 && q.current_mounts == 0 && q.next_mounts == 0);
            if idle {
                return anyhow::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::select! {
        res = tokio::time::timeout(timeout, poll) => match res {
            Ok(res) => res.map(|()| true),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "queues still busy, stopping");
                Ok(false)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(false)
        }
    }
}
