//! Simulated tape transfers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tapesched_core::app::{TransferError, TransferHandler};
use tapesched_core::domain::{ArchiveFileId, JobKind, MountInfo};
use tapesched_core::impls::InMemoryCatalogue;
use tracing::info;

/// Writes archives into the in-memory catalogue so that they can be
/// retrieved afterwards. Retrieves only check that the copy is on the
/// mounted tape.
pub struct SimulatedTransfer {
    catalogue: Arc<InMemoryCatalogue>,
    storage_classes: Mutex<HashMap<ArchiveFileId, String>>,
    /// Per-file transfer time.
    delay: Duration,
}

impl SimulatedTransfer {
    pub fn new(catalogue: Arc<InMemoryCatalogue>, delay: Duration) -> Self {
        Self {
            catalogue,
            storage_classes: Mutex::new(HashMap::new()),
            delay,
        }
    }

    pub fn expect_archive(&self, archive_file_id: ArchiveFileId, storage_class: &str) {
        self.storage_classes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(archive_file_id, storage_class.to_string());
    }
}

#[async_trait]
impl TransferHandler for SimulatedTransfer {
    async fn transfer(&self, mount: &MountInfo, job: &JobKind) -> Result<(), TransferError> {
        tokio::time::sleep(self.delay).await;
        match job {
            JobKind::Archive {
                archive_file_id,
                copy_nb,
                file_size,
                ..
            } => {
                let storage_class = self
                    .storage_classes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(archive_file_id)
                    .cloned()
                    .ok_or_else(|| TransferError(format!("no storage class for file {archive_file_id}")))?;
                let fseq = self
                    .catalogue
                    .record_tape_file(*archive_file_id, &storage_class, *file_size, *copy_nb, &mount.vid)
                    .map_err(|e| TransferError(e.to_string()))?;
                info!(archive_file_id, copy_nb, vid = %mount.vid, fseq, "file written");
                Ok(())
            }
            JobKind::Retrieve {
                archive_file_id,
                tape_file,
                dst_url,
                ..
            } => {
                if tape_file.vid != mount.vid {
                    return Err(TransferError(format!(
                        "file {archive_file_id} is on {} but {} is mounted",
                        tape_file.vid, mount.vid
                    )));
                }
                info!(archive_file_id, vid = %mount.vid, fseq = tape_file.fseq, %dst_url, "file read");
                Ok(())
            }
        }
    }
}
