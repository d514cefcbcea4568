//! End-to-end scheduling scenarios over the in-memory backends.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tapesched_core::app::Scheduler;
use tapesched_core::config::SchedulerConfig;
use tapesched_core::domain::{
    ArchiveRequest, DedicationEntry, DesiredDriveState, DriveInfo, DriveStatus, JobKind,
    MountKind, MountPolicy, MountRequest, RemotePathAndStatus, RequesterIdentity, RetrieveRequest,
    SchedulerError,
};
use tapesched_core::impls::{InMemoryCatalogue, InMemoryDriveRegistry, InMemoryQueueStore};
use tapesched_core::ports::{ManualClock, QueueStore, UlidGenerator};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap()
}

fn policy(name: &str, priority: u64) -> MountPolicy {
    MountPolicy {
        name: name.into(),
        archive_priority: priority,
        retrieve_priority: priority,
        max_files_queued: 1,
        max_bytes_queued: 1 << 40,
        max_request_age: Duration::from_secs(3600),
        max_drives_allowed: 2,
    }
}

struct Site {
    scheduler: Arc<Scheduler>,
    store: Arc<InMemoryQueueStore>,
    catalogue: Arc<InMemoryCatalogue>,
    clock: Arc<ManualClock>,
}

/// Pools `pool_a`, `pool_b` and `pool_c` with archive priorities 10, 50 and
/// 10, plus `pool_lazy` which only mounts on age. Three drives, all in `LIB1`.
async fn site() -> Site {
    let clock = Arc::new(ManualClock::new(t0()));
    let catalogue = Arc::new(
        InMemoryCatalogue::builder()
            .logical_library("LIB1")
            .mount_policy(policy("low", 10))
            .mount_policy(policy("high", 50))
            .mount_policy(MountPolicy {
                max_files_queued: 100,
                max_request_age: Duration::from_secs(600),
                ..policy("lazy", 1)
            })
            .storage_class("class_a", [(1, "pool_a")], "low")
            .storage_class("class_b", [(1, "pool_b")], "high")
            .storage_class("class_c", [(1, "pool_c")], "low")
            .storage_class("class_lazy", [(1, "pool_lazy")], "lazy")
            .tape("A00001", "pool_a", "LIB1")
            .tape("A00002", "pool_a", "LIB1")
            .tape("B00001", "pool_b", "LIB1")
            .tape("B00002", "pool_b", "LIB1")
            .tape("C00001", "pool_c", "LIB1")
            .tape("C00002", "pool_c", "LIB1")
            .tape("L00001", "pool_lazy", "LIB1")
            .admin("ops")
            .build()
            .unwrap(),
    );
    let drives = Arc::new(InMemoryDriveRegistry::new());
    let store = Arc::new(InMemoryQueueStore::new(
        drives.clone(),
        clock.clone(),
        Arc::new(UlidGenerator::new(clock.clone())),
        3,
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        catalogue.clone(),
        drives,
        clock.clone(),
        &SchedulerConfig::default(),
    ));
    for name in ["D1", "D2", "D3"] {
        scheduler
            .register_drive(DriveInfo {
                name: name.into(),
                logical_library: "LIB1".into(),
                host: "tpsrv01".into(),
                dedication: DedicationEntry::default(),
            })
            .await
            .unwrap();
        scheduler
            .set_desired_drive_state(name, DesiredDriveState::up())
            .await
            .unwrap();
    }
    Site {
        scheduler,
        store,
        catalogue,
        clock,
    }
}

fn alice() -> RequesterIdentity {
    RequesterIdentity::new("alice", "atlas")
}

fn archive(storage_class: &str, name: &str, created_at: DateTime<Utc>) -> ArchiveRequest {
    ArchiveRequest {
        disk_instance: "eos".into(),
        storage_class: storage_class.into(),
        requester: alice(),
        src_url: format!("root://eos/{name}"),
        remote_file: RemotePathAndStatus::new(format!("/eos/{name}")),
        file_size: 100,
        created_at,
    }
}

fn mount_request(vid: &str, pool: &str, drive: &str) -> MountRequest {
    MountRequest {
        vid: vid.into(),
        tape_pool: pool.into(),
        drive_name: drive.into(),
        logical_library: "LIB1".into(),
        host_name: "tpsrv01".into(),
        start_time: t0(),
    }
}

#[tokio::test]
async fn highest_priority_pool_is_mounted_first() {
    let site = site().await;
    for class in ["class_a", "class_b", "class_c"] {
        site.scheduler
            .queue_archive(archive(class, class, t0()))
            .await
            .unwrap();
    }

    let mut pools = Vec::new();
    for drive in ["D1", "D2", "D3"] {
        let mount = site
            .scheduler
            .get_next_mount("LIB1", drive)
            .await
            .unwrap()
            .unwrap();
        pools.push(mount.info().tape_pool.clone());
    }
    assert_eq!(pools, vec!["pool_b", "pool_a", "pool_c"]);
}

#[tokio::test]
async fn second_decision_waits_for_the_first() {
    let site = site().await;
    site.scheduler
        .queue_archive(archive("class_a", "f", t0()))
        .await
        .unwrap();

    let mut held = site.store.get_mount_info().await.unwrap();
    let scheduler = site.scheduler.clone();
    let waiting = tokio::spawn(async move { scheduler.get_next_mount("LIB1", "D1").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    held.release();
    let mount = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(mount.is_some());
}

#[tokio::test]
async fn a_decision_creates_at_most_one_mount() {
    let site = site().await;
    site.scheduler
        .queue_archive(archive("class_a", "f1", t0()))
        .await
        .unwrap();
    site.scheduler
        .queue_archive(archive("class_b", "f2", t0()))
        .await
        .unwrap();

    let mut decision = site.store.get_mount_info().await.unwrap();
    decision
        .create_archive_mount(mount_request("A00001", "pool_a", "D1"))
        .await
        .unwrap();
    assert!(!decision.holds_lock());

    let err = decision
        .create_archive_mount(mount_request("B00001", "pool_b", "D2"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::SchedulingLockNotHeld));
}

#[tokio::test]
async fn queue_then_cancel_leaves_nothing_behind() {
    let site = site().await;
    let before = site.scheduler.status().await.unwrap();

    let id = site
        .scheduler
        .queue_archive(archive("class_a", "f", t0()))
        .await
        .unwrap();
    site.scheduler.delete_archive(&alice(), id).await.unwrap();

    let after = site.scheduler.status().await.unwrap();
    assert_eq!(after.queues, before.queues);
    assert!(site.scheduler.get_pending_archive_jobs().await.unwrap().is_empty());
    assert_eq!(after.pending_cancellations, 0);
    assert!(site.scheduler.get_next_mount("LIB1", "D1").await.unwrap().is_none());
}

#[tokio::test]
async fn jobs_follow_request_creation_time() {
    let site = site().await;
    let t1 = t0();
    let t2 = t1 + chrono::Duration::seconds(1);
    let t3 = t2 + chrono::Duration::seconds(1);
    // queued out of order
    for (name, at) in [("third", t3), ("first", t1), ("second", t2)] {
        site.scheduler
            .queue_archive(archive("class_a", name, at))
            .await
            .unwrap();
    }

    let mount = site
        .scheduler
        .get_next_mount("LIB1", "D1")
        .await
        .unwrap()
        .unwrap();
    let mut served = Vec::new();
    while let Some(job) = mount.next_job().await.unwrap() {
        served.push(job.kind().remote_file().path.clone());
        job.succeed().await.unwrap();
    }
    assert_eq!(served, vec!["/eos/first", "/eos/second", "/eos/third"]);
}

#[tokio::test]
async fn abandoned_deletion_is_put_back_by_the_sweep() {
    let site = site().await;
    let id = site
        .scheduler
        .queue_archive(archive("class_a", "f", t0()))
        .await
        .unwrap();

    let cancellation = site.scheduler.begin_archive_deletion(&alice(), id).await.unwrap();
    let owner = cancellation.owner();
    drop(cancellation);

    assert!(site.scheduler.get_pending_archive_jobs().await.unwrap().is_empty());
    let pending = site.store.pending_cancellations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].owner, owner);

    // Owner still alive: nothing to do.
    let live = BTreeSet::from([owner]);
    assert_eq!(site.scheduler.revert_orphaned_cancellations(&live).await.unwrap(), 0);

    assert_eq!(
        site.scheduler
            .revert_orphaned_cancellations(&BTreeSet::new())
            .await
            .unwrap(),
        1
    );
    let queued = site
        .scheduler
        .get_pending_archive_jobs_for_pool("pool_a")
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].archive_file_id, id);
}

#[tokio::test]
async fn old_requests_are_mounted_once_they_age() {
    let site = site().await;
    site.scheduler
        .queue_archive(archive("class_lazy", "f", t0()))
        .await
        .unwrap();

    assert!(site.scheduler.get_next_mount("LIB1", "D1").await.unwrap().is_none());
    site.clock.advance(chrono::Duration::minutes(11));
    let mount = site
        .scheduler
        .get_next_mount("LIB1", "D1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mount.info().tape_pool, "pool_lazy");
}

#[tokio::test]
async fn archive_then_retrieve_round_trip() {
    let site = site().await;
    let id = site
        .scheduler
        .queue_archive(archive("class_a", "data", t0()))
        .await
        .unwrap();

    // Archive on D1.
    let mount = site
        .scheduler
        .get_next_mount("LIB1", "D1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mount.kind(), MountKind::Archive);
    let vid = mount.info().vid.clone();
    mount.set_drive_status(DriveStatus::Mounting).await.unwrap();
    mount.set_drive_status(DriveStatus::Transferring).await.unwrap();
    let job = mount.next_job().await.unwrap().unwrap();
    let JobKind::Archive { copy_nb, file_size, .. } = job.kind().clone() else {
        panic!("expected an archive job");
    };
    site.catalogue
        .record_tape_file(id, "class_a", file_size, copy_nb, &vid)
        .unwrap();
    job.succeed().await.unwrap();
    assert!(mount.next_job().await.unwrap().is_none());
    let stats = mount.complete(site.scheduler.now()).await.unwrap();
    assert_eq!(stats.files_transferred, 1);
    assert_eq!(stats.nb_files_currently_on_tape, 1);
    assert!(matches!(
        mount.next_job().await.unwrap_err(),
        SchedulerError::MountCompleted(_)
    ));

    // Read it back on D2.
    site.scheduler
        .queue_retrieve(RetrieveRequest {
            disk_instance: "eos".into(),
            archive_file_id: id,
            requester: alice(),
            dst_url: "root://eos/restored".into(),
            remote_file: RemotePathAndStatus::new("/eos/restored"),
            vid: None,
            created_at: t0(),
        })
        .await
        .unwrap();
    let mount = site
        .scheduler
        .get_next_mount("LIB1", "D2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mount.kind(), MountKind::Retrieve);
    assert_eq!(mount.info().vid, vid);
    assert_eq!(mount.info().tape_pool, "pool_a");
    let job = mount.next_job().await.unwrap().unwrap();
    let JobKind::Retrieve { tape_file, .. } = job.kind() else {
        panic!("expected a retrieve job");
    };
    assert_eq!((tape_file.vid.as_str(), tape_file.fseq), (vid.as_str(), 1));
    job.succeed().await.unwrap();
    mount.complete(site.scheduler.now()).await.unwrap();

    let status = site.scheduler.status().await.unwrap();
    assert!(status.queues.is_empty());
    assert!(status.drives.iter().all(|d| d.status == DriveStatus::Up));
}

#[tokio::test]
async fn drive_set_down_mid_session_goes_down_at_the_end() {
    let site = site().await;
    site.scheduler
        .queue_archive(archive("class_a", "f", t0()))
        .await
        .unwrap();
    let mount = site
        .scheduler
        .get_next_mount("LIB1", "D1")
        .await
        .unwrap()
        .unwrap();

    site.scheduler
        .set_desired_drive_state("D1", DesiredDriveState::down("maintenance"))
        .await
        .unwrap();
    let states = site.scheduler.get_drive_states().await.unwrap();
    let d1 = states.iter().find(|d| d.name == "D1").unwrap();
    assert_eq!(d1.status, DriveStatus::Starting);

    // The unreported job goes back to its queue.
    let _job = mount.next_job().await.unwrap().unwrap();
    mount.complete(site.scheduler.now()).await.unwrap();

    let states = site.scheduler.get_drive_states().await.unwrap();
    let d1 = states.iter().find(|d| d.name == "D1").unwrap();
    assert_eq!(d1.status, DriveStatus::Down);
    assert_eq!(
        site.scheduler
            .get_pending_archive_jobs_for_pool("pool_a")
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(site.scheduler.get_next_mount("LIB1", "D2").await.unwrap().is_some());
}

#[tokio::test]
async fn drive_set_down_while_waiting_for_the_lock_gets_nothing() {
    let site = site().await;
    site.scheduler
        .queue_archive(archive("class_a", "f", t0()))
        .await
        .unwrap();

    let mut held = site.store.get_mount_info().await.unwrap();
    let scheduler = site.scheduler.clone();
    let waiting = tokio::spawn(async move { scheduler.get_next_mount("LIB1", "D1").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    site.scheduler
        .set_desired_drive_state("D1", DesiredDriveState::down("maintenance"))
        .await
        .unwrap();
    held.release();

    let outcome = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Ok(None)));

    // The queue is intact and another drive takes it.
    let mount = site
        .scheduler
        .get_next_mount("LIB1", "D2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mount.info().tape_pool, "pool_a");
}

#[tokio::test]
async fn retrieve_then_cancel_leaves_nothing_behind() {
    let site = site().await;
    site.catalogue
        .record_tape_file(4242, "class_a", 100, 1, "A00001")
        .unwrap();
    let before = site.scheduler.status().await.unwrap();
    let request = |path: &str| RetrieveRequest {
        disk_instance: "eos".into(),
        archive_file_id: 4242,
        requester: alice(),
        dst_url: format!("root://eos{path}"),
        remote_file: RemotePathAndStatus::new(path),
        vid: None,
        created_at: t0(),
    };

    site.scheduler
        .queue_retrieve(request("/eos/back"))
        .await
        .unwrap();
    assert_eq!(
        site.scheduler
            .get_pending_retrieve_jobs_for_vid("A00001")
            .await
            .unwrap()
            .len(),
        1
    );
    site.scheduler
        .abort_retrieve(&alice(), "/eos/back")
        .await
        .unwrap();

    // Aborted before commit.
    site.scheduler
        .queue_retrieve_pending(request("/eos/again"))
        .await
        .unwrap()
        .abort()
        .unwrap();

    let after = site.scheduler.status().await.unwrap();
    assert_eq!(after.queues, before.queues);
    assert!(site.scheduler.get_pending_retrieve_jobs().await.unwrap().is_empty());
    assert!(site.scheduler.get_next_mount("LIB1", "D1").await.unwrap().is_none());
}
