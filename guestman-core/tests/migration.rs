//! Integration tests for migration reservations and snapshot dispatch.

mod common;

use common::{kvm_desc, Harness, Report};
use guestman_core::error::GuestError;
use guestman_core::instance::{GuestRole, MAX_TRY};
use guestman_core::manager::{
    DeleteSnapshotParams, DestPrepareMigrateParams, Dispatch, LiveMigrateParams, SnapshotParams,
};
use guestman_core::qemu::QemuVersion;
use guestman_core::types::Hypervisor;
use guestman_core::{GuestRuntimeInstance, StartParams, TaskContext};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinSet;

fn dest_params(id: &str) -> DestPrepareMigrateParams {
    let mut disks_back = BTreeMap::new();
    disks_back.insert("root".to_string(), Some("/images/base.qcow2".to_string()));
    let mut disk_snapshots = BTreeMap::new();
    disk_snapshots.insert("root".to_string(), vec!["s1".to_string(), "s2".to_string()]);
    DestPrepareMigrateParams {
        desc: kvm_desc(id),
        disks_back,
        snapshots_uri: Some("http://src-host:8888/snapshots/".to_string()),
        disk_snapshots,
        live_migrate: false,
    }
}

#[tokio::test]
async fn test_can_migrate_reserves_id_once() {
    let h = Harness::new();

    assert!(h.manager.can_migrate("g1"));
    assert!(!h.manager.can_migrate("g1"));
    let err = h.manager.prepare_create("g1", Hypervisor::Kvm).await.err().unwrap();
    assert!(matches!(err, GuestError::AlreadyExists { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_can_migrate_has_one_winner_under_contention() {
    let h = Harness::new();

    let mut racers = JoinSet::new();
    for _ in 0..16 {
        let manager = h.manager.clone();
        racers.spawn(async move { manager.can_migrate("g1") });
    }
    let mut winners = 0;
    while let Some(won) = racers.join_next().await {
        if won.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(h.manager.guest_ids(), vec!["g1".to_string()]);
}

#[tokio::test]
async fn test_dest_prepare_cold_migration_fetches_snapshots() {
    let h = Harness::new();

    let result = h.manager.dest_prepare_migrate(TaskContext::detached(), dest_params("g1")).await.unwrap();
    assert_eq!(result["disks"][0], serde_json::json!(h.storage.root.join("root")));

    let snapshots = h.storage.root.join("snapshots").join("root");
    assert_eq!(
        h.storage.calls(),
        vec![
            format!("fetch:http://src-host:8888/snapshots/root/s1->{}", snapshots.join("s1").display()),
            format!("fetch:http://src-host:8888/snapshots/root/s2->{}", snapshots.join("s2").display()),
            "create:root:/images/base.qcow2".to_string(),
        ]
    );
    let guest = h.manager.get_server("g1").unwrap();
    assert!(guest.source_desc().is_some());
    assert!(!guest.is_running());
}

#[tokio::test]
async fn test_dest_prepare_fills_empty_reservation_only() {
    let h = Harness::new();
    assert!(h.manager.can_migrate("g1"));
    h.manager.dest_prepare_migrate(TaskContext::detached(), dest_params("g1")).await.unwrap();

    // a second preparation must not overwrite the guest just built
    let err = h.manager.dest_prepare_migrate(TaskContext::detached(), dest_params("g1")).await.err().unwrap();
    assert!(matches!(err, GuestError::AlreadyExists { .. }));
    assert!(h.manager.is_guest_exist("g1"));
}

#[tokio::test]
async fn test_dest_prepare_failure_removes_guest() {
    let h = Harness::new();
    *h.storage.fail_create.lock().unwrap() = true;

    let err = h.manager.dest_prepare_migrate(TaskContext::detached(), dest_params("g1")).await.err().unwrap();
    assert!(matches!(err, GuestError::Storage { .. }));
    assert!(!h.manager.is_guest_exist("g1"));
    assert!(!h.ctx().config.servers_path.join("g1").exists());
}

#[tokio::test]
async fn test_src_prepare_reports_backing_of_local_disks() {
    let h = Harness::new();
    let mut desc = kvm_desc("g1");
    let mut shared = guestman_core::types::DiskDesc::new("shared", 1);
    shared.is_local = false;
    desc.disks.push(shared);
    h.create_guest(desc).await;

    let result = h.manager.src_prepare_migrate("g1").await.unwrap();
    assert_eq!(result, serde_json::json!({ "disks_back": { "root": "template-of-root" } }));
}

#[tokio::test]
async fn test_cancel_without_migration_is_invalid() {
    let h = Harness::new();
    h.create_guest(kvm_desc("g1")).await;

    let err = h.manager.cancel_live_migrate("g1").err().unwrap();
    assert!(matches!(err, GuestError::InvalidState { .. }));
    let err = h.manager.cancel_dest_migrate("g1").await.err().unwrap();
    assert!(matches!(err, GuestError::InvalidState { .. }));
}

#[tokio::test]
async fn test_snapshot_of_stopped_guest_runs_inline() {
    let h = Harness::new();
    h.create_guest(kvm_desc("g1")).await;

    let params = SnapshotParams { disk_id: "root".to_string(), snapshot_id: "s1".to_string() };
    let outcome = h.manager.do_snapshot(TaskContext::new("t-snap"), "g1", params.clone()).await.unwrap();
    assert_eq!(
        outcome,
        Dispatch::Done(serde_json::json!({ "location": h.storage.root.join("snapshots").join("root").join("s1") }))
    );

    let delete = DeleteSnapshotParams { disk_id: "root".to_string(), snapshot_id: "s1".to_string(), flatten: true };
    h.manager.delete_snapshot(TaskContext::new("t-del"), "g1", delete).await.unwrap();
    h.manager.reload_disk_snapshot(TaskContext::new("t-reload"), "g1", params).await.unwrap();

    assert_eq!(
        h.storage.calls(),
        vec!["snapshot:root:s1".to_string(), "delete_snapshot:root:s1:true".to_string(), "reset:root:s1".to_string()]
    );
    assert!(h.control_plane.reports().is_empty());
}

#[tokio::test]
async fn test_old_emulator_snapshots_image_directly() {
    let h = Harness::new();
    let guest = h.create_guest(kvm_desc("g1")).await;
    h.fake_running(guest.as_ref());
    let kvm = h.manager.kvm("g1").unwrap();
    kvm.set_qemu_version(QemuVersion::new(2, 12, 0));
    kvm.attach_monitor(h.monitor.clone());

    let params = SnapshotParams { disk_id: "root".to_string(), snapshot_id: "s1".to_string() };
    let outcome = h.manager.do_snapshot(TaskContext::new("t-snap"), "g1", params).await.unwrap();
    assert!(matches!(outcome, Dispatch::Done(_)));
    assert_eq!(h.storage.calls(), vec!["snapshot:root:s1".to_string()]);
    assert!(h.monitor.names().is_empty());
}

#[tokio::test]
async fn test_live_snapshot_pauses_and_reloads_drive() {
    let h = Harness::new();
    let guest = h.create_guest(kvm_desc("g1")).await;
    h.fake_running(guest.as_ref());
    let kvm = h.manager.kvm("g1").unwrap();
    kvm.set_qemu_version(QemuVersion::new(4, 2, 0));
    kvm.attach_monitor(h.monitor.clone());

    let params = SnapshotParams { disk_id: "root".to_string(), snapshot_id: "s1".to_string() };
    let outcome = h.manager.do_snapshot(TaskContext::new("t-snap"), "g1", params).await.unwrap();
    assert_eq!(outcome, Dispatch::Queued);

    let report = h.control_plane.wait_for("t-snap").await;
    assert!(matches!(report, common::Report::Complete { .. }));
    assert_eq!(h.storage.calls(), vec!["snapshot:root:s1".to_string()]);
    let names = h.monitor.names();
    assert_eq!(names.first().map(String::as_str), Some("stop"));
    assert_eq!(names.last().map(String::as_str), Some("cont"));
    assert_eq!(
        h.monitor.hmp_lines(),
        vec![format!("reload_disk_snapshot_blkdev -n drive_0 {}", h.storage.root.join("root").display())]
    );
}

#[tokio::test]
async fn test_unknown_disk_is_not_found() {
    let h = Harness::new();
    h.create_guest(kvm_desc("g1")).await;

    let params = SnapshotParams { disk_id: "missing".to_string(), snapshot_id: "s1".to_string() };
    let err = h.manager.do_snapshot(TaskContext::detached(), "g1", params).await.err().unwrap();
    assert!(matches!(err, GuestError::NotFound { resource: "disk", .. }));
}

fn live_dest_params(id: &str) -> DestPrepareMigrateParams {
    DestPrepareMigrateParams { live_migrate: true, ..dest_params(id) }
}

/// A running guest with the harness monitor attached.
async fn running_guest(h: &Harness) {
    let guest = h.create_guest(kvm_desc("g1")).await;
    h.fake_running(guest.as_ref());
    h.manager.kvm("g1").unwrap().attach_monitor(h.monitor.clone());
}

#[tokio::test]
async fn test_live_dest_waits_for_incoming_stream() {
    let h = Harness::new();
    h.monitor.reply("query-status", json!({ "status": "inmigrate", "running": false }));

    let reply = h.manager.dest_prepare_migrate(TaskContext::new("t-dest"), live_dest_params("g1")).await.unwrap();
    assert_eq!(reply["is_running"], false);

    let report = h.control_plane.wait_for("t-dest").await;
    let Report::Complete { data, .. } = report else {
        panic!("destination start failed: {:?}", report);
    };
    let port = data["migrate_port"].as_u64().unwrap();
    assert_eq!(h.incoming_args(), vec![format!("incoming tcp:0:{}", port)]);
    assert!(!h.monitor.names().contains(&"cont".to_string()));

    let guest = h.manager.kvm("g1").unwrap();
    assert_eq!(guest.role(), GuestRole::MigrateDest);
    h.manager.cancel_dest_migrate("g1").await.unwrap();
    assert!(!h.manager.is_guest_exist("g1"));
    assert!(!guest.is_running());
}

#[tokio::test]
async fn test_landed_migration_becomes_plain_guest() {
    let h = Harness::new();
    h.manager.dest_prepare_migrate(TaskContext::new("t-dest"), live_dest_params("g1")).await.unwrap();
    h.control_plane.wait_for("t-dest").await;

    let guest = h.manager.kvm("g1").unwrap();
    h.eventually("destination role cleared", || guest.role() == GuestRole::Plain).await;
    let err = h.manager.cancel_dest_migrate("g1").await.err().unwrap();
    assert!(matches!(err, GuestError::InvalidState { .. }));
    assert!(h.manager.is_guest_exist("g1"));

    // the emulator exits, the guest is stopped and later started again
    h.fake_exit(guest.get_pid());
    h.manager.guest_stop(TaskContext::new("t-stop"), "g1", Some(Duration::from_secs(1))).await.unwrap();
    h.control_plane.wait_for("t-stop").await;
    h.manager.guest_start(TaskContext::new("t-start"), "g1", StartParams::default()).await.unwrap();

    let report = h.control_plane.wait_for("t-start").await;
    let Report::Complete { data, .. } = report else {
        panic!("restart failed: {:?}", report);
    };
    assert_eq!(data["is_running"], true);
    assert_eq!(h.launches().len(), 2);
    assert_eq!(h.incoming_args().len(), 1);
    assert_eq!(guest.role(), GuestRole::Plain);
}

#[tokio::test]
async fn test_failed_dest_start_removes_guest() {
    let h = Harness::new();
    h.fail_launches(MAX_TRY as usize);

    h.manager.dest_prepare_migrate(TaskContext::new("t-dest"), live_dest_params("g1")).await.unwrap();

    let report = h.control_plane.wait_for("t-dest").await;
    assert!(matches!(report, Report::Failed { .. }), "{:?}", report);
    h.eventually("destination removed", || !h.manager.is_guest_exist("g1")).await;
    let home = h.ctx().config.servers_path.join("g1");
    h.eventually("destination home removed", || !home.exists()).await;
}

#[tokio::test]
async fn test_live_migrate_completes() {
    let h = Harness::new();
    running_guest(&h).await;
    h.monitor.reply("query-migrate", json!({ "status": "completed" }));

    let params = LiveMigrateParams { dest_host: "10.0.0.9".to_string(), dest_port: 4400 };
    h.manager.live_migrate(TaskContext::new("t-mig"), "g1", params).unwrap();

    let report = h.control_plane.wait_for("t-mig").await;
    assert_eq!(report, Report::Complete { task_id: "t-mig".to_string(), data: json!({ "status": "completed" }) });
    assert_eq!(h.monitor.calls_to("migrate"), vec![json!({ "uri": "tcp:10.0.0.9:4400" })]);
    assert_eq!(h.monitor.calls_to("migrate-set-capabilities").len(), 1);

    let err = h.manager.cancel_live_migrate("g1").err().unwrap();
    assert!(matches!(err, GuestError::InvalidState { .. }));
}

#[tokio::test]
async fn test_live_migrate_reports_failure() {
    let h = Harness::new();
    running_guest(&h).await;
    h.monitor.reply("query-migrate", json!({ "status": "failed", "error-desc": "connection reset" }));

    let params = LiveMigrateParams { dest_host: "10.0.0.9".to_string(), dest_port: 4400 };
    h.manager.live_migrate(TaskContext::new("t-mig"), "g1", params).unwrap();

    let report = h.control_plane.wait_for("t-mig").await;
    let Report::Failed { reason, .. } = report else {
        panic!("migration should fail: {:?}", report);
    };
    assert!(reason.contains("connection reset"), "{}", reason);
    assert!(h.monitor.calls_to("migrate_cancel").is_empty());
}

#[tokio::test]
async fn test_live_migrate_cancel_issues_migrate_cancel() {
    let h = Harness::new();
    running_guest(&h).await;
    h.monitor.reply("query-migrate", json!({ "status": "active" }));

    let params = LiveMigrateParams { dest_host: "10.0.0.9".to_string(), dest_port: 4400 };
    h.manager.live_migrate(TaskContext::new("t-mig"), "g1", params).unwrap();
    h.eventually("migration started", || !h.monitor.calls_to("migrate").is_empty()).await;

    h.manager.cancel_live_migrate("g1").unwrap();
    let report = h.control_plane.wait_for("t-mig").await;
    assert!(matches!(report, Report::Failed { .. }), "{:?}", report);
    assert_eq!(h.monitor.calls_to("migrate_cancel").len(), 1);
    assert!(h.manager.kvm("g1").unwrap().is_running());
}
