//! Integration tests for operations on a running KVM guest.

mod common;

use common::{kvm_desc, Harness, Report};
use guestman_core::error::GuestError;
use guestman_core::manager::Dispatch;
use guestman_core::types::{DiskDesc, GuestDesc, NicDesc};
use guestman_core::{GuestRuntimeInstance, TaskContext};
use serde_json::json;
use std::sync::Arc;

/// A guest that looks alive and has the fake monitor attached.
async fn running_guest(h: &Harness, desc: GuestDesc) -> Arc<dyn GuestRuntimeInstance> {
    let guest = h.create_guest(desc).await;
    h.fake_running(guest.as_ref());
    h.manager.kvm(guest.id()).unwrap().attach_monitor(h.monitor.clone());
    guest
}

#[tokio::test]
async fn test_sync_hotplugs_new_disk_and_nic() {
    let h = Harness::new();
    let guest = running_guest(&h, kvm_desc("g1")).await;

    let mut target = kvm_desc("g1");
    target.disks.push(DiskDesc::new("data", 1));
    let mut nic = NicDesc::new(0, "52:54:00:12:34:56");
    nic.ifname = "vnet-g1-0".to_string();
    target.nics.push(nic);

    let outcome = h.manager.guest_sync(TaskContext::new("t-sync"), "g1", target).await.unwrap();
    assert_eq!(outcome, Dispatch::Queued);
    let report = h.control_plane.wait_for("t-sync").await;
    assert!(matches!(report, Report::Complete { .. }), "{:?}", report);

    let lines = h.monitor.hmp_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("drive_add 0 "));
    let devices = h.monitor.calls_to("device_add");
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["driver"], "virtio-blk-pci");
    assert_eq!(devices[0]["id"], "disk_1");
    assert_eq!(devices[1]["netdev"], "vnet0");
    assert_eq!(h.monitor.calls_to("netdev_add")[0]["type"], "tap");

    let live = guest.desc().unwrap();
    assert_eq!(live.disks.len(), 2);
    assert_eq!(live.nics.len(), 1);
    assert!(guest.paths().ifup_script(0).exists());
}

#[tokio::test]
async fn test_sync_reports_failed_operation() {
    let h = Harness::new();
    let guest = running_guest(&h, kvm_desc("g1")).await;
    h.monitor.fail("drive_add");

    let mut target = kvm_desc("g1");
    target.disks.push(DiskDesc::new("data", 1));
    h.manager.guest_sync(TaskContext::new("t-sync"), "g1", target).await.unwrap();

    let report = h.control_plane.wait_for("t-sync").await;
    assert!(matches!(report, Report::Failed { ref reason, .. } if reason.contains("add_disk:data")), "{:?}", report);
    assert!(h.monitor.calls_to("device_add").is_empty());
    // only the requested copy carries the new disk
    assert_eq!(guest.desc().unwrap().disks.len(), 1);
    assert_eq!(guest.source_desc().unwrap().disks.len(), 2);
}

#[tokio::test]
async fn test_sync_of_stopped_guest_only_saves() {
    let h = Harness::new();
    let guest = h.create_guest(kvm_desc("g1")).await;

    let mut target = kvm_desc("g1");
    target.cpu = 2;
    let outcome = h.manager.guest_sync(TaskContext::new("t-sync"), "g1", target).await.unwrap();
    assert!(matches!(outcome, Dispatch::Done(_)));
    assert_eq!(guest.desc().unwrap().cpu, 2);
    assert!(h.monitor.names().is_empty());
}

#[tokio::test]
async fn test_hotplug_cpu_and_memory() {
    let h = Harness::new();
    let mut desc = kvm_desc("g1");
    desc.max_cpu = Some(4);
    desc.max_mem = Some(2048);
    let guest = running_guest(&h, desc).await;
    h.monitor.reply(
        "query-hotpluggable-cpus",
        json!([
            { "type": "qemu64-x86_64-cpu", "props": { "socket-id": 2, "core-id": 0, "thread-id": 0 } },
            { "type": "qemu64-x86_64-cpu", "props": { "socket-id": 1, "core-id": 0, "thread-id": 0 } },
            { "type": "qemu64-x86_64-cpu", "qom-path": "/machine/unattached/device[0]",
              "props": { "socket-id": 0, "core-id": 0, "thread-id": 0 } },
        ]),
    );

    h.manager.hotplug_cpu_mem(TaskContext::new("t-hp"), "g1", 1, 512).unwrap();
    let report = h.control_plane.wait_for("t-hp").await;
    assert_eq!(report, Report::Complete { task_id: "t-hp".to_string(), data: json!({ "cpu": 2, "mem": 1024 }) });

    let devices = h.monitor.calls_to("device_add");
    assert_eq!(devices[0]["id"], "cpu1");
    assert_eq!(devices[0]["socket-id"], 1);
    assert_eq!(devices[1]["driver"], "pc-dimm");
    assert_eq!(devices[1]["id"], "dimm0");
    assert_eq!(h.monitor.calls_to("object-add")[0]["id"], "mem0");

    let live = guest.desc().unwrap();
    assert_eq!((live.cpu, live.mem), (2, 1024));
    assert_eq!(guest.source_desc().unwrap().cpu, 2);
}

#[tokio::test]
async fn test_hotplug_beyond_maximum_fails() {
    let h = Harness::new();
    running_guest(&h, kvm_desc("g1")).await;

    h.manager.hotplug_cpu_mem(TaskContext::new("t-hp"), "g1", 1, 0).unwrap();
    let report = h.control_plane.wait_for("t-hp").await;
    assert!(matches!(report, Report::Failed { ref reason, .. } if reason.contains("max_cpu")));
    assert!(h.monitor.calls_to("device_add").is_empty());
}

#[tokio::test]
async fn test_online_resize_grows_live_disk() {
    let h = Harness::new();
    let mut desc = kvm_desc("g1");
    desc.disks[0].size = 10240;
    let guest = running_guest(&h, desc).await;

    let outcome = h.manager.online_resize_disk(TaskContext::new("t-rs"), "g1", "root", 20480).await.unwrap();
    assert_eq!(outcome, Dispatch::Queued);
    h.control_plane.wait_for("t-rs").await;

    let resize = h.monitor.calls_to("block_resize");
    assert_eq!(resize, vec![json!({ "device": "drive_0", "size": 20480u64 * 1024 * 1024 })]);
    assert_eq!(guest.desc().unwrap().disks[0].size, 20480);
    assert_eq!(guest.source_desc().unwrap().disks[0].size, 20480);
}

#[tokio::test]
async fn test_resize_of_stopped_guest_goes_to_storage() {
    let h = Harness::new();
    h.create_guest(kvm_desc("g1")).await;

    let outcome = h.manager.online_resize_disk(TaskContext::new("t-rs"), "g1", "root", 4096).await.unwrap();
    assert!(matches!(outcome, Dispatch::Done(_)));
    assert_eq!(h.storage.calls(), vec!["resize:root:4096".to_string()]);
}

#[tokio::test]
async fn test_monitor_command_qmp_and_hmp() {
    let h = Harness::new();
    running_guest(&h, kvm_desc("g1")).await;

    let reply = h.manager.monitor_command("g1", r#"{"execute":"query-status"}"#, true).await.unwrap();
    let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["status"], "running");

    h.manager.monitor_command("g1", "info block", false).await.unwrap();
    assert_eq!(h.monitor.hmp_lines(), vec!["info block".to_string()]);

    let err = h.manager.monitor_command("g1", "{not json", true).await.err().unwrap();
    assert!(matches!(err, GuestError::InputParameter { .. }));
}

#[tokio::test]
async fn test_operations_on_stopped_guest_are_rejected() {
    let h = Harness::new();
    h.create_guest(kvm_desc("g1")).await;

    assert!(matches!(
        h.manager.hotplug_cpu_mem(TaskContext::detached(), "g1", 1, 0),
        Err(GuestError::InvalidState { .. })
    ));
    assert!(matches!(h.manager.guest_suspend(TaskContext::detached(), "g1"), Err(GuestError::InvalidState { .. })));
    assert!(matches!(
        h.manager.monitor_command("g1", "info status", false).await,
        Err(GuestError::InvalidState { .. })
    ));
}
