//! Integration tests for startup reconciliation and the background passes.

mod common;

use common::{kvm_desc, pod_desc, Harness};
use guestman_core::instance::{KvmGuestInstance, PodGuestInstance};
use guestman_core::remote::DirtyGuestVerdict;
use guestman_core::types::{GuestDesc, Hypervisor};
use guestman_core::GuestRuntimeInstance;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Leave a guest on disk without registering it, as a previous run would.
fn seed_on_disk(h: &Harness, desc: GuestDesc) -> Arc<dyn GuestRuntimeInstance> {
    let guest: Arc<dyn GuestRuntimeInstance> = match desc.hypervisor {
        Hypervisor::Kvm => KvmGuestInstance::new(desc.uuid.as_str(), h.ctx().clone()) as Arc<dyn GuestRuntimeInstance>,
        Hypervisor::Pod => PodGuestInstance::new(desc.uuid.as_str(), h.ctx().clone()),
    };
    std::fs::create_dir_all(guest.paths().home()).unwrap();
    guest.save_source_desc(desc).unwrap();
    guest
}

#[tokio::test]
async fn test_load_candidates_skips_dirs_without_descriptor() {
    let h = Harness::new();
    seed_on_disk(&h, kvm_desc("g1"));
    seed_on_disk(&h, pod_desc("p1", &["web"]));
    std::fs::create_dir_all(h.ctx().config.servers_path.join("empty")).unwrap();
    std::fs::write(h.ctx().config.servers_path.join("stray-file"), b"x").unwrap();

    let candidates = h.manager.load_candidates().await;
    let mut ids: Vec<&String> = candidates.keys().collect();
    ids.sort();
    assert_eq!(ids, vec!["g1", "p1"]);
    assert_eq!(candidates["p1"].hypervisor(), Hypervisor::Pod);
}

#[tokio::test]
async fn test_bootstrap_imports_and_verifies_guests() {
    let h = Harness::new();
    for id in ["live", "deleting", "orphan", "stray"] {
        seed_on_disk(&h, kvm_desc(id));
    }
    h.control_plane.live.lock().unwrap().push("live".to_string());
    h.control_plane.pending_delete.lock().unwrap().push("deleting".to_string());
    h.control_plane.verdicts.lock().unwrap().insert("orphan".to_string(), DirtyGuestVerdict::Remove);
    h.control_plane.verdicts.lock().unwrap().insert("stray".to_string(), DirtyGuestVerdict::Keep);

    h.manager.bootstrap_with_retry(Duration::from_millis(10)).await;

    let mut ids = h.manager.guest_ids();
    ids.sort();
    assert_eq!(ids, vec!["deleting", "live", "stray"]);
    assert!(!h.manager.get_server("live").unwrap().is_dirty());
    assert!(h.manager.get_server("stray").unwrap().is_dirty());
    assert!(!h.ctx().config.servers_path.join("orphan").exists());
}

#[tokio::test]
async fn test_bootstrap_retries_until_control_plane_answers() {
    let h = Harness::new();
    seed_on_disk(&h, kvm_desc("g1"));
    h.control_plane.live.lock().unwrap().push("g1".to_string());
    h.control_plane.list_failures.store(2, Ordering::SeqCst);

    h.manager.bootstrap_with_retry(Duration::from_millis(10)).await;

    // two failed attempts, then one attempt with both passes
    assert_eq!(h.control_plane.list_calls.load(Ordering::SeqCst), 4);
    assert!(h.manager.is_guest_exist("g1"));
}

#[tokio::test]
async fn test_balance_pins_running_guests() {
    let h = Harness::with_config(|c| c.enable_cpu_pinning = true);
    std::fs::create_dir_all(&h.ctx().config.cgroup_root).unwrap();
    std::fs::write(h.ctx().config.cgroup_root.join("cpuset.cpus"), "0-3").unwrap();

    let mut big = kvm_desc("big");
    big.cpu = 2;
    let big = h.create_guest(big).await;
    let small = h.create_guest(kvm_desc("small")).await;
    h.create_guest(kvm_desc("idle")).await;
    let pid = h.fake_running(big.as_ref());
    h.fake_running(small.as_ref());

    assert_eq!(h.manager.balance_cpusets().await.unwrap(), 2);
    assert_eq!(h.ctx().cgroup.current("big").await, Some(vec![0, 1]));
    assert_eq!(h.ctx().cgroup.current("small").await, Some(vec![2]));
    assert_eq!(h.ctx().cgroup.current("idle").await, None);
    let procs = std::fs::read_to_string(h.ctx().cgroup.guest_dir("big").join("cgroup.procs")).unwrap();
    assert_eq!(procs, pid.to_string());
    assert_eq!(h.manager.kvm("big").unwrap().pinned_cpus(), Some(vec![0, 1]));
}

#[tokio::test]
async fn test_background_loops_respect_configuration() {
    let h = Harness::new();
    assert!(h.manager.spawn_cpuset_balancer().is_none());

    let reconciler = h.manager.spawn_pod_reconciler().unwrap();
    reconciler.abort();
}
