//! Bring a running guest's devices in line with an updated descriptor.
//!
//! [`diff_desc`] turns two descriptors into hotplug operations. Disks are
//! matched by index, virtio NICs by MAC and cdroms by ordinal.
//! [`SyncConfigTask`] applies them one at a time and reports one aggregated
//! result.

use super::{require_monitor, BoxedJob, GuestTask, TaskExecutor};
use crate::error::{GuestError, Result};
use crate::instance::{GuestRuntimeInstance, KvmGuestInstance};
use crate::monitor::Monitor;
use crate::paths::GuestPaths;
use crate::pci;
use crate::qemu::{self, drive_arg};
use crate::types::{DiskDesc, DiskDriver, GuestDesc, NicDesc, NicDriver, PciAddress};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOp {
    AddDisk(DiskDesc),
    RemoveDisk(DiskDesc),
    /// Insert media, or eject when `path` is `None`.
    ChangeCdrom { ordinal: u32, path: Option<PathBuf> },
    AddNic(NicDesc),
    RemoveNic(NicDesc),
}

impl SyncOp {
    pub fn label(&self) -> String {
        match self {
            SyncOp::AddDisk(d) => format!("add_disk:{}", d.disk_id),
            SyncOp::RemoveDisk(d) => format!("remove_disk:{}", d.disk_id),
            SyncOp::ChangeCdrom { ordinal, .. } => format!("change_cdrom:{}", ordinal),
            SyncOp::AddNic(n) => format!("add_nic:{}", n.mac),
            SyncOp::RemoveNic(n) => format!("remove_nic:{}", n.mac),
        }
    }
}

fn virtio_nics(desc: &GuestDesc) -> impl Iterator<Item = &NicDesc> {
    desc.nics.iter().filter(|n| n.driver == NicDriver::Virtio)
}

/// Hotplug operations turning `current` into `target`.
///
/// Removals come first so freed slots and ids can be reused by additions.
pub fn diff_desc(current: &GuestDesc, target: &GuestDesc) -> Vec<SyncOp> {
    let mut ops = Vec::new();

    for disk in &current.disks {
        if !target.disks.iter().any(|d| d.index == disk.index) {
            ops.push(SyncOp::RemoveDisk(disk.clone()));
        }
    }
    for nic in virtio_nics(current) {
        if !virtio_nics(target).any(|n| n.mac == nic.mac) {
            ops.push(SyncOp::RemoveNic(nic.clone()));
        }
    }
    for disk in &target.disks {
        if !current.disks.iter().any(|d| d.index == disk.index) {
            ops.push(SyncOp::AddDisk(disk.clone()));
        }
    }
    for nic in virtio_nics(target) {
        if !virtio_nics(current).any(|n| n.mac == nic.mac) {
            ops.push(SyncOp::AddNic(nic.clone()));
        }
    }
    for cdrom in &target.cdroms {
        let before = current.cdroms.iter().find(|c| c.ordinal == cdrom.ordinal).and_then(|c| c.path.clone());
        if before != cdrom.path {
            ops.push(SyncOp::ChangeCdrom { ordinal: cdrom.ordinal, path: cdrom.path.clone() });
        }
    }
    ops
}

/// `bus`/`addr` members for a hotplugged PCI device.
fn pci_placement(device: &str, address: Option<PciAddress>, space: &pci::PciAddressSpace) -> Result<(String, String)> {
    let address = address.ok_or_else(|| GuestError::NoValidAddress { device: device.to_string() })?;
    let bus = space
        .bus_id(address.bus)
        .ok_or_else(|| GuestError::NoValidAddress { device: device.to_string() })?;
    Ok((bus.to_string(), address.addr_arg()))
}

async fn add_disk(monitor: Arc<dyn Monitor>, disk: DiskDesc, scsi_bus: Option<String>, placement: Option<(String, String)>) -> Result<Value> {
    let device = match disk.driver {
        DiskDriver::Virtio => {
            let (bus, addr) = placement.ok_or_else(|| GuestError::NoValidAddress { device: disk.device_id() })?;
            json!({ "driver": "virtio-blk-pci", "drive": disk.drive_id(), "id": disk.device_id(), "bus": bus, "addr": addr })
        }
        DiskDriver::Scsi | DiskDriver::Pvscsi => json!({
            "driver": "scsi-hd",
            "drive": disk.drive_id(),
            "id": disk.device_id(),
            "bus": format!("{}.0", scsi_bus.unwrap_or_else(|| "scsi".to_string())),
            "scsi-id": disk.index,
        }),
        DiskDriver::Ide | DiskDriver::Sata => {
            return Err(GuestError::Unsupported {
                operation: "disk hotplug".to_string(),
                reason: format!("{:?} disks cannot be hot-added", disk.driver),
            })
        }
    };

    monitor.human_monitor_command(&format!("drive_add 0 {}", drive_arg(&disk))).await?;
    if let Err(e) = monitor.device_add(device).await {
        if let Err(undo) = monitor.human_monitor_command(&format!("drive_del {}", disk.drive_id())).await {
            warn!(drive = %disk.drive_id(), error = %undo, "Failed to drop drive after device_add failure");
        }
        return Err(e);
    }
    Ok(json!({ "disk_id": disk.disk_id }))
}

async fn remove_disk(monitor: Arc<dyn Monitor>, disk: DiskDesc) -> Result<Value> {
    monitor.device_del(&disk.device_id()).await?;
    monitor.human_monitor_command(&format!("drive_del {}", disk.drive_id())).await?;
    Ok(json!({ "disk_id": disk.disk_id }))
}

async fn change_cdrom(monitor: Arc<dyn Monitor>, ordinal: u32, path: Option<PathBuf>) -> Result<Value> {
    let drive = format!("cd{}", ordinal);
    match &path {
        Some(path) => monitor.human_monitor_command(&format!("change {} {}", drive, path.display())).await?,
        None => monitor.human_monitor_command(&format!("eject -f {}", drive)).await?,
    };
    Ok(json!({ "ordinal": ordinal, "path": path }))
}

async fn add_nic(monitor: Arc<dyn Monitor>, nic: NicDesc, paths: GuestPaths, placement: (String, String)) -> Result<Value> {
    let ifup = paths.ifup_script(nic.index as usize);
    let ifdown = paths.ifdown_script(nic.index as usize);
    qemu::write_script(&ifup, &qemu::ifup_script(&nic)).await?;
    qemu::write_script(&ifdown, &qemu::ifdown_script(&nic)).await?;

    monitor
        .netdev_add(json!({
            "type": "tap",
            "id": nic.netdev_id(),
            "ifname": nic.ifname,
            "script": ifup,
            "downscript": ifdown,
            "vhost": true,
        }))
        .await?;
    let (bus, addr) = placement;
    let device = json!({
        "driver": nic.driver.device_driver(),
        "netdev": nic.netdev_id(),
        "id": nic.device_id(),
        "mac": nic.mac,
        "bus": bus,
        "addr": addr,
    });
    if let Err(e) = monitor.device_add(device).await {
        if let Err(undo) = monitor.netdev_del(&nic.netdev_id()).await {
            warn!(netdev = %nic.netdev_id(), error = %undo, "Failed to drop netdev after device_add failure");
        }
        return Err(e);
    }
    Ok(json!({ "mac": nic.mac }))
}

async fn remove_nic(monitor: Arc<dyn Monitor>, nic: NicDesc) -> Result<Value> {
    monitor.device_del(&nic.device_id()).await?;
    monitor.netdev_del(&nic.netdev_id()).await?;
    Ok(json!({ "mac": nic.mac }))
}

/// Fold a successful operation into the live descriptor.
fn apply_op(desc: &mut GuestDesc, op: &SyncOp) {
    match op {
        SyncOp::AddDisk(disk) => desc.disks.push(disk.clone()),
        SyncOp::RemoveDisk(disk) => desc.disks.retain(|d| d.index != disk.index),
        SyncOp::AddNic(nic) => desc.nics.push(nic.clone()),
        SyncOp::RemoveNic(nic) => desc.nics.retain(|n| n.mac != nic.mac),
        SyncOp::ChangeCdrom { ordinal, path } => {
            if let Some(cd) = desc.cdroms.iter_mut().find(|c| c.ordinal == *ordinal) {
                cd.path = path.clone();
            }
        }
    }
}

/// Hot-add and hot-remove devices of a running guest.
pub struct SyncConfigTask {
    guest: Arc<KvmGuestInstance>,
    target: GuestDesc,
}

impl SyncConfigTask {
    pub fn new(guest: Arc<KvmGuestInstance>, target: GuestDesc) -> Self {
        Self { guest, target }
    }
}

#[async_trait]
impl GuestTask for SyncConfigTask {
    fn name(&self) -> &'static str {
        "sync_config"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let current = self.guest.desc().ok_or_else(|| GuestError::invalid_state(self.guest.id(), "no descriptor"))?;
        let storage = self.guest.ctx().storage.clone();

        let mut ops = diff_desc(&current, &self.target);
        if ops.is_empty() {
            return Ok(json!({ "ops": [] }));
        }

        // compose the post-sync layout so new devices get free addresses
        for op in ops.iter_mut() {
            if let SyncOp::AddDisk(disk) = op {
                if disk.path.as_os_str().is_empty() {
                    disk.path = storage.disk_path(disk);
                }
            }
        }
        let mut composed = current.clone();
        for op in &ops {
            apply_op(&mut composed, op);
        }
        let space = pci::ensure_pci_addresses(&mut composed, self.guest.ctx().config.pcie_root_ports)?;
        for op in ops.iter_mut() {
            match op {
                SyncOp::AddDisk(disk) => {
                    if let Some(placed) = composed.disks.iter().find(|d| d.index == disk.index) {
                        disk.pci_address = placed.pci_address;
                    }
                }
                SyncOp::AddNic(nic) => {
                    if let Some(placed) = composed.nics.iter().find(|n| n.mac == nic.mac) {
                        nic.pci_address = placed.pci_address;
                    }
                }
                _ => {}
            }
        }

        let scsi_bus = composed.scsi.as_ref().map(|s| s.id.clone());
        let paths = self.guest.paths().clone();
        let mut jobs: Vec<BoxedJob> = Vec::with_capacity(ops.len());
        for op in &ops {
            let monitor = monitor.clone();
            let job: BoxedJob = match op.clone() {
                SyncOp::AddDisk(disk) => {
                    let placement = if disk.driver == DiskDriver::Virtio {
                        Some(pci_placement(&disk.device_id(), disk.pci_address, &space)?)
                    } else {
                        None
                    };
                    Box::pin(add_disk(monitor, disk, scsi_bus.clone(), placement))
                }
                SyncOp::RemoveDisk(disk) => Box::pin(remove_disk(monitor, disk)),
                SyncOp::ChangeCdrom { ordinal, path } => Box::pin(change_cdrom(monitor, ordinal, path)),
                SyncOp::AddNic(nic) => {
                    let placement = pci_placement(&nic.device_id(), nic.pci_address, &space)?;
                    Box::pin(add_nic(monitor, nic, paths.clone(), placement))
                }
                SyncOp::RemoveNic(nic) => Box::pin(remove_nic(monitor, nic)),
            };
            jobs.push(job);
        }

        // one at a time: interleaved hotplug confuses the device model
        let results = TaskExecutor::new(1).run_all(jobs).await;

        let mut live = current;
        let mut report = Vec::with_capacity(ops.len());
        let mut failures = Vec::new();
        for (op, result) in ops.iter().zip(results) {
            match result {
                Ok(_) => {
                    apply_op(&mut live, op);
                    report.push(json!({ "op": op.label(), "ok": true }));
                }
                Err(e) => {
                    warn!(op = %op.label(), error = %e, "Sync operation failed");
                    report.push(json!({ "op": op.label(), "ok": false, "error": e.to_string() }));
                    failures.push(format!("{}: {}", op.label(), e));
                }
            }
        }
        self.guest.save_live_desc(live)?;

        if failures.is_empty() {
            info!(ops = report.len(), "Guest config synced");
            Ok(json!({ "ops": report }))
        } else {
            Err(GuestError::Internal(format!("sync failed: {}", failures.join("; "))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CdromDesc;

    fn desc_with(disks: &[u32], macs: &[&str]) -> GuestDesc {
        let mut desc = GuestDesc::new("g1");
        desc.disks = disks.iter().map(|i| DiskDesc::new(format!("d{}", i), *i)).collect();
        desc.nics = macs.iter().enumerate().map(|(i, m)| NicDesc::new(i as u32, *m)).collect();
        desc
    }

    #[test]
    fn test_diff_orders_removals_first() {
        let current = desc_with(&[0, 1], &["52:54:00:00:00:01"]);
        let target = desc_with(&[0, 2], &["52:54:00:00:00:02"]);
        let labels: Vec<String> = diff_desc(&current, &target).iter().map(SyncOp::label).collect();
        assert_eq!(
            labels,
            vec![
                "remove_disk:d1",
                "remove_nic:52:54:00:00:00:01",
                "add_disk:d2",
                "add_nic:52:54:00:00:00:02",
            ]
        );
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let desc = desc_with(&[0], &["52:54:00:00:00:01"]);
        assert!(diff_desc(&desc, &desc.clone()).is_empty());
    }

    #[test]
    fn test_diff_ignores_non_virtio_nics() {
        let current = desc_with(&[], &[]);
        let mut target = current.clone();
        let mut nic = NicDesc::new(0, "52:54:00:00:00:09");
        nic.driver = NicDriver::E1000;
        target.nics.push(nic);
        assert!(diff_desc(&current, &target).is_empty());
    }

    #[test]
    fn test_diff_cdrom_media_change() {
        let mut current = desc_with(&[], &[]);
        current.cdroms.push(CdromDesc { ordinal: 0, path: Some("/iso/a.iso".into()), boot_index: None });
        let mut target = current.clone();
        target.cdroms[0].path = None;
        assert_eq!(diff_desc(&current, &target), vec![SyncOp::ChangeCdrom { ordinal: 0, path: None }]);
    }

    #[test]
    fn test_apply_op_removes_by_index() {
        let mut desc = desc_with(&[0, 1], &[]);
        apply_op(&mut desc, &SyncOp::RemoveDisk(DiskDesc::new("d1", 1)));
        assert_eq!(desc.disks.len(), 1);
        assert_eq!(desc.disks[0].index, 0);
    }
}
