use super::{require_monitor, wait_block_jobs, GuestTask};
use crate::error::{GuestError, Result};
use crate::instance::{GuestRuntimeInstance, KvmGuestInstance};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Mirror every drive to the NBD exports of a replication slave and wait
/// until all mirrors are in sync.
pub struct DriveMirrorTask {
    guest: Arc<KvmGuestInstance>,
    nbd_host: String,
    nbd_port: u16,
}

impl DriveMirrorTask {
    pub fn new(guest: Arc<KvmGuestInstance>, nbd_host: impl Into<String>, nbd_port: u16) -> Self {
        Self { guest, nbd_host: nbd_host.into(), nbd_port }
    }

    pub fn target(&self, drive: &str) -> String {
        format!("nbd:{}:{}:exportname={}", self.nbd_host, self.nbd_port, drive)
    }
}

#[async_trait]
impl GuestTask for DriveMirrorTask {
    fn name(&self) -> &'static str {
        "drive_mirror"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let desc = self.guest.desc().ok_or_else(|| GuestError::invalid_state(self.guest.id(), "no descriptor"))?;
        let drives: Vec<String> = desc.disks.iter().map(|d| d.drive_id()).collect();

        for (started, drive) in drives.iter().enumerate() {
            if let Err(e) = monitor.drive_mirror(drive, &self.target(drive), "raw", "full").await {
                for earlier in &drives[..started] {
                    if let Err(cancel) = monitor.block_job_cancel(earlier).await {
                        warn!(drive = %earlier, error = %cancel, "Failed to cancel mirror");
                    }
                }
                return Err(e);
            }
        }
        self.guest.set_block_jobs(drives.len());
        info!(drives = drives.len(), target = %self.nbd_host, "Drive mirrors started");

        // mirrors stay active after becoming ready; only the wait ends here
        if let Err(e) = wait_block_jobs(monitor.as_ref(), &drives, true, None, self.name()).await {
            self.guest.set_block_jobs(0);
            return Err(e);
        }
        Ok(json!({ "drives": drives }))
    }
}

/// Grow a disk of a running guest.
pub struct OnlineResizeDiskTask {
    guest: Arc<KvmGuestInstance>,
    disk_id: String,
    /// New size in MB.
    size_mb: u64,
}

impl OnlineResizeDiskTask {
    pub fn new(guest: Arc<KvmGuestInstance>, disk_id: impl Into<String>, size_mb: u64) -> Self {
        Self { guest, disk_id: disk_id.into(), size_mb }
    }
}

#[async_trait]
impl GuestTask for OnlineResizeDiskTask {
    fn name(&self) -> &'static str {
        "online_resize_disk"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let disk = self
            .guest
            .desc()
            .and_then(|d| d.disk(&self.disk_id).cloned())
            .ok_or_else(|| GuestError::NotFound { resource: "disk", id: self.disk_id.clone() })?;
        if self.size_mb < disk.size {
            return Err(GuestError::InputParameter {
                name: "size".to_string(),
                reason: format!("cannot shrink disk from {}MB to {}MB", disk.size, self.size_mb),
            });
        }

        monitor.block_resize(&disk.drive_id(), self.size_mb * 1024 * 1024).await?;

        let size = self.size_mb;
        let disk_id = self.disk_id.clone();
        self.guest.update_live_desc(|desc| {
            if let Some(d) = desc.disk_mut(&disk_id) {
                d.size = size;
            }
        })?;
        if let Some(mut source) = self.guest.source_desc() {
            if let Some(d) = source.disk_mut(&self.disk_id) {
                d.size = size;
                self.guest.save_source_desc(source)?;
            }
        }
        info!(disk_id = %self.disk_id, size_mb = size, "Disk resized online");
        Ok(json!({ "disk_id": self.disk_id, "size": size }))
    }
}
