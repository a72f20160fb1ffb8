//! Live disk snapshot tasks.
//!
//! These run against a live emulator that can reopen a drive in place. The
//! manager takes the static path (plain file operations) for stopped guests.

use super::{require_monitor, wait_block_jobs, GuestTask};
use crate::error::{GuestError, Result};
use crate::instance::{GuestRuntimeInstance, KvmGuestInstance};
use crate::monitor::Monitor;
use crate::types::DiskDesc;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

fn find_disk(guest: &KvmGuestInstance, disk_id: &str) -> Result<DiskDesc> {
    guest
        .desc()
        .and_then(|d| d.disk(disk_id).cloned())
        .ok_or_else(|| GuestError::NotFound { resource: "disk", id: disk_id.to_string() })
}

/// Run `op` with guest execution paused, resuming even when `op` fails.
async fn paused<F, T>(monitor: &dyn Monitor, op: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    monitor.stop().await?;
    let result = op.await;
    if let Err(e) = monitor.cont().await {
        warn!(error = %e, "Failed to resume guest after disk operation");
        if result.is_ok() {
            return Err(e);
        }
    }
    result
}

/// Freeze a disk's current image as a snapshot and continue on an overlay.
pub struct DiskSnapshotTask {
    guest: Arc<KvmGuestInstance>,
    disk_id: String,
    snapshot_id: String,
}

impl DiskSnapshotTask {
    pub fn new(guest: Arc<KvmGuestInstance>, disk_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self { guest, disk_id: disk_id.into(), snapshot_id: snapshot_id.into() }
    }
}

#[async_trait]
impl GuestTask for DiskSnapshotTask {
    fn name(&self) -> &'static str {
        "disk_snapshot"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let disk = find_disk(&self.guest, &self.disk_id)?;
        let storage = self.guest.ctx().storage.clone();
        let current = storage.disk_path(&disk);

        let location = paused(monitor.as_ref(), async {
            let location = storage.create_snapshot(&disk, &self.snapshot_id).await?;
            monitor.reload_disk_blkdev(&disk.drive_id(), &current).await?;
            Ok(location)
        })
        .await?;
        info!(disk_id = %self.disk_id, snapshot_id = %self.snapshot_id, "Live snapshot taken");
        Ok(json!({ "location": location }))
    }
}

/// Roll a disk back to a snapshot while the guest runs.
pub struct ReloadDiskTask {
    guest: Arc<KvmGuestInstance>,
    disk_id: String,
    snapshot_id: String,
}

impl ReloadDiskTask {
    pub fn new(guest: Arc<KvmGuestInstance>, disk_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self { guest, disk_id: disk_id.into(), snapshot_id: snapshot_id.into() }
    }
}

#[async_trait]
impl GuestTask for ReloadDiskTask {
    fn name(&self) -> &'static str {
        "reload_disk"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let disk = find_disk(&self.guest, &self.disk_id)?;
        let storage = self.guest.ctx().storage.clone();

        let location = paused(monitor.as_ref(), async {
            let path = storage.reset_disk(&disk, &self.snapshot_id).await?;
            monitor.reload_disk_blkdev(&disk.drive_id(), &path).await?;
            Ok(path)
        })
        .await?;
        Ok(json!({ "location": location }))
    }
}

/// Merge a snapshot into the live image, then remove its file.
pub struct DeleteSnapshotTask {
    guest: Arc<KvmGuestInstance>,
    disk_id: String,
    snapshot_id: String,
    flatten: bool,
}

impl DeleteSnapshotTask {
    pub fn new(
        guest: Arc<KvmGuestInstance>,
        disk_id: impl Into<String>,
        snapshot_id: impl Into<String>,
        flatten: bool,
    ) -> Self {
        Self { guest, disk_id: disk_id.into(), snapshot_id: snapshot_id.into(), flatten }
    }
}

#[async_trait]
impl GuestTask for DeleteSnapshotTask {
    fn name(&self) -> &'static str {
        "delete_snapshot"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let disk = find_disk(&self.guest, &self.disk_id)?;
        let storage = self.guest.ctx().storage.clone();

        if self.flatten {
            let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
            let drive = disk.drive_id();
            monitor.block_stream(&drive).await?;
            self.guest.set_block_jobs(1);
            let waited = wait_block_jobs(monitor.as_ref(), &[drive], false, None, self.name()).await;
            self.guest.set_block_jobs(0);
            waited?;
        }
        // streaming already pulled the data into the live image
        storage.delete_snapshot(&disk, &self.snapshot_id, false).await?;
        Ok(json!({ "deleted": self.snapshot_id }))
    }
}
