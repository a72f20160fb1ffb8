//! Migration and disk snapshot operations.

use super::{DeleteSnapshotParams, DestPrepareMigrateParams, Dispatch, GuestManager, LiveMigrateParams, SnapshotParams};
use crate::error::{GuestError, Result};
use crate::instance::{GuestRole, GuestRuntimeInstance, KvmGuestInstance, StartOutcome, StartParams};
use crate::tasks::{
    CancelToken, DeleteSnapshotTask, DiskSnapshotTask, LiveMigrateTask, ReloadDiskTask, TaskContext,
};
use crate::types::{DiskDesc, Hypervisor};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};

/// Which path a snapshot operation takes for a guest in its current state.
enum SnapshotPath {
    Static,
    Live(Arc<KvmGuestInstance>),
}

impl GuestManager {
    /// Reserve `id` for an incoming migration. Returns false when the id is
    /// already known; the caller must not proceed then.
    pub fn can_migrate(&self, id: &str) -> bool {
        let placeholder = KvmGuestInstance::new(id, self.ctx.clone());
        self.try_insert(placeholder)
    }

    /// Backing references of the source guest's local disks.
    pub async fn src_prepare_migrate(&self, id: &str) -> Result<Value> {
        self.kvm(id)?.prepare_migrate().await
    }

    /// Build the destination guest: disks, fetched snapshots, descriptor and,
    /// for live migration, an emulator waiting for the incoming stream.
    ///
    /// On failure the partially created guest is removed again, including
    /// when the queued emulator start fails later.
    #[instrument(skip(self, ctx, params), fields(guest_id = %params.desc.uuid))]
    pub async fn dest_prepare_migrate(&self, ctx: TaskContext, params: DestPrepareMigrateParams) -> Result<Value> {
        let id = params.desc.uuid.clone();
        if !self.can_migrate(&id) {
            // only an empty reservation may be filled in
            let existing = self.require(&id)?;
            if existing.desc().is_some() || existing.is_running() {
                return Err(GuestError::AlreadyExists { guest_id: id });
            }
        }
        match self.build_dest_guest(ctx, params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(guest_id = %id, error = %e, "Destination preparation failed, cleaning up");
                if let Some(guest) = self.remove_entry(&id) {
                    if let Err(cleanup) = guest.destroy().await {
                        warn!(guest_id = %id, error = %cleanup, "Cleanup of destination guest failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn build_dest_guest(&self, ctx: TaskContext, params: DestPrepareMigrateParams) -> Result<Value> {
        let mut desc = params.desc;
        desc.validate()?;
        if desc.hypervisor != Hypervisor::Kvm {
            return Err(GuestError::Unsupported {
                operation: "migration".to_string(),
                reason: "only KVM guests migrate".to_string(),
            });
        }
        let guest = self.kvm(&desc.uuid)?;
        tokio::fs::create_dir_all(guest.paths().home())
            .await
            .map_err(|e| GuestError::io(guest.paths().home(), e))?;

        let storage = self.ctx.storage.clone();
        for disk in desc.disks.iter_mut() {
            if let Some(uri) = &params.snapshots_uri {
                for snapshot_id in params.disk_snapshots.get(&disk.disk_id).into_iter().flatten() {
                    let url = format!("{}/{}/{}", uri.trim_end_matches('/'), disk.disk_id, snapshot_id);
                    storage.fetch_snapshot(&url, &storage.snapshot_path(disk, snapshot_id)).await?;
                }
            }
            if !disk.is_local {
                continue;
            }
            let backing: Option<PathBuf> = params.disks_back.get(&disk.disk_id).cloned().flatten().map(PathBuf::from);
            disk.path = storage.create_disk(disk, backing.as_deref()).await?;
        }
        guest.save_source_desc(desc.clone())?;

        if !params.live_migrate {
            info!(guest_id = %desc.uuid, "Destination prepared for cold migration");
            return Ok(json!({ "disks": desc.disks.iter().map(|d| &d.path).collect::<Vec<_>>() }));
        }

        let params = StartParams { role: GuestRole::MigrateDest, ..StartParams::default() };
        let (reply, outcome) = guest.start_watched(ctx, params).await?;
        if let Some(outcome) = outcome {
            self.remove_dest_on_failure(&desc.uuid, outcome);
        }
        Ok(reply)
    }

    fn remove_dest_on_failure(&self, id: &str, outcome: oneshot::Receiver<StartOutcome>) {
        let manager = self.this.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let reason = match outcome.await {
                Ok(Ok(())) => return,
                Ok(Err(reason)) => reason,
                Err(_) => "start dropped".to_string(),
            };
            let Some(manager) = manager.upgrade() else {
                return;
            };
            warn!(guest_id = %id, reason = %reason, "Destination emulator failed to start, cleaning up");
            if let Some(guest) = manager.remove_entry(&id) {
                if let Err(e) = guest.destroy().await {
                    warn!(guest_id = %id, error = %e, "Cleanup of destination guest failed");
                }
            }
        });
    }

    /// Start pushing the guest to `params.dest_host`.
    pub fn live_migrate(&self, ctx: TaskContext, id: &str, params: LiveMigrateParams) -> Result<()> {
        let guest = self.running_kvm(id)?;
        let cancel = CancelToken::new();
        // registered before dispatch so a cancel right away is not lost
        guest.set_migrate_cancel(Some(cancel.clone()));
        self.dispatch(ctx, LiveMigrateTask::new(guest, params.dest_host, params.dest_port, cancel));
        Ok(())
    }

    pub fn cancel_live_migrate(&self, id: &str) -> Result<()> {
        if self.kvm(id)?.cancel_migrate() {
            Ok(())
        } else {
            Err(GuestError::invalid_state(id, "no migration in progress"))
        }
    }

    /// Tear down a destination guest whose incoming migration has not
    /// landed yet.
    pub async fn cancel_dest_migrate(&self, id: &str) -> Result<()> {
        let guest = self.kvm(id)?;
        if !guest.incoming_migration_pending().await {
            return Err(GuestError::invalid_state(id, "no incoming migration pending"));
        }
        self.guest_delete(id).await
    }

    /// Live tasks need a running emulator that can reopen drives in place;
    /// anything else works on the image files directly.
    fn snapshot_path_for(&self, id: &str) -> Result<SnapshotPath> {
        let guest = self.kvm(id)?;
        if !guest.is_running() {
            return Ok(SnapshotPath::Static);
        }
        let version = guest.qemu_version();
        if !version.supports_live_snapshot() {
            info!(guest_id = %id, version = %version, "Emulator lacks live snapshot, using image files");
            return Ok(SnapshotPath::Static);
        }
        Ok(SnapshotPath::Live(guest))
    }

    fn disk_of(&self, id: &str, disk_id: &str) -> Result<DiskDesc> {
        self.require(id)?
            .desc()
            .and_then(|d| d.disk(disk_id).cloned())
            .ok_or_else(|| GuestError::NotFound { resource: "disk", id: disk_id.to_string() })
    }

    pub async fn do_snapshot(&self, ctx: TaskContext, id: &str, params: SnapshotParams) -> Result<Dispatch> {
        let disk = self.disk_of(id, &params.disk_id)?;
        match self.snapshot_path_for(id)? {
            SnapshotPath::Static => {
                let location = self.ctx.storage.create_snapshot(&disk, &params.snapshot_id).await?;
                Ok(Dispatch::Done(json!({ "location": location })))
            }
            SnapshotPath::Live(guest) => {
                self.dispatch(ctx, DiskSnapshotTask::new(guest, params.disk_id, params.snapshot_id));
                Ok(Dispatch::Queued)
            }
        }
    }

    pub async fn delete_snapshot(&self, ctx: TaskContext, id: &str, params: DeleteSnapshotParams) -> Result<Dispatch> {
        let disk = self.disk_of(id, &params.disk_id)?;
        match self.snapshot_path_for(id)? {
            SnapshotPath::Static => {
                self.ctx.storage.delete_snapshot(&disk, &params.snapshot_id, params.flatten).await?;
                Ok(Dispatch::Done(json!({ "deleted": params.snapshot_id })))
            }
            SnapshotPath::Live(guest) => {
                let task = DeleteSnapshotTask::new(guest, params.disk_id, params.snapshot_id, params.flatten);
                self.dispatch(ctx, task);
                Ok(Dispatch::Queued)
            }
        }
    }

    /// Roll a disk back to a snapshot.
    pub async fn reload_disk_snapshot(&self, ctx: TaskContext, id: &str, params: SnapshotParams) -> Result<Dispatch> {
        let disk = self.disk_of(id, &params.disk_id)?;
        match self.snapshot_path_for(id)? {
            SnapshotPath::Static => {
                let location = self.ctx.storage.reset_disk(&disk, &params.snapshot_id).await?;
                Ok(Dispatch::Done(json!({ "location": location })))
            }
            SnapshotPath::Live(guest) => {
                self.dispatch(ctx, ReloadDiskTask::new(guest, params.disk_id, params.snapshot_id));
                Ok(Dispatch::Queued)
            }
        }
    }
}
