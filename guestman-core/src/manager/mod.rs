//! Host-wide guest registry and operation dispatcher.
//!
//! [`GuestManager`] is the single source of truth for which guests exist on
//! this host. Structural changes to the map happen under its write lock;
//! the lock is never held across I/O. Long operations are dispatched as
//! tasks onto the delay worker and report through their [`TaskContext`].

mod bootstrap;
mod migrate;
mod params;

pub use bootstrap::{BOOTSTRAP_RETRY_INTERVAL, POD_RECONCILE_INTERVAL};
pub use params::{
    CreateParams, DeleteSnapshotParams, DeployParams, DestPrepareMigrateParams, Dispatch,
    LiveMigrateParams, SnapshotParams,
};

use crate::context::HostContext;
use crate::error::{GuestError, Result};
use crate::instance::{GuestRuntimeInstance, KvmGuestInstance, PodGuestInstance, StartParams};
use crate::observability::metrics;
use crate::qga::GuestExecResult;
use crate::remote::DeployRequest;
use crate::tasks::{
    run_task, DriveMirrorTask, GuestTask, HotplugCpuMemTask, OnlineResizeDiskTask, SuspendTask,
    SyncConfigTask, TaskCompletion, TaskContext,
};
use crate::types::{GuestDesc, GuestStatus, Hypervisor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::{info, instrument, warn};

type GuestMap = HashMap<String, Arc<dyn GuestRuntimeInstance>>;

pub struct GuestManager {
    ctx: Arc<HostContext>,
    guests: RwLock<GuestMap>,
    /// Handle for background work that outlives a call.
    this: Weak<GuestManager>,
}

impl GuestManager {
    pub fn new(ctx: Arc<HostContext>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self { ctx, guests: RwLock::new(HashMap::new()), this: this.clone() })
    }

    pub fn ctx(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    fn map(&self) -> RwLockReadGuard<'_, GuestMap> {
        self.guests.read().unwrap_or_else(|p| p.into_inner())
    }

    fn map_mut(&self) -> RwLockWriteGuard<'_, GuestMap> {
        self.guests.write().unwrap_or_else(|p| p.into_inner())
    }

    fn new_instance(&self, id: &str, hypervisor: Hypervisor) -> Arc<dyn GuestRuntimeInstance> {
        match hypervisor {
            Hypervisor::Kvm => KvmGuestInstance::new(id, self.ctx.clone()) as Arc<dyn GuestRuntimeInstance>,
            Hypervisor::Pod => PodGuestInstance::new(id, self.ctx.clone()),
        }
    }

    /// Insert unless present. Returns false when the id is taken.
    fn try_insert(&self, guest: Arc<dyn GuestRuntimeInstance>) -> bool {
        let mut map = self.map_mut();
        if map.contains_key(guest.id()) {
            return false;
        }
        map.insert(guest.id().to_string(), guest);
        metrics::set_guest_count(map.len());
        true
    }

    fn remove_entry(&self, id: &str) -> Option<Arc<dyn GuestRuntimeInstance>> {
        let mut map = self.map_mut();
        let removed = map.remove(id);
        metrics::set_guest_count(map.len());
        removed
    }

    pub fn get_server(&self, id: &str) -> Option<Arc<dyn GuestRuntimeInstance>> {
        self.map().get(id).cloned()
    }

    pub fn is_guest_exist(&self, id: &str) -> bool {
        self.map().contains_key(id)
    }

    pub fn guest_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn require(&self, id: &str) -> Result<Arc<dyn GuestRuntimeInstance>> {
        self.get_server(id).ok_or_else(|| GuestError::guest_not_found(id))
    }

    /// The emulator-backed instance behind `id`.
    pub fn kvm(&self, id: &str) -> Result<Arc<KvmGuestInstance>> {
        self.require(id)?.as_any_arc().downcast::<KvmGuestInstance>().map_err(|_| GuestError::Unsupported {
            operation: "emulator operation".to_string(),
            reason: format!("guest {} is not a KVM guest", id),
        })
    }

    pub fn pod(&self, id: &str) -> Result<Arc<PodGuestInstance>> {
        self.require(id)?.as_any_arc().downcast::<PodGuestInstance>().map_err(|_| GuestError::Unsupported {
            operation: "container operation".to_string(),
            reason: format!("guest {} is not a pod", id),
        })
    }

    fn running_kvm(&self, id: &str) -> Result<Arc<KvmGuestInstance>> {
        let guest = self.kvm(id)?;
        if !guest.is_running() {
            return Err(GuestError::invalid_state(id, "not running"));
        }
        Ok(guest)
    }

    fn completion(&self, ctx: TaskContext, task: &'static str) -> TaskCompletion {
        TaskCompletion::new(ctx, self.ctx.control_plane.clone(), task)
    }

    /// Queue `task` on the delay worker.
    fn dispatch<T: GuestTask + 'static>(&self, ctx: TaskContext, task: T) {
        let completion = self.completion(ctx, task.name());
        let label = format!("{} {}", task.name(), task.guest_id());
        self.ctx.delay_worker.submit(label, async move {
            run_task(task, completion).await;
        });
    }

    /// Register `id` and create its home directory.
    #[instrument(skip(self))]
    pub async fn prepare_create(&self, id: &str, hypervisor: Hypervisor) -> Result<Arc<dyn GuestRuntimeInstance>> {
        let guest = self.new_instance(id, hypervisor);
        if !self.try_insert(guest.clone()) {
            return Err(GuestError::AlreadyExists { guest_id: id.to_string() });
        }
        if let Err(e) = tokio::fs::create_dir_all(guest.paths().home()).await {
            self.remove_entry(id);
            return Err(GuestError::io(guest.paths().home(), e));
        }
        info!(guest_id = %id, "Guest registered");
        Ok(guest)
    }

    /// Deployment rewrites disks, so the guest must be fully down.
    pub fn prepare_deploy(&self, id: &str) -> Result<Arc<dyn GuestRuntimeInstance>> {
        let guest = self.require(id)?;
        if guest.is_running() {
            return Err(GuestError::invalid_state(id, "running"));
        }
        if guest.is_suspend() {
            return Err(GuestError::invalid_state(id, "suspended"));
        }
        Ok(guest)
    }

    /// Create disks, persist the descriptor and run first deployment.
    #[instrument(skip(self, params), fields(guest_id = %params.desc.uuid))]
    pub async fn guest_create(&self, params: CreateParams) -> Result<Value> {
        let mut desc = params.desc;
        desc.validate()?;
        let guest = self.prepare_deploy(&desc.uuid)?;

        let mut disks = Vec::with_capacity(desc.disks.len());
        for disk in desc.disks.iter_mut() {
            let path = self.ctx.storage.create_disk(disk, disk.backing_path.as_deref()).await?;
            disk.path = path.clone();
            disks.push(path);
        }
        guest.save_source_desc(desc.clone())?;

        if desc.hypervisor == Hypervisor::Pod {
            return Ok(json!({ "disks": disks }));
        }
        let mut request = DeployRequest::for_desc(&desc, disks.clone());
        request.password = params.password;
        request.public_key = params.public_key;
        request.deploys = params.deploys;
        request.is_init = true;
        let deployed = self.ctx.deploy_agent.deploy_guest_fs(&request).await?;
        Ok(json!({ "disks": disks, "deploy": deployed }))
    }

    /// Redeploy the guest filesystem, optionally with a new descriptor.
    #[instrument(skip(self, params))]
    pub async fn guest_deploy(&self, id: &str, params: DeployParams) -> Result<Value> {
        let guest = self.prepare_deploy(id)?;
        if let Some(desc) = params.desc {
            desc.validate()?;
            guest.save_source_desc(desc)?;
        }
        let desc = guest.desc().ok_or_else(|| GuestError::invalid_state(id, "no descriptor"))?;
        let disks = desc.disks.iter().map(|d| self.ctx.storage.disk_path(d)).collect();
        let mut request = DeployRequest::for_desc(&desc, disks);
        request.password = params.password;
        request.public_key = params.public_key;
        request.deploys = params.deploys;
        request.reset_password = params.reset_password;
        self.ctx.deploy_agent.deploy_guest_fs(&request).await
    }

    /// Returns at once: the VNC port when running, otherwise the queued start.
    pub async fn guest_start(&self, ctx: TaskContext, id: &str, params: StartParams) -> Result<Value> {
        self.require(id)?.start(ctx, params).await
    }

    /// Dispatch a stop; `timeout` defaults to the configured stop timeout.
    pub async fn guest_stop(&self, ctx: TaskContext, id: &str, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.ctx.stop_timeout());
        self.require(id)?.stop(ctx, timeout).await
    }

    /// Run a raw monitor command. `qmp` selects a JSON QMP command
    /// (`{"execute": .., "arguments": ..}`) over a human monitor line.
    #[instrument(skip(self))]
    pub async fn monitor_command(&self, id: &str, command: &str, qmp: bool) -> Result<String> {
        let guest = self.running_kvm(id)?;
        let monitor = guest.monitor().ok_or_else(|| GuestError::invalid_state(id, "monitor not connected"))?;
        if !qmp {
            return monitor.human_monitor_command(command).await;
        }
        let request: Value = serde_json::from_str(command).map_err(|e| GuestError::InputParameter {
            name: "command".to_string(),
            reason: e.to_string(),
        })?;
        let execute = request["execute"].as_str().ok_or_else(|| GuestError::MissingParameter {
            name: "execute".to_string(),
        })?;
        let arguments = request.get("arguments").cloned();
        let reply = monitor.execute(execute, arguments).await?;
        Ok(reply.to_string())
    }

    /// Persist a new descriptor and hotplug the difference when running.
    #[instrument(skip(self, ctx, desc))]
    pub async fn guest_sync(&self, ctx: TaskContext, id: &str, desc: GuestDesc) -> Result<Dispatch> {
        desc.validate()?;
        let guest = self.require(id)?;
        guest.save_source_desc(desc.clone())?;
        if guest.hypervisor() != Hypervisor::Kvm || !guest.is_running() {
            return Ok(Dispatch::Done(json!({ "synced": true })));
        }
        let guest = self.kvm(id)?;
        self.dispatch(ctx, SyncConfigTask::new(guest, desc));
        Ok(Dispatch::Queued)
    }

    pub fn guest_suspend(&self, ctx: TaskContext, id: &str) -> Result<()> {
        let guest = self.running_kvm(id)?;
        self.dispatch(ctx, SuspendTask::new(guest));
        Ok(())
    }

    /// Kill the guest, delete its local disks and forget it.
    #[instrument(skip(self))]
    pub async fn guest_delete(&self, id: &str) -> Result<()> {
        let guest = self.remove_entry(id).ok_or_else(|| GuestError::guest_not_found(id))?;
        let desc = guest.desc();
        guest.destroy().await?;
        for disk in desc.iter().flat_map(|d| d.disks.iter()).filter(|d| d.is_local) {
            if let Err(e) = self.ctx.storage.delete_disk(disk).await {
                warn!(guest_id = %id, disk_id = %disk.disk_id, error = %e, "Failed to delete disk");
            }
        }
        info!(guest_id = %id, "Guest deleted");
        Ok(())
    }

    pub fn guest_status(&self, id: &str) -> Value {
        match self.get_server(id) {
            None => json!({ "status": GuestStatus::NotFound }),
            Some(guest) => {
                let mut status = json!({ "status": guest.status(), "is_dirty": guest.is_dirty() });
                if let Ok(kvm) = self.kvm(id) {
                    status["vnc_port"] = json!(kvm.vnc_port());
                    status["pid"] = json!(kvm.get_pid());
                }
                status
            }
        }
    }

    pub fn hotplug_cpu_mem(&self, ctx: TaskContext, id: &str, add_cpu: u32, add_mem: u64) -> Result<()> {
        let guest = self.running_kvm(id)?;
        self.dispatch(ctx, HotplugCpuMemTask::new(guest, add_cpu, add_mem));
        Ok(())
    }

    /// Grow a disk: through the emulator when running, on the file otherwise.
    pub async fn online_resize_disk(&self, ctx: TaskContext, id: &str, disk_id: &str, size_mb: u64) -> Result<Dispatch> {
        let guest = self.kvm(id)?;
        if guest.is_running() {
            self.dispatch(ctx, OnlineResizeDiskTask::new(guest, disk_id, size_mb));
            return Ok(Dispatch::Queued);
        }
        let disk = guest
            .desc()
            .and_then(|d| d.disk(disk_id).cloned())
            .ok_or_else(|| GuestError::NotFound { resource: "disk", id: disk_id.to_string() })?;
        self.ctx.storage.resize_disk(&disk, size_mb).await?;
        if let Some(mut source) = guest.source_desc() {
            if let Some(d) = source.disk_mut(disk_id) {
                d.size = size_mb;
            }
            guest.save_source_desc(source)?;
        }
        Ok(Dispatch::Done(json!({ "disk_id": disk_id, "size": size_mb })))
    }

    pub fn drive_mirror(&self, ctx: TaskContext, id: &str, nbd_host: &str, nbd_port: u16) -> Result<()> {
        let guest = self.running_kvm(id)?;
        self.dispatch(ctx, DriveMirrorTask::new(guest, nbd_host, nbd_port));
        Ok(())
    }

    pub async fn set_cpuset(&self, id: &str, cpus: Vec<u32>) -> Result<()> {
        self.kvm(id)?.set_cpuset(cpus).await
    }

    pub async fn qga_ping(&self, id: &str) -> Result<()> {
        self.running_kvm(id)?.agent().ping().await
    }

    pub async fn qga_set_password(&self, id: &str, username: &str, password: &str, crypted: bool) -> Result<()> {
        self.running_kvm(id)?.agent().set_user_password(username, password, crypted).await
    }

    /// Run a raw agent command.
    pub async fn qga_command(&self, id: &str, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.running_kvm(id)?.agent().execute(command, arguments).await
    }

    pub async fn qga_exec(&self, id: &str, path: &str, args: &[String], wait: Duration) -> Result<GuestExecResult> {
        self.running_kvm(id)?.agent().exec_command(path, args, wait).await
    }

    pub async fn qga_guest_info(&self, id: &str) -> Result<Value> {
        self.running_kvm(id)?.agent().guest_info().await
    }

    pub async fn qga_network_interfaces(&self, id: &str) -> Result<Value> {
        self.running_kvm(id)?.agent().network_interfaces().await
    }

    pub async fn start_container(&self, id: &str, container_id: &str) -> Result<()> {
        self.pod(id)?.start_container(container_id).await
    }

    pub async fn stop_container(&self, id: &str, container_id: &str, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.ctx.stop_timeout());
        self.pod(id)?.stop_container(container_id, timeout).await
    }
}
