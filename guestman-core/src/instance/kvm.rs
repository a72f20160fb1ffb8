//! Emulator-backed guest.

use super::{load_optional, read, write, GuestRuntimeInstance, StartParams};
use crate::command;
use crate::context::HostContext;
use crate::error::{GuestError, Result};
use crate::monitor::{Monitor, MonitorConnection};
use crate::observability::metrics;
use crate::paths::GuestPaths;
use crate::pci;
use crate::qemu::{self, IncomingSource, LaunchOptions, QemuCommandBuilder, QemuVersion};
use crate::qga::GuestAgent;
use crate::remote::StatusReport;
use crate::tasks::{
    run_task, CancelToken, DriveMirrorTask, ResumeTask, StopTask, TaskCompletion, TaskContext, POLL_INTERVAL,
};
use crate::types::{GuestDesc, GuestStatus, Hypervisor};
use crate::vfio;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Launch attempts per start request.
pub const MAX_TRY: u32 = 3;

/// Wait before relaunching a guest whose monitor never answered.
const FROZEN_RESTART_DELAY: Duration = Duration::from_secs(2);

/// What the emulator is expected to do once the monitor is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GuestRole {
    /// Resume execution.
    #[default]
    Plain,
    /// Wait for an incoming live migration.
    MigrateDest,
    /// Replicate disks to a slave's NBD server.
    Master { nbd_host: String, nbd_port: u16 },
    /// Export disks over NBD for a master.
    Slave,
}

/// How a queued start ended: attached, or abandoned with a reason.
pub type StartOutcome = std::result::Result<(), String>;

struct StartRequest {
    params: StartParams,
    completion: TaskCompletion,
    requested_at: Instant,
    frozen_restarts: u32,
    outcome: Option<oneshot::Sender<StartOutcome>>,
}

impl StartRequest {
    fn new(params: StartParams, completion: TaskCompletion) -> Self {
        Self { params, completion, requested_at: Instant::now(), frozen_restarts: 0, outcome: None }
    }

    fn attached(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(Ok(()));
        }
    }

    async fn fail(mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(Err(reason.clone()));
        }
        self.completion.fail(reason).await;
    }
}

pub struct KvmGuestInstance {
    id: String,
    ctx: Arc<HostContext>,
    paths: GuestPaths,
    source_desc: RwLock<Option<GuestDesc>>,
    desc: RwLock<Option<GuestDesc>>,
    monitor: RwLock<Option<Arc<dyn Monitor>>>,
    monitor_watch: Mutex<Option<JoinHandle<()>>>,
    qemu_version: RwLock<Option<QemuVersion>>,
    role: RwLock<GuestRole>,
    agent: GuestAgent,
    stopping: AtomicBool,
    starting: AtomicBool,
    dirty: AtomicBool,
    block_jobs: AtomicUsize,
    migrate_port: AtomicU32,
    pinned_cpus: RwLock<Option<Vec<u32>>>,
    migrate_cancel: Mutex<Option<CancelToken>>,
}

impl KvmGuestInstance {
    pub fn new(id: impl Into<String>, ctx: Arc<HostContext>) -> Arc<Self> {
        let id = id.into();
        let paths = GuestPaths::new(&ctx.config.servers_path, &id);
        let transport = ctx.agent_connector.transport(&id, &paths.qga_socket());
        Arc::new(Self {
            agent: GuestAgent::new(id.clone(), transport),
            id,
            ctx,
            paths,
            source_desc: RwLock::new(None),
            desc: RwLock::new(None),
            monitor: RwLock::new(None),
            monitor_watch: Mutex::new(None),
            qemu_version: RwLock::new(None),
            role: RwLock::new(GuestRole::Plain),
            stopping: AtomicBool::new(false),
            starting: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            block_jobs: AtomicUsize::new(0),
            migrate_port: AtomicU32::new(0),
            pinned_cpus: RwLock::new(None),
            migrate_cancel: Mutex::new(None),
        })
    }

    pub fn ctx(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    pub fn agent(&self) -> &GuestAgent {
        &self.agent
    }

    /// Attached monitor, if any.
    pub fn monitor(&self) -> Option<Arc<dyn Monitor>> {
        read(&self.monitor).clone()
    }

    /// Attach a monitor without the connect flow (bootstrap of running
    /// guests, tests).
    pub fn attach_monitor(&self, monitor: Arc<dyn Monitor>) {
        *write(&self.monitor) = Some(monitor);
    }

    pub fn qemu_version(&self) -> QemuVersion {
        read(&self.qemu_version).unwrap_or_else(|| self.ctx.default_qemu_version())
    }

    pub fn set_qemu_version(&self, version: QemuVersion) {
        *write(&self.qemu_version) = Some(version);
    }

    pub fn role(&self) -> GuestRole {
        read(&self.role).clone()
    }

    pub fn set_role(&self, role: GuestRole) {
        *write(&self.role) = role;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn set_stopping(&self, stopping: bool) {
        self.stopping.store(stopping, Ordering::SeqCst);
    }

    pub fn set_block_jobs(&self, count: usize) {
        self.block_jobs.store(count, Ordering::SeqCst);
    }

    /// Incoming migration port while waiting as a migration destination.
    pub fn migrate_port(&self) -> Option<u16> {
        match self.migrate_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port as u16),
        }
    }

    pub fn pinned_cpus(&self) -> Option<Vec<u32>> {
        read(&self.pinned_cpus).clone()
    }

    /// Register the cancel token of an in-flight live migration.
    pub fn set_migrate_cancel(&self, token: Option<CancelToken>) {
        *self.migrate_cancel.lock().unwrap_or_else(|p| p.into_inner()) = token;
    }

    /// Cancel the in-flight live migration. Returns false when none runs.
    pub fn cancel_migrate(&self) -> bool {
        match self.migrate_cancel.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Mutate the live descriptor in memory and on disk.
    pub fn update_live_desc<F>(&self, update: F) -> Result<GuestDesc>
    where
        F: FnOnce(&mut GuestDesc),
    {
        let mut desc = self
            .desc()
            .ok_or_else(|| GuestError::invalid_state(&self.id, "no descriptor"))?;
        update(&mut desc);
        self.save_live_desc(desc.clone())?;
        Ok(desc)
    }

    /// Resolve the emulator pid.
    ///
    /// `-1` when no pid file exists, `-2` when the file is unreadable or the
    /// process it names is not this guest's emulator.
    pub fn get_pid(&self) -> i32 {
        let content = match std::fs::read_to_string(self.paths.pid()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return -1,
            Err(_) => return -2,
        };
        let pid = match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => pid,
            _ => return -2,
        };
        let cmdline_path = self.ctx.config.proc_root.join(pid.to_string()).join("cmdline");
        let Ok(cmdline) = std::fs::read(&cmdline_path) else {
            return -2;
        };
        let cmdline = String::from_utf8_lossy(&cmdline).replace('\0', " ");
        if cmdline.contains(&self.ctx.config.qemu_binary_name()) && cmdline.contains(&self.id) {
            pid
        } else {
            -2
        }
    }

    pub fn vnc_port(&self) -> Option<u16> {
        std::fs::read_to_string(self.paths.vnc()).ok()?.trim().parse().ok()
    }

    /// Kill the emulator and clear the pid file.
    #[instrument(skip(self), fields(guest_id = %self.id))]
    pub async fn force_stop(&self) -> Result<()> {
        let pid = self.get_pid();
        if pid > 0 {
            // SAFETY: plain signal delivery to a pid verified as this guest's emulator
            let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(GuestError::Internal(format!("kill {}: {}", pid, err)));
                }
            }
            info!(pid, "Killed emulator");
        }
        if self.paths.stop_script().exists() {
            if let Err(e) = command::run_script(&self.paths.stop_script()).await {
                warn!(error = %e, "Stop script failed");
            }
        }
        match tokio::fs::remove_file(self.paths.pid()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GuestError::io(self.paths.pid(), e)),
        }
        Ok(())
    }

    /// Push the current status to the control plane.
    pub async fn sync_status(&self, reason: Option<String>) {
        let mut report = StatusReport::new(self.status());
        report.reason = reason;
        report.block_jobs = self.block_jobs.load(Ordering::SeqCst);
        if let Err(e) = self.ctx.control_plane.sync_guest_status(&self.id, &report).await {
            warn!(guest_id = %self.id, error = %e, "Failed to sync guest status");
        }
    }

    /// Backing references of every local disk, for the destination host.
    #[instrument(skip(self), fields(guest_id = %self.id))]
    pub async fn prepare_migrate(&self) -> Result<Value> {
        let desc = self.desc().ok_or_else(|| GuestError::invalid_state(&self.id, "no descriptor"))?;
        let mut backings = BTreeMap::new();
        for disk in desc.disks.iter().filter(|d| d.is_local) {
            let backing = self.ctx.storage.prepare_migrate(disk).await?;
            backings.insert(disk.disk_id.clone(), backing);
        }
        Ok(json!({ "disks_back": backings }))
    }

    /// Pin to `cpus`; applied now when running, otherwise at next start.
    pub async fn set_cpuset(&self, cpus: Vec<u32>) -> Result<()> {
        *write(&self.pinned_cpus) = Some(cpus.clone());
        let pid = self.get_pid();
        if pid > 0 {
            self.ctx.cgroup.apply(&self.id, pid, &cpus).await?;
        }
        Ok(())
    }

    async fn apply_cgroup(&self) {
        if !self.ctx.config.enable_cpu_pinning {
            return;
        }
        let pid = self.get_pid();
        let Some(cpus) = self.pinned_cpus() else {
            return;
        };
        if pid > 0 {
            if let Err(e) = self.ctx.cgroup.apply(&self.id, pid, &cpus).await {
                warn!(guest_id = %self.id, error = %e, "Failed to apply cpuset");
            }
        }
    }

    fn release_ports(&self) {
        self.ctx.vnc_ports.release_owner(&self.id);
        self.ctx.migrate_ports.release_owner(&self.id);
        self.ctx.nbd_ports.release_owner(&self.id);
        self.migrate_port.store(0, Ordering::SeqCst);
    }

    /// Compose the descriptor, write scripts and run `startvm` once.
    async fn launch_once(&self) -> Result<()> {
        let mut desc = self.desc().ok_or_else(|| GuestError::invalid_state(&self.id, "no descriptor"))?;
        let config = &self.ctx.config;

        vfio::fill_extra_functions(&mut desc, &config.sysfs_pci_root)?;
        pci::ensure_pci_addresses(&mut desc, config.pcie_root_ports)?;

        self.release_ports();
        let vnc_port = self.ctx.vnc_ports.allocate(&self.id)?;
        let incoming = if self.role() == GuestRole::MigrateDest {
            let port = self.ctx.migrate_ports.allocate(&self.id)?;
            self.migrate_port.store(port as u32, Ordering::SeqCst);
            Some(IncomingSource::Tcp { port })
        } else {
            self.paths.state_files().pop().map(IncomingSource::StateFile)
        };

        let options = LaunchOptions {
            vnc_port,
            vnc_port_base: config.vnc_port_base,
            incoming,
            enable_kvm: Path::new("/dev/kvm").exists(),
        };
        let args = QemuCommandBuilder::new(&desc, &self.paths, &options).build()?;

        for nic in &desc.nics {
            qemu::write_script(&self.paths.ifup_script(nic.index as usize), &qemu::ifup_script(nic)).await?;
            qemu::write_script(&self.paths.ifdown_script(nic.index as usize), &qemu::ifdown_script(nic))
                .await?;
        }
        let start = qemu::start_script(&config.qemu_binary, &args, &self.paths, &self.id);
        qemu::write_script(&self.paths.start_script(), &start).await?;
        qemu::write_script(&self.paths.stop_script(), &qemu::stop_script(&self.paths, &self.id)).await?;

        command::run_script(&self.paths.start_script())
            .await
            .map_err(|e| GuestError::StartFailed { guest_id: self.id.clone(), reason: e.to_string() })?;

        if self.get_pid() <= 0 {
            return Err(GuestError::StartFailed {
                guest_id: self.id.clone(),
                reason: "emulator exited right after launch".to_string(),
            });
        }
        tokio::fs::write(self.paths.vnc(), vnc_port.to_string())
            .await
            .map_err(|e| GuestError::io(self.paths.vnc(), e))?;
        self.save_live_desc(desc)?;
        info!(guest_id = %self.id, vnc_port, "Emulator launched");
        Ok(())
    }

    /// Launch with retries; runs on the start worker.
    async fn script_start(self: Arc<Self>, request: StartRequest) {
        let mut last_error = None;
        for attempt in 0..MAX_TRY {
            if self.is_stopping() {
                self.abandon_start(request).await;
                return;
            }
            self.set_role(request.params.role.clone());
            match self.launch_once().await {
                Ok(()) if self.is_stopping() => {
                    // stop raced the launch and found no process yet
                    self.abandon_start(request).await;
                    return;
                }
                Ok(()) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.connect_monitor(request).await });
                    return;
                }
                Err(e) => {
                    warn!(guest_id = %self.id, attempt, error = %e, "Launch attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < MAX_TRY {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
        }

        self.starting.store(false, Ordering::SeqCst);
        self.release_ports();
        metrics::record_guest_start("failure");
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(guest_id = %self.id, reason = %reason, "Guest start failed");
        self.sync_status(Some(reason.clone())).await;
        request.fail(reason).await;
    }

    /// A stop arrived while starting: kill whatever was launched and fail
    /// the start.
    async fn abandon_start(&self, request: StartRequest) {
        info!(guest_id = %self.id, "Stop requested, abandoning start");
        if let Err(e) = self.force_stop().await {
            warn!(guest_id = %self.id, error = %e, "Failed to kill abandoned emulator");
        }
        self.starting.store(false, Ordering::SeqCst);
        self.release_ports();
        self.set_role(GuestRole::Plain);
        metrics::record_guest_start("aborted");
        self.sync_status(None).await;
        request.fail("guest is stopping").await;
    }

    fn enqueue_start(self: Arc<Self>, request: StartRequest) {
        let worker = self.ctx.start_worker.clone();
        let label = format!("start {}", self.id);
        worker.submit(label, async move { self.script_start(request).await });
    }

    async fn connect_monitor(self: Arc<Self>, request: StartRequest) {
        tokio::time::sleep(Duration::from_millis(self.ctx.config.monitor_connect_delay_ms)).await;
        let timeout = Duration::from_secs(self.ctx.config.monitor_command_timeout_secs);
        let socket = self.paths.monitor_socket();
        let connect = self.ctx.monitor_connector.connect(&self.id, &socket);
        match tokio::time::timeout(timeout, connect).await {
            Err(_) => self.on_frozen(request).await,
            Ok(Err(e)) => {
                warn!(guest_id = %self.id, error = %e, "Monitor connect failed");
                metrics::record_guest_start("failure");
                self.clone().on_disconnected().await;
                request.fail(e.to_string()).await;
            }
            Ok(Ok(connection)) => self.on_connected(connection, request).await,
        }
    }

    /// The emulator did not answer on its monitor: kill it and relaunch.
    async fn on_frozen(self: Arc<Self>, mut request: StartRequest) {
        error!(guest_id = %self.id, "Monitor unresponsive, treating guest as frozen");
        if let Err(e) = self.force_stop().await {
            warn!(guest_id = %self.id, error = %e, "Failed to kill frozen guest");
        }
        if request.frozen_restarts >= MAX_TRY || self.is_stopping() {
            self.starting.store(false, Ordering::SeqCst);
            self.release_ports();
            metrics::record_guest_start("failure");
            request.fail("emulator monitor unresponsive").await;
            return;
        }
        request.frozen_restarts += 1;
        tokio::time::sleep(FROZEN_RESTART_DELAY).await;
        self.enqueue_start(request);
    }

    async fn on_connected(self: Arc<Self>, connection: MonitorConnection, mut request: StartRequest) {
        let monitor = connection.monitor.clone();
        if self.is_stopping() && self.starting.load(Ordering::SeqCst) {
            monitor.disconnect().await;
            self.abandon_start(request).await;
            return;
        }
        self.attach_monitor(monitor.clone());

        let mut closed = connection.closed;
        let this = self.clone();
        let watch = tokio::spawn(async move {
            while !*closed.borrow() {
                // sender dropped without flagging: detached on purpose
                if closed.changed().await.is_err() {
                    return;
                }
            }
            this.on_disconnected().await;
        });
        if let Some(old) = self.monitor_watch.lock().unwrap_or_else(|p| p.into_inner()).replace(watch) {
            old.abort();
        }

        match monitor.query_version().await {
            Ok(version) => self.set_qemu_version(version),
            Err(e) => warn!(guest_id = %self.id, error = %e, "query-version failed"),
        }
        if let Some(password) = &request.params.vnc_password {
            if let Err(e) = monitor.set_vnc_password(password).await {
                warn!(guest_id = %self.id, error = %e, "Failed to set VNC password");
            }
        }
        self.apply_cgroup().await;

        self.starting.store(false, Ordering::SeqCst);
        metrics::record_guest_start("success");
        metrics::record_guest_start_duration(request.requested_at.elapsed().as_secs_f64());
        info!(guest_id = %self.id, version = %self.qemu_version(), role = ?self.role(), "Monitor attached");

        request.attached();
        let completion = request.completion;
        match self.role() {
            GuestRole::Plain => {
                run_task(ResumeTask::new(self.clone()), completion).await;
            }
            GuestRole::MigrateDest => {
                let data = json!({ "vnc_port": self.vnc_port(), "migrate_port": self.migrate_port() });
                completion.complete(data).await;
                let this = self.clone();
                tokio::spawn(async move { this.watch_incoming(monitor).await });
            }
            GuestRole::Master { nbd_host, nbd_port } => {
                let detached = TaskCompletion::new(TaskContext::detached(), self.ctx.control_plane.clone(), "resume");
                run_task(ResumeTask::new(self.clone()), detached).await;
                run_task(DriveMirrorTask::new(self.clone(), nbd_host, nbd_port), completion).await;
            }
            GuestRole::Slave => {
                let result = self.start_nbd_exports(monitor.as_ref()).await;
                completion.finish(result).await;
            }
        }
        self.sync_status(None).await;
    }

    /// Wait for the incoming migration stream to land, then drop the
    /// destination role.
    async fn watch_incoming(&self, monitor: Arc<dyn Monitor>) {
        while self.role() == GuestRole::MigrateDest && monitor.is_connected() {
            match monitor.query_status().await {
                Ok(status) if status == "inmigrate" => {}
                Ok(status) => {
                    info!(guest_id = %self.id, status = %status, "Incoming migration finished");
                    self.set_role(GuestRole::Plain);
                    self.sync_status(None).await;
                    return;
                }
                Err(e) => {
                    warn!(guest_id = %self.id, error = %e, "query-status failed while waiting for migration");
                    return;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Whether this guest still waits for its incoming migration stream.
    pub async fn incoming_migration_pending(&self) -> bool {
        if self.role() != GuestRole::MigrateDest {
            return false;
        }
        if self.starting.load(Ordering::SeqCst) {
            return true;
        }
        let Some(monitor) = self.monitor().filter(|m| m.is_connected()) else {
            return false;
        };
        matches!(monitor.query_status().await.as_deref(), Ok("inmigrate"))
    }

    async fn start_nbd_exports(&self, monitor: &dyn Monitor) -> Result<Value> {
        let port = self.ctx.nbd_ports.allocate(&self.id)?;
        monitor.nbd_server_start("0.0.0.0", port).await?;
        let desc = self.desc().ok_or_else(|| GuestError::invalid_state(&self.id, "no descriptor"))?;
        for disk in &desc.disks {
            monitor.nbd_server_add(&disk.drive_id(), true).await?;
        }
        Ok(json!({ "nbd_port": port }))
    }

    /// The monitor channel closed: the emulator is gone.
    async fn on_disconnected(self: Arc<Self>) {
        let role = self.role();
        info!(guest_id = %self.id, role = ?role, "Monitor disconnected");
        metrics::record_monitor_disconnect();
        write(&self.monitor).take();
        if let Some(token) = self.migrate_cancel.lock().unwrap_or_else(|p| p.into_inner()).take() {
            token.cancel();
        }
        self.starting.store(false, Ordering::SeqCst);
        if let Err(e) = self.force_stop().await {
            warn!(guest_id = %self.id, error = %e, "Cleanup after disconnect failed");
        }
        self.release_ports();
        self.set_block_jobs(0);
        self.set_role(GuestRole::Plain);
        // a slave losing its master is expected and not reported
        if role != GuestRole::Slave {
            self.sync_status(None).await;
        }
        self.ctx.cgroup.remove(&self.id).await;
    }

    /// Queue a start like [`GuestRuntimeInstance::start`], also handing back
    /// a receiver for its outcome. `None` when nothing was queued.
    #[instrument(skip(self, ctx, params), fields(guest_id = %self.id, role = ?params.role))]
    pub async fn start_watched(
        self: Arc<Self>,
        ctx: TaskContext,
        params: StartParams,
    ) -> Result<(Value, Option<oneshot::Receiver<StartOutcome>>)> {
        if self.is_running() {
            return Ok((json!({ "is_running": true, "vnc_port": self.vnc_port() }), None));
        }
        if self.desc().is_none() {
            return Err(GuestError::invalid_state(&self.id, "no descriptor"));
        }
        if self.starting.swap(true, Ordering::SeqCst) {
            return Ok((json!({ "is_running": false, "status": GuestStatus::Starting }), None));
        }
        self.set_stopping(false);
        self.set_role(params.role.clone());
        let (tx, rx) = oneshot::channel();
        let completion = TaskCompletion::new(ctx, self.ctx.control_plane.clone(), "start");
        let mut request = StartRequest::new(params, completion);
        request.outcome = Some(tx);
        self.clone().enqueue_start(request);
        Ok((json!({ "is_running": false, "status": GuestStatus::Starting }), Some(rx)))
    }

    /// Detach the monitor without treating it as a crash.
    pub async fn detach_monitor(&self) {
        if let Some(watch) = self.monitor_watch.lock().unwrap_or_else(|p| p.into_inner()).take() {
            watch.abort();
        }
        let monitor = write(&self.monitor).take();
        if let Some(monitor) = monitor {
            monitor.disconnect().await;
        }
    }

    /// Reattach to an emulator that survived a daemon restart.
    pub async fn reconnect(self: Arc<Self>) -> Result<()> {
        let socket = self.paths.monitor_socket();
        let connection = self.ctx.monitor_connector.connect(&self.id, &socket).await?;
        let completion = TaskCompletion::new(TaskContext::detached(), self.ctx.control_plane.clone(), "reconnect");
        let mut request = StartRequest::new(StartParams::default(), completion);
        request.frozen_restarts = MAX_TRY;
        self.on_connected(connection, request).await;
        Ok(())
    }
}

#[async_trait]
impl GuestRuntimeInstance for KvmGuestInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn hypervisor(&self) -> Hypervisor {
        Hypervisor::Kvm
    }

    fn paths(&self) -> &GuestPaths {
        &self.paths
    }

    fn load_desc(&self) -> Result<()> {
        let source = load_optional(&self.paths.source_desc())?;
        let live = load_optional(&self.paths.desc())?.or_else(|| source.clone());
        *write(&self.source_desc) = source;
        *write(&self.desc) = live;
        Ok(())
    }

    fn source_desc(&self) -> Option<GuestDesc> {
        read(&self.source_desc).clone()
    }

    fn desc(&self) -> Option<GuestDesc> {
        read(&self.desc).clone()
    }

    fn save_source_desc(&self, mut desc: GuestDesc) -> Result<()> {
        desc.fix_default_gateway();
        desc.save(&self.paths.source_desc())?;
        *write(&self.source_desc) = Some(desc.clone());
        if !self.is_running() {
            self.save_live_desc(desc)?;
        } else {
            debug!(guest_id = %self.id, "Guest running, live descriptor left untouched");
        }
        Ok(())
    }

    fn save_live_desc(&self, mut desc: GuestDesc) -> Result<()> {
        desc.fix_default_gateway();
        desc.save(&self.paths.desc())?;
        *write(&self.desc) = Some(desc);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_pid() > 0
    }

    fn is_suspend(&self) -> bool {
        !self.is_running() && !self.paths.state_files().is_empty()
    }

    fn status(&self) -> GuestStatus {
        if self.is_running() {
            if self.is_stopping() {
                GuestStatus::Stopping
            } else if self.starting.load(Ordering::SeqCst) {
                GuestStatus::Starting
            } else if self.block_jobs.load(Ordering::SeqCst) > 0 {
                GuestStatus::BlockStream
            } else {
                GuestStatus::Running
            }
        } else if self.starting.load(Ordering::SeqCst) {
            GuestStatus::Starting
        } else if self.is_suspend() {
            GuestStatus::Suspend
        } else if !self.paths.home().exists() {
            GuestStatus::NotFound
        } else {
            GuestStatus::Stopped
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    async fn start(self: Arc<Self>, ctx: TaskContext, params: StartParams) -> Result<Value> {
        let (reply, _) = self.start_watched(ctx, params).await?;
        Ok(reply)
    }

    #[instrument(skip(self, ctx), fields(guest_id = %self.id))]
    async fn stop(self: Arc<Self>, ctx: TaskContext, timeout: Duration) -> Result<()> {
        self.set_stopping(true);
        let completion = TaskCompletion::new(ctx, self.ctx.control_plane.clone(), "stop");
        let task = StopTask::new(self.clone(), timeout);
        self.ctx.delay_worker.submit(format!("stop {}", self.id), async move {
            run_task(task, completion).await;
        });
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.set_stopping(true);
        self.detach_monitor().await;
        self.force_stop().await?;
        self.release_ports();
        self.ctx.cgroup.remove(&self.id).await;
        match tokio::fs::remove_dir_all(self.paths.home()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GuestError::io(self.paths.home(), e)),
        }
        info!(guest_id = %self.id, "Guest destroyed");
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
