//! Shared fakes for the integration tests.
//!
//! Guest processes are faked through the proc root: a pid file in the guest
//! home plus `<proc_root>/<pid>/cmdline` naming the emulator binary and the
//! guest id. Pids start above the kernel's `pid_max`, so the SIGKILL sent
//! by a forced stop never reaches a real process.

#![allow(dead_code)]

use async_trait::async_trait;
use guestman_core::error::{GuestError, Result};
use guestman_core::monitor::{Monitor, MonitorConnection, MonitorConnector};
use guestman_core::remote::{
    ContainerRuntime, ContainerState, ControlPlane, DeployAgent, DeployRequest, DirtyGuestVerdict,
    RemoteGuest, StatusReport, StorageManager,
};
use guestman_core::types::{ContainerDesc, DiskDesc, GuestDesc, Hypervisor};
use guestman_core::{GuestManager, GuestRuntimeInstance, HostConfig, HostContext};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

static NEXT_FAKE_PID: AtomicI32 = AtomicI32::new(900_000_000);

/// First pid handed out by each harness's stand-in emulator.
static NEXT_EMULATOR_PID: AtomicI32 = AtomicI32::new(950_000_000);

/// Stand-in for the emulator binary. Records each launch, fails while
/// `fail` holds a positive count, sleeps `delay` seconds when present, then
/// fakes a live process the way [`Harness::fake_running`] does.
const FAKE_EMULATOR: &str = r#"#!/bin/sh
STATE=__STATE__
PROC=__PROC__
while [ $# -gt 0 ]; do
    case "$1" in
        -pidfile) PIDFILE=$2; shift ;;
        -uuid) UUID=$2; shift ;;
        -incoming) echo "incoming $2" >> "$STATE/args" ;;
    esac
    shift
done
echo "$UUID" >> "$STATE/launches"
if [ -f "$STATE/fail" ]; then
    N=$(cat "$STATE/fail")
    if [ "$N" -gt 0 ]; then
        echo $((N - 1)) > "$STATE/fail"
        echo "could not access KVM kernel module" >&2
        exit 1
    fi
fi
if [ -f "$STATE/delay" ]; then
    sleep "$(cat "$STATE/delay")"
fi
PID=$(cat "$STATE/next_pid")
echo $((PID + 1)) > "$STATE/next_pid"
mkdir -p "$PROC/$PID"
echo "qemu-system-x86_64 -uuid $UUID" > "$PROC/$PID/cmdline"
echo "$PID" > "$PIDFILE"
"#;

/// One control-plane call as seen by [`RecordingControlPlane`].
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Complete { task_id: String, data: Value },
    Failed { task_id: String, reason: String },
}

#[derive(Default)]
pub struct RecordingControlPlane {
    pub reports: Mutex<Vec<Report>>,
    pub statuses: Mutex<Vec<(String, StatusReport)>>,
    pub live: Mutex<Vec<String>>,
    pub pending_delete: Mutex<Vec<String>>,
    pub verdicts: Mutex<HashMap<String, DirtyGuestVerdict>>,
    /// Number of `list_host_guests` calls that fail before answering.
    pub list_failures: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl RecordingControlPlane {
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    pub fn reports_for(&self, task_id: &str) -> Vec<Report> {
        self.reports()
            .into_iter()
            .filter(|r| match r {
                Report::Complete { task_id: id, .. } | Report::Failed { task_id: id, .. } => id == task_id,
            })
            .collect()
    }

    /// Wait until `task_id` has been reported at least once.
    pub async fn wait_for(&self, task_id: &str) -> Report {
        for _ in 0..200 {
            if let Some(report) = self.reports_for(task_id).into_iter().next() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {} was never reported", task_id);
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn task_complete(&self, task_id: &str, data: Value) -> Result<()> {
        self.reports.lock().unwrap().push(Report::Complete { task_id: task_id.to_string(), data });
        Ok(())
    }

    async fn task_failed(&self, task_id: &str, reason: &str) -> Result<()> {
        self.reports
            .lock()
            .unwrap()
            .push(Report::Failed { task_id: task_id.to_string(), reason: reason.to_string() });
        Ok(())
    }

    async fn list_host_guests(&self, host_id: &str, pending_delete: bool) -> Result<Vec<RemoteGuest>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GuestError::ControlPlane { reason: "connection refused".to_string() });
        }
        let ids = if pending_delete { self.pending_delete.lock().unwrap() } else { self.live.lock().unwrap() };
        Ok(ids
            .iter()
            .map(|id| RemoteGuest {
                id: id.clone(),
                name: String::new(),
                status: String::new(),
                host_id: host_id.to_string(),
                pending_deleted: pending_delete,
            })
            .collect())
    }

    async fn verify_dirty_guest(&self, _host_id: &str, guest_id: &str) -> Result<DirtyGuestVerdict> {
        Ok(self.verdicts.lock().unwrap().get(guest_id).copied().unwrap_or(DirtyGuestVerdict::Keep))
    }

    async fn sync_guest_status(&self, guest_id: &str, report: &StatusReport) -> Result<()> {
        self.statuses.lock().unwrap().push((guest_id.to_string(), report.clone()));
        Ok(())
    }
}

/// Storage that only records what it was asked to do.
pub struct FakeStorage {
    pub root: PathBuf,
    pub calls: Mutex<Vec<String>>,
    pub fail_create: Mutex<bool>,
}

impl FakeStorage {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf(), calls: Mutex::new(Vec::new()), fail_create: Mutex::new(false) }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl StorageManager for FakeStorage {
    fn disk_path(&self, disk: &DiskDesc) -> PathBuf {
        if disk.path.as_os_str().is_empty() {
            self.root.join(&disk.disk_id)
        } else {
            disk.path.clone()
        }
    }

    fn snapshot_path(&self, disk: &DiskDesc, snapshot_id: &str) -> PathBuf {
        self.root.join("snapshots").join(&disk.disk_id).join(snapshot_id)
    }

    async fn create_disk(&self, disk: &DiskDesc, backing: Option<&Path>) -> Result<PathBuf> {
        self.record(format!("create:{}:{}", disk.disk_id, backing.map(|b| b.display().to_string()).unwrap_or_default()));
        if *self.fail_create.lock().unwrap() {
            return Err(GuestError::Storage { reason: "no space left".to_string() });
        }
        Ok(self.disk_path(disk))
    }

    async fn delete_disk(&self, disk: &DiskDesc) -> Result<()> {
        self.record(format!("delete:{}", disk.disk_id));
        Ok(())
    }

    async fn create_snapshot(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<PathBuf> {
        self.record(format!("snapshot:{}:{}", disk.disk_id, snapshot_id));
        Ok(self.snapshot_path(disk, snapshot_id))
    }

    async fn delete_snapshot(&self, disk: &DiskDesc, snapshot_id: &str, flatten: bool) -> Result<()> {
        self.record(format!("delete_snapshot:{}:{}:{}", disk.disk_id, snapshot_id, flatten));
        Ok(())
    }

    async fn reset_disk(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<PathBuf> {
        self.record(format!("reset:{}:{}", disk.disk_id, snapshot_id));
        Ok(self.disk_path(disk))
    }

    async fn prepare_migrate(&self, disk: &DiskDesc) -> Result<Option<String>> {
        Ok(Some(format!("template-of-{}", disk.disk_id)))
    }

    async fn fetch_snapshot(&self, url: &str, target: &Path) -> Result<()> {
        self.record(format!("fetch:{}->{}", url, target.display()));
        Ok(())
    }

    async fn resize_disk(&self, disk: &DiskDesc, size_mb: u64) -> Result<()> {
        self.record(format!("resize:{}:{}", disk.disk_id, size_mb));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDeployAgent {
    pub requests: Mutex<Vec<DeployRequest>>,
}

#[async_trait]
impl DeployAgent for FakeDeployAgent {
    async fn deploy_guest_fs(&self, request: &DeployRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(json!({ "deployed": true }))
    }

    async fn connect_external_disk(&self, _disk: &DiskDesc, _source: &Value) -> Result<Value> {
        Ok(json!({}))
    }

    async fn disconnect_external_disk(&self, _disk: &DiskDesc) -> Result<()> {
        Ok(())
    }
}

/// Monitor answering every command with an empty success.
pub struct FakeMonitor {
    pub commands: Mutex<Vec<(String, Option<Value>)>>,
    /// Commands (or HMP line prefixes) that fail.
    pub failing: Mutex<HashSet<String>>,
    /// Removed when `system_powerdown` arrives, simulating the guest exiting.
    pub exit_on_powerdown: Mutex<Option<PathBuf>>,
    /// Canned replies by command name.
    pub replies: Mutex<HashMap<String, Value>>,
    closed_tx: watch::Sender<bool>,
}

impl FakeMonitor {
    pub fn new() -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            exit_on_powerdown: Mutex::new(None),
            replies: Mutex::new(HashMap::new()),
            closed_tx,
        })
    }

    pub fn fail(&self, command: &str) {
        self.failing.lock().unwrap().insert(command.to_string());
    }

    pub fn reply(&self, command: &str, value: Value) {
        self.replies.lock().unwrap().insert(command.to_string(), value);
    }

    /// Arguments of every call to `command`, in order.
    pub fn calls_to(&self, command: &str) -> Vec<Value> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == command)
            .map(|(_, args)| args.clone().unwrap_or(Value::Null))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Command lines sent through the human monitor.
    pub fn hmp_lines(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == "human-monitor-command")
            .filter_map(|(_, args)| args.as_ref()?["command-line"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.commands.lock().unwrap().push((command.to_string(), arguments.clone()));
        let line = arguments.as_ref().and_then(|a| a["command-line"].as_str()).unwrap_or_default();
        let failing = self.failing.lock().unwrap().clone();
        if failing.contains(command) || failing.iter().any(|f| !line.is_empty() && line.starts_with(f.as_str())) {
            return Err(GuestError::MonitorCommand {
                command: command.to_string(),
                class: "GenericError".to_string(),
                desc: "injected failure".to_string(),
            });
        }
        if let Some(reply) = self.replies.lock().unwrap().get(command) {
            return Ok(reply.clone());
        }
        match command {
            "human-monitor-command" => Ok(Value::String(String::new())),
            "query-status" => Ok(json!({ "status": "running", "running": true })),
            "query-version" => Ok(json!({ "qemu": { "major": 4, "minor": 2, "micro": 0 } })),
            "query-block-jobs" => Ok(json!([])),
            "system_powerdown" => {
                if let Some(path) = self.exit_on_powerdown.lock().unwrap().take() {
                    let _ = std::fs::remove_file(path);
                }
                Ok(json!({}))
            }
            _ => Ok(json!({})),
        }
    }

    fn is_connected(&self) -> bool {
        !*self.closed_tx.borrow()
    }

    async fn disconnect(&self) {
        self.closed_tx.send_replace(true);
    }
}

/// Connector handing out a prepared [`FakeMonitor`].
pub struct FakeConnector {
    pub monitor: Arc<FakeMonitor>,
    /// Number of upcoming connects that never answer.
    pub hang: AtomicUsize,
    pub connects: AtomicUsize,
}

#[async_trait]
impl MonitorConnector for FakeConnector {
    async fn connect(&self, _guest_id: &str, _socket: &Path) -> Result<MonitorConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let hanging = self.hang.load(Ordering::SeqCst);
        if hanging > 0 {
            self.hang.store(hanging - 1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        let closed = self.monitor.closed_tx.subscribe();
        Ok(MonitorConnection { monitor: self.monitor.clone(), closed })
    }
}

/// Container runtime keeping container states in memory.
#[derive(Default)]
pub struct FakeRuntime {
    pub states: Mutex<HashMap<String, ContainerState>>,
    pub calls: Mutex<Vec<String>>,
    next: AtomicUsize,
}

impl FakeRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_state(&self, runtime_id: &str, state: ContainerState) {
        self.states.lock().unwrap().insert(runtime_id.to_string(), state);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run_sandbox(&self, pod_id: &str, _name: &str) -> Result<String> {
        self.record(format!("run_sandbox:{}", pod_id));
        Ok(format!("sandbox-{}", pod_id))
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.record(format!("remove_sandbox:{}", sandbox_id));
        Ok(())
    }

    async fn create_container(&self, _sandbox_id: &str, spec: &ContainerDesc) -> Result<String> {
        let id = format!("rt-{}-{}", spec.id, self.next.fetch_add(1, Ordering::SeqCst));
        self.record(format!("create:{}", spec.id));
        self.set_state(&id, ContainerState::Created);
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("start:{}", container_id));
        self.set_state(container_id, ContainerState::Running);
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u64) -> Result<()> {
        self.record(format!("stop:{}", container_id));
        self.set_state(container_id, ContainerState::Exited { exit_code: 0 });
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("remove:{}", container_id));
        self.states.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        Ok(self.states.lock().unwrap().get(container_id).copied().unwrap_or(ContainerState::Unknown))
    }
}

/// A manager over fakes rooted in a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub control_plane: Arc<RecordingControlPlane>,
    pub storage: Arc<FakeStorage>,
    pub deploy_agent: Arc<FakeDeployAgent>,
    pub runtime: Arc<FakeRuntime>,
    pub monitor: Arc<FakeMonitor>,
    pub connector: Arc<FakeConnector>,
    pub manager: Arc<GuestManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut HostConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = HostConfig {
            host_id: "host-1".to_string(),
            servers_path: dir.path().join("servers"),
            proc_root: dir.path().join("proc"),
            cgroup_root: dir.path().join("cgroup"),
            sysfs_pci_root: dir.path().join("sys"),
            storage_root: dir.path().join("disks"),
            qemu_binary: dir.path().join("bin").join("qemu-system-x86_64"),
            monitor_connect_delay_ms: 0,
            ..HostConfig::default()
        };
        tweak(&mut config);
        std::fs::create_dir_all(&config.servers_path).unwrap();
        std::fs::create_dir_all(&config.proc_root).unwrap();
        install_fake_emulator(&dir.path().join("emulator"), &config.qemu_binary, &config.proc_root);

        let control_plane = Arc::new(RecordingControlPlane::default());
        let storage = Arc::new(FakeStorage::new(&config.storage_root));
        let deploy_agent = Arc::new(FakeDeployAgent::default());
        let runtime = Arc::new(FakeRuntime::default());
        let monitor = FakeMonitor::new();
        let connector = Arc::new(FakeConnector {
            monitor: monitor.clone(),
            hang: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        let ctx = HostContext::new(config, control_plane.clone(), storage.clone(), deploy_agent.clone())
            .with_container_runtime(runtime.clone())
            .with_monitor_connector(connector.clone())
            .without_port_probe();
        let manager = GuestManager::new(Arc::new(ctx));
        Self { dir, control_plane, storage, deploy_agent, runtime, monitor, connector, manager }
    }

    pub fn ctx(&self) -> &Arc<HostContext> {
        self.manager.ctx()
    }

    /// Register a guest and store `desc` as its descriptor.
    pub async fn create_guest(&self, desc: GuestDesc) -> Arc<dyn GuestRuntimeInstance> {
        let guest = self.manager.prepare_create(&desc.uuid, desc.hypervisor).await.unwrap();
        guest.save_source_desc(desc).unwrap();
        guest
    }

    /// Make `guest` look like a live emulator. Returns the fake pid.
    pub fn fake_running(&self, guest: &dyn GuestRuntimeInstance) -> i32 {
        let pid = NEXT_FAKE_PID.fetch_add(1, Ordering::SeqCst);
        std::fs::write(guest.paths().pid(), pid.to_string()).unwrap();
        let proc_dir = self.ctx().config.proc_root.join(pid.to_string());
        std::fs::create_dir_all(&proc_dir).unwrap();
        let cmdline = format!("/usr/bin/{}\0-uuid\0{}\0", self.ctx().config.qemu_binary_name(), guest.id());
        std::fs::write(proc_dir.join("cmdline"), cmdline).unwrap();
        pid
    }

    pub fn cmdline_path(&self, pid: i32) -> PathBuf {
        self.ctx().config.proc_root.join(pid.to_string()).join("cmdline")
    }

    /// Simulate the emulator exiting on its own.
    pub fn fake_exit(&self, pid: i32) {
        std::fs::remove_file(self.cmdline_path(pid)).unwrap();
    }

    fn emulator_state(&self, name: &str) -> PathBuf {
        self.dir.path().join("emulator").join(name)
    }

    /// Make the next `count` emulator launches exit with an error.
    pub fn fail_launches(&self, count: usize) {
        std::fs::write(self.emulator_state("fail"), count.to_string()).unwrap();
    }

    /// Make every emulator launch take `secs` seconds.
    pub fn slow_launches(&self, secs: u64) {
        std::fs::write(self.emulator_state("delay"), secs.to_string()).unwrap();
    }

    /// Guest ids of every emulator launch, in order.
    pub fn launches(&self) -> Vec<String> {
        std::fs::read_to_string(self.emulator_state("launches"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// `-incoming` sources the emulator was launched with.
    pub fn incoming_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.emulator_state("args"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Poll `check` until it holds, panicking after five seconds.
    pub async fn eventually(&self, what: &str, check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }
}

fn install_fake_emulator(state: &Path, binary: &Path, proc_root: &Path) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(state).unwrap();
    let first_pid = NEXT_EMULATOR_PID.fetch_add(1_000, Ordering::SeqCst);
    std::fs::write(state.join("next_pid"), first_pid.to_string()).unwrap();
    let script = FAKE_EMULATOR
        .replace("__STATE__", &format!("'{}'", state.display()))
        .replace("__PROC__", &format!("'{}'", proc_root.display()));
    if let Some(parent) = binary.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(binary, script).unwrap();
    std::fs::set_permissions(binary, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn kvm_desc(id: &str) -> GuestDesc {
    let mut desc = GuestDesc::new(id);
    desc.name = format!("{}-name", id);
    desc.disks = vec![DiskDesc::new("root", 0)];
    desc
}

pub fn pod_desc(id: &str, containers: &[&str]) -> GuestDesc {
    let mut desc = GuestDesc::new(id);
    desc.hypervisor = Hypervisor::Pod;
    desc.containers = containers
        .iter()
        .map(|c| ContainerDesc {
            id: c.to_string(),
            name: c.to_string(),
            image: "busybox:latest".to_string(),
            command: Vec::new(),
            args: Vec::new(),
            envs: HashMap::new(),
            mounts: Vec::new(),
        })
        .collect();
    desc
}
