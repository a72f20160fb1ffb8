//! Container-backed guest.

use super::{load_optional, read, write, GuestRuntimeInstance, StartParams};
use crate::context::HostContext;
use crate::error::{GuestError, Result};
use crate::observability::metrics;
use crate::paths::GuestPaths;
use crate::remote::{ContainerRuntime, StatusReport};
use crate::tasks::{TaskCompletion, TaskContext};
use crate::types::{ContainerDesc, GuestDesc, GuestStatus, Hypervisor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Status a container is meant to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedStatus {
    Running,
    Exited,
}

/// Runtime ids backing a pod, persisted in the `containers` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PodState {
    #[serde(default)]
    sandbox_id: Option<String>,
    /// descriptor container id -> runtime container id
    #[serde(default)]
    containers: BTreeMap<String, String>,
}

fn load_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map_err(|e| GuestError::InvalidDesc {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(GuestError::io(path, e)),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| GuestError::Internal(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| GuestError::io(path, e))
}

pub struct PodGuestInstance {
    id: String,
    ctx: Arc<HostContext>,
    paths: GuestPaths,
    source_desc: RwLock<Option<GuestDesc>>,
    desc: RwLock<Option<GuestDesc>>,
    state: RwLock<PodState>,
    expected: RwLock<BTreeMap<String, ExpectedStatus>>,
    /// Serializes runtime operations on this pod.
    ops: Mutex<()>,
    dirty: AtomicBool,
    stopping: AtomicBool,
}

impl PodGuestInstance {
    pub fn new(id: impl Into<String>, ctx: Arc<HostContext>) -> Arc<Self> {
        let id = id.into();
        let paths = GuestPaths::new(&ctx.config.servers_path, &id);
        Arc::new(Self {
            id,
            ctx,
            paths,
            source_desc: RwLock::new(None),
            desc: RwLock::new(None),
            state: RwLock::new(PodState::default()),
            expected: RwLock::new(BTreeMap::new()),
            ops: Mutex::new(()),
            dirty: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>> {
        self.ctx.container_runtime.clone().ok_or_else(|| GuestError::Unsupported {
            operation: "pod guest".to_string(),
            reason: "no container runtime configured".to_string(),
        })
    }

    fn container_spec(&self, container_id: &str) -> Result<ContainerDesc> {
        self.desc()
            .and_then(|d| d.containers.into_iter().find(|c| c.id == container_id))
            .ok_or_else(|| GuestError::NotFound { resource: "container", id: container_id.to_string() })
    }

    pub fn expected_status(&self, container_id: &str) -> Option<ExpectedStatus> {
        read(&self.expected).get(container_id).copied()
    }

    pub fn runtime_container_id(&self, container_id: &str) -> Option<String> {
        read(&self.state).containers.get(container_id).cloned()
    }

    pub fn sandbox_id(&self) -> Option<String> {
        read(&self.state).sandbox_id.clone()
    }

    fn set_expected(&self, container_id: &str, status: ExpectedStatus) -> Result<()> {
        let snapshot = {
            let mut expected = write(&self.expected);
            expected.insert(container_id.to_string(), status);
            expected.clone()
        };
        save_json(&self.paths.expected_status(), &snapshot)
    }

    fn persist_state(&self) -> Result<()> {
        let snapshot = read(&self.state).clone();
        save_json(&self.paths.containers(), &snapshot)
    }

    async fn ensure_sandbox(&self, runtime: &dyn ContainerRuntime) -> Result<String> {
        if let Some(id) = self.sandbox_id() {
            return Ok(id);
        }
        let name = self.desc().map(|d| d.name).unwrap_or_default();
        let sandbox = runtime.run_sandbox(&self.id, &name).await?;
        write(&self.state).sandbox_id = Some(sandbox.clone());
        self.persist_state()?;
        Ok(sandbox)
    }

    /// Start one container, creating it on first use.
    async fn launch_container(&self, runtime: &dyn ContainerRuntime, spec: &ContainerDesc) -> Result<()> {
        let sandbox = self.ensure_sandbox(runtime).await?;
        let runtime_id = match self.runtime_container_id(&spec.id) {
            Some(id) => id,
            None => {
                let id = runtime.create_container(&sandbox, spec).await?;
                write(&self.state).containers.insert(spec.id.clone(), id.clone());
                self.persist_state()?;
                id
            }
        };
        runtime.start_container(&runtime_id).await?;
        self.set_expected(&spec.id, ExpectedStatus::Running)?;
        info!(guest_id = %self.id, container = %spec.id, runtime_id = %runtime_id, "Container started");
        Ok(())
    }

    #[instrument(skip(self), fields(guest_id = %self.id))]
    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        let runtime = self.runtime()?;
        let spec = self.container_spec(container_id)?;
        let _guard = self.ops.lock().await;
        self.launch_container(runtime.as_ref(), &spec).await
    }

    /// Stop one container and remember that it is meant to stay down.
    #[instrument(skip(self), fields(guest_id = %self.id))]
    pub async fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let runtime = self.runtime()?;
        let _guard = self.ops.lock().await;
        self.set_expected(container_id, ExpectedStatus::Exited)?;
        let runtime_id = self
            .runtime_container_id(container_id)
            .ok_or_else(|| GuestError::NotFound { resource: "container", id: container_id.to_string() })?;
        runtime.stop_container(&runtime_id, timeout.as_secs()).await?;
        info!(container = %container_id, "Container stopped");
        Ok(())
    }

    /// Restart containers that exited while expected to run. Returns the
    /// descriptor ids of the restarted containers.
    #[instrument(skip(self), fields(guest_id = %self.id))]
    pub async fn reconcile(&self) -> Result<Vec<String>> {
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let runtime = self.runtime()?;
        let _guard = self.ops.lock().await;
        let mut restarted = Vec::new();
        let known: Vec<(String, String)> =
            read(&self.state).containers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (container_id, runtime_id) in known {
            if self.expected_status(&container_id) != Some(ExpectedStatus::Running) {
                continue;
            }
            let state = match runtime.container_state(&runtime_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(container = %container_id, error = %e, "Failed to inspect container");
                    continue;
                }
            };
            if let crate::remote::ContainerState::Exited { exit_code } = state {
                warn!(container = %container_id, exit_code, "Container exited unexpectedly, restarting");
                match runtime.start_container(&runtime_id).await {
                    Ok(()) => {
                        metrics::record_container_restart();
                        restarted.push(container_id);
                    }
                    Err(e) => warn!(container = %container_id, error = %e, "Restart failed"),
                }
            }
        }
        Ok(restarted)
    }

    async fn start_all(&self) -> Result<Value> {
        let runtime = self.runtime()?;
        let desc = self.desc().ok_or_else(|| GuestError::invalid_state(&self.id, "no descriptor"))?;
        let _guard = self.ops.lock().await;
        for spec in &desc.containers {
            self.launch_container(runtime.as_ref(), spec).await?;
        }
        Ok(json!({ "is_running": true, "containers": desc.containers.len() }))
    }

    async fn stop_all(&self, timeout: Duration) -> Result<Value> {
        let runtime = self.runtime()?;
        let _guard = self.ops.lock().await;
        let known: Vec<(String, String)> =
            read(&self.state).containers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (container_id, runtime_id) in known {
            self.set_expected(&container_id, ExpectedStatus::Exited)?;
            runtime.stop_container(&runtime_id, timeout.as_secs()).await?;
        }
        Ok(json!({}))
    }

    async fn sync_status(&self) {
        let report = StatusReport::new(self.status());
        if let Err(e) = self.ctx.control_plane.sync_guest_status(&self.id, &report).await {
            warn!(guest_id = %self.id, error = %e, "Failed to sync guest status");
        }
    }
}

#[async_trait]
impl GuestRuntimeInstance for PodGuestInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn hypervisor(&self) -> Hypervisor {
        Hypervisor::Pod
    }

    fn paths(&self) -> &GuestPaths {
        &self.paths
    }

    fn load_desc(&self) -> Result<()> {
        let source = load_optional(&self.paths.source_desc())?;
        let live = load_optional(&self.paths.desc())?.or_else(|| source.clone());
        *write(&self.source_desc) = source;
        *write(&self.desc) = live;
        *write(&self.state) = load_json(&self.paths.containers())?;
        *write(&self.expected) = load_json(&self.paths.expected_status())?;
        Ok(())
    }

    fn source_desc(&self) -> Option<GuestDesc> {
        read(&self.source_desc).clone()
    }

    fn desc(&self) -> Option<GuestDesc> {
        read(&self.desc).clone()
    }

    fn save_source_desc(&self, desc: GuestDesc) -> Result<()> {
        desc.save(&self.paths.source_desc())?;
        *write(&self.source_desc) = Some(desc.clone());
        if !self.is_running() {
            self.save_live_desc(desc)?;
        }
        Ok(())
    }

    fn save_live_desc(&self, desc: GuestDesc) -> Result<()> {
        desc.save(&self.paths.desc())?;
        *write(&self.desc) = Some(desc);
        Ok(())
    }

    /// A pod counts as running while any container is meant to run.
    fn is_running(&self) -> bool {
        read(&self.expected).values().any(|s| *s == ExpectedStatus::Running)
    }

    fn is_suspend(&self) -> bool {
        false
    }

    fn status(&self) -> GuestStatus {
        if self.stopping.load(Ordering::SeqCst) {
            GuestStatus::Stopping
        } else if self.is_running() {
            GuestStatus::Running
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

    async fn start(self: Arc<Self>, ctx: TaskContext, _params: StartParams) -> Result<Value> {
        if self.is_running() {
            return Ok(json!({ "is_running": true }));
        }
        let completion = TaskCompletion::new(ctx, self.ctx.control_plane.clone(), "start");
        let this = self.clone();
        self.ctx.start_worker.submit(format!("start {}", self.id), async move {
            let result = this.start_all().await;
            metrics::record_guest_start(if result.is_ok() { "success" } else { "failure" });
            this.sync_status().await;
            completion.finish(result).await;
        });
        Ok(json!({ "is_running": false, "status": GuestStatus::Starting }))
    }

    async fn stop(self: Arc<Self>, ctx: TaskContext, timeout: Duration) -> Result<()> {
        let completion = TaskCompletion::new(ctx, self.ctx.control_plane.clone(), "stop");
        let this = self.clone();
        self.stopping.store(true, Ordering::SeqCst);
        self.ctx.delay_worker.submit(format!("stop {}", self.id), async move {
            let result = this.stop_all(timeout).await;
            this.stopping.store(false, Ordering::SeqCst);
            metrics::record_guest_stop("graceful");
            this.sync_status().await;
            completion.finish(result).await;
        });
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if let Ok(runtime) = self.runtime() {
            let _guard = self.ops.lock().await;
            let state = read(&self.state).clone();
            for runtime_id in state.containers.values() {
                if let Err(e) = runtime.stop_container(runtime_id, 0).await {
                    warn!(runtime_id = %runtime_id, error = %e, "Stop before removal failed");
                }
                runtime.remove_container(runtime_id).await?;
            }
            if let Some(sandbox) = &state.sandbox_id {
                runtime.remove_sandbox(sandbox).await?;
            }
        }
        *write(&self.state) = PodState::default();
        write(&self.expected).clear();
        match tokio::fs::remove_dir_all(self.paths.home()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GuestError::io(self.paths.home(), e)),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
