//! Container runtime interface used by pod guests.

use crate::command;
use crate::error::{GuestError, Result};
use crate::types::ContainerDesc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Observed runtime state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ContainerState {
    Created,
    Running,
    Exited { exit_code: i32 },
    Unknown,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the pod sandbox and return its runtime id.
    async fn run_sandbox(&self, pod_id: &str, name: &str) -> Result<String>;

    async fn remove_sandbox(&self, sandbox_id: &str) -> Result<()>;

    async fn create_container(&self, sandbox_id: &str, spec: &ContainerDesc) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn container_state(&self, container_id: &str) -> Result<ContainerState>;
}

/// CRI runtime driven through `crictl`.
#[derive(Debug, Clone)]
pub struct CrictlRuntime {
    binary: String,
    /// Where pod/container configs handed to `crictl` are written.
    config_dir: PathBuf,
}

impl CrictlRuntime {
    pub fn new(binary: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into(), config_dir: config_dir.into() }
    }

    async fn crictl(&self, args: &[&str]) -> Result<String> {
        command::run(&self.binary, args)
            .await
            .map_err(|e| GuestError::ContainerRuntime { reason: e.to_string() })
    }

    async fn write_config(&self, name: &str, config: &Value) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| GuestError::io(&self.config_dir, e))?;
        let path = self.config_dir.join(name);
        let content = serde_json::to_vec_pretty(config).map_err(GuestError::internal)?;
        tokio::fs::write(&path, content).await.map_err(|e| GuestError::io(&path, e))?;
        Ok(path)
    }

    fn pod_config_path(&self, sandbox_id: &str) -> PathBuf {
        self.config_dir.join(format!("{}.pod.json", sandbox_id))
    }
}

fn pod_config(pod_id: &str, name: &str) -> Value {
    json!({
        "metadata": { "name": name, "uid": pod_id, "namespace": "default", "attempt": 0 },
        "log_directory": format!("/var/log/pods/{}", pod_id),
    })
}

fn container_config(spec: &ContainerDesc) -> Value {
    let envs: Vec<Value> = spec.envs.iter().map(|(k, v)| json!({ "key": k, "value": v })).collect();
    let mounts: Vec<Value> = spec
        .mounts
        .iter()
        .map(|m| json!({ "container_path": m.container_path, "host_path": m.host_path, "readonly": m.readonly }))
        .collect();
    json!({
        "metadata": { "name": spec.name },
        "image": { "image": spec.image },
        "command": spec.command,
        "args": spec.args,
        "envs": envs,
        "mounts": mounts,
        "log_path": format!("{}.log", spec.name),
    })
}

/// Map `crictl inspect` output to a [`ContainerState`].
fn parse_state(inspect: &Value) -> ContainerState {
    let status = &inspect["status"];
    match status["state"].as_str().unwrap_or_default() {
        "CONTAINER_CREATED" => ContainerState::Created,
        "CONTAINER_RUNNING" => ContainerState::Running,
        "CONTAINER_EXITED" => ContainerState::Exited {
            exit_code: status["exitCode"].as_i64().unwrap_or_default() as i32,
        },
        _ => ContainerState::Unknown,
    }
}

#[async_trait]
impl ContainerRuntime for CrictlRuntime {
    #[instrument(skip(self))]
    async fn run_sandbox(&self, pod_id: &str, name: &str) -> Result<String> {
        let config = self.write_config(&format!("{}.pod.json", pod_id), &pod_config(pod_id, name)).await?;
        let config = config.to_string_lossy();
        let sandbox_id = self.crictl(&["runp", config.as_ref()]).await?;
        // keep the pod config under the sandbox id for later `create` calls
        let by_sandbox = self.pod_config_path(&sandbox_id);
        tokio::fs::copy(Path::new(config.as_ref()), &by_sandbox)
            .await
            .map_err(|e| GuestError::io(&by_sandbox, e))?;
        Ok(sandbox_id)
    }

    #[instrument(skip(self))]
    async fn remove_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.crictl(&["stopp", sandbox_id]).await?;
        self.crictl(&["rmp", sandbox_id]).await?;
        let _ = tokio::fs::remove_file(self.pod_config_path(sandbox_id)).await;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(container = %spec.name))]
    async fn create_container(&self, sandbox_id: &str, spec: &ContainerDesc) -> Result<String> {
        let config = self
            .write_config(&format!("{}.container.json", spec.id), &container_config(spec))
            .await?;
        let config = config.to_string_lossy();
        let pod = self.pod_config_path(sandbox_id);
        let pod = pod.to_string_lossy();
        self.crictl(&["create", sandbox_id, config.as_ref(), pod.as_ref()]).await
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.crictl(&["start", container_id]).await.map(|_| ())
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        let timeout = timeout_secs.to_string();
        self.crictl(&["stop", "--timeout", &timeout, container_id]).await.map(|_| ())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.crictl(&["rm", container_id]).await.map(|_| ())
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        let out = self.crictl(&["inspect", "-o", "json", container_id]).await?;
        let inspect: Value = serde_json::from_str(&out).map_err(|e| GuestError::ContainerRuntime {
            reason: format!("bad inspect output: {}", e),
        })?;
        Ok(parse_state(&inspect))
    }
}
