//! Deploy-agent client.
//!
//! The deploy agent edits guest filesystems offline (ssh keys, passwords,
//! custom deploy scripts) and attaches external disk sources. It listens on a
//! local Unix socket and speaks length-prefixed JSON frames: a big-endian
//! `u32` byte count followed by the JSON body.

use crate::error::{GuestError, Result};
use crate::types::{DiskDesc, GuestDesc};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

/// Largest reply frame accepted from the agent.
const MAX_FRAME: u32 = 10 * 1024 * 1024;

/// Filesystem-level deployment of one guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    pub guest_id: String,
    /// Disk image paths, root disk first.
    pub disks: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub deploys: Vec<Value>,
    #[serde(default)]
    pub reset_password: bool,
    #[serde(default)]
    pub is_init: bool,
}

impl DeployRequest {
    pub fn for_desc(desc: &GuestDesc, disks: Vec<PathBuf>) -> Self {
        Self {
            guest_id: desc.uuid.clone(),
            disks,
            hostname: (!desc.name.is_empty()).then(|| desc.name.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait DeployAgent: Send + Sync {
    async fn deploy_guest_fs(&self, request: &DeployRequest) -> Result<Value>;

    async fn connect_external_disk(&self, disk: &DiskDesc, source: &Value) -> Result<Value>;

    async fn disconnect_external_disk(&self, disk: &DiskDesc) -> Result<()>;
}

/// Deploy agent reached over its Unix socket.
#[derive(Debug, Clone)]
pub struct UnixDeployAgent {
    socket: PathBuf,
    timeout: Duration,
}

impl UnixDeployAgent {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into(), timeout: Duration::from_secs(300) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(skip(self, params), fields(socket = %self.socket.display()))]
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        tokio::time::timeout(self.timeout, self.round_trip(method, params))
            .await
            .map_err(|_| GuestError::Timeout { operation: format!("deploy agent {}", method) })?
    }

    async fn round_trip(&self, method: &str, params: Value) -> Result<Value> {
        let err = |e: std::io::Error| GuestError::DeployAgent { reason: e.to_string() };
        let mut stream = UnixStream::connect(&self.socket).await.map_err(err)?;

        let request = serde_json::to_vec(&json!({ "method": method, "params": params }))
            .map_err(|e| GuestError::DeployAgent { reason: format!("encode request: {}", e) })?;
        stream.write_u32(request.len() as u32).await.map_err(err)?;
        stream.write_all(&request).await.map_err(err)?;

        let len = stream.read_u32().await.map_err(err)?;
        if len > MAX_FRAME {
            return Err(GuestError::DeployAgent { reason: "response too large".to_string() });
        }
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.map_err(err)?;

        let reply: Value = serde_json::from_slice(&buf)
            .map_err(|e| GuestError::DeployAgent { reason: format!("decode response: {}", e) })?;
        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(GuestError::DeployAgent {
                reason: error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
            });
        }
        debug!(method, "Deploy agent call finished");
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl DeployAgent for UnixDeployAgent {
    async fn deploy_guest_fs(&self, request: &DeployRequest) -> Result<Value> {
        let params = serde_json::to_value(request).map_err(GuestError::internal)?;
        self.call("deploy_guest_fs", params).await
    }

    async fn connect_external_disk(&self, disk: &DiskDesc, source: &Value) -> Result<Value> {
        self.call("connect_disk", json!({ "disk_id": disk.disk_id, "source": source })).await
    }

    async fn disconnect_external_disk(&self, disk: &DiskDesc) -> Result<()> {
        self.call("disconnect_disk", json!({ "disk_id": disk.disk_id })).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    async fn serve_once(listener: UnixListener, reply: Value) -> Value {
        let (mut stream, _) = listener.accept().await.unwrap();
        let len = stream.read_u32().await.unwrap();
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        let body = serde_json::to_vec(&reply).unwrap();
        stream.write_u32(body.len() as u32).await.unwrap();
        stream.write_all(&body).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_deploy_round_trip() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("deploy.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(serve_once(listener, json!({ "result": { "os": "linux" } })));

        let agent = UnixDeployAgent::new(&socket);
        let mut desc = GuestDesc::new("g1");
        desc.name = "web".into();
        let result = agent
            .deploy_guest_fs(&DeployRequest::for_desc(&desc, vec![PathBuf::from("/d/root")]))
            .await
            .unwrap();
        assert_eq!(result["os"], "linux");

        let request = server.await.unwrap();
        assert_eq!(request["method"], "deploy_guest_fs");
        assert_eq!(request["params"]["hostname"], "web");
    }

    #[tokio::test]
    async fn test_agent_error_propagates() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("deploy.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve_once(listener, json!({ "error": "no root partition" })));

        let err = UnixDeployAgent::new(&socket)
            .disconnect_external_disk(&DiskDesc::new("d1", 0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no root partition"));
    }

    #[tokio::test]
    async fn test_missing_socket_is_deploy_error() {
        let err = UnixDeployAgent::new("/nonexistent/deploy.sock")
            .deploy_guest_fs(&DeployRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GuestError::DeployAgent { .. }));
    }
}
