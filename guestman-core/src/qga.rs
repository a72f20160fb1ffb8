//! Guest agent (QGA) bridge.
//!
//! Every guest owns one [`GuestAgent`]. Commands are serialized by a
//! per-guest lock that is acquired with a timeout, then executed in a
//! spawned task whose result is raced against a second timeout, so a hung
//! agent never blocks callers for more than the two budgets combined.

use crate::error::{GuestError, Result};
use crate::observability::metrics;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, instrument, warn};

/// Budget for acquiring the per-guest agent lock.
pub const QGA_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for one agent command once the lock is held.
pub const QGA_EXEC_TIMEOUT: Duration = Duration::from_secs(5);

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Raw access to the agent channel of one guest.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value>;
}

/// Creates the transport for a guest's agent socket.
pub trait AgentConnector: Send + Sync {
    fn transport(&self, guest_id: &str, socket: &Path) -> Arc<dyn AgentTransport>;
}

/// Agent transport over the virtio-serial chardev socket.
///
/// A fresh connection is used for each command, preceded by `guest-sync`
/// so stale replies left on the channel are discarded.
pub struct UnixAgentTransport {
    socket: PathBuf,
    sync_id: AtomicU64,
}

impl UnixAgentTransport {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into(), sync_id: AtomicU64::new(u64::from(std::process::id()) << 16) }
    }
}

#[async_trait]
impl AgentTransport for UnixAgentTransport {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| GuestError::Agent {
            reason: format!("connect {}: {}", self.socket.display(), e),
        })?;
        let (r, mut w) = stream.into_split();
        let mut lines = BufReader::new(r).lines();
        let io_err = |e: std::io::Error| GuestError::Agent { reason: e.to_string() };

        let sync_id = self.sync_id.fetch_add(1, Ordering::SeqCst);
        let sync = json!({ "execute": "guest-sync", "arguments": { "id": sync_id } });
        w.write_all(format!("{}\n", sync).as_bytes()).await.map_err(io_err)?;
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(io_err)?
                .ok_or_else(|| GuestError::Agent { reason: "agent closed channel".to_string() })?;
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if msg["return"].as_u64() == Some(sync_id) {
                break;
            }
        }

        let mut request = json!({ "execute": command });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }
        w.write_all(format!("{}\n", request).as_bytes()).await.map_err(io_err)?;

        // commands such as guest-shutdown never answer
        loop {
            let Some(line) = lines.next_line().await.map_err(io_err)? else {
                return Ok(Value::Null);
            };
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if let Some(ret) = msg.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = msg.get("error") {
                return Err(GuestError::Agent {
                    reason: format!(
                        "{}: {}",
                        command,
                        err["desc"].as_str().unwrap_or("unknown agent error")
                    ),
                });
            }
        }
    }
}

/// Default connector creating [`UnixAgentTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct UnixAgentConnector;

impl AgentConnector for UnixAgentConnector {
    fn transport(&self, _guest_id: &str, socket: &Path) -> Arc<dyn AgentTransport> {
        Arc::new(UnixAgentTransport::new(socket))
    }
}

/// Per-guest serialized agent access with lock and execution timeouts.
pub struct GuestAgent {
    guest_id: String,
    transport: Arc<dyn AgentTransport>,
    lock: Mutex<()>,
    lock_timeout: Duration,
    exec_timeout: Duration,
}

impl GuestAgent {
    pub fn new(guest_id: impl Into<String>, transport: Arc<dyn AgentTransport>) -> Self {
        Self::with_timeouts(guest_id, transport, QGA_LOCK_TIMEOUT, QGA_EXEC_TIMEOUT)
    }

    pub fn with_timeouts(
        guest_id: impl Into<String>,
        transport: Arc<dyn AgentTransport>,
        lock_timeout: Duration,
        exec_timeout: Duration,
    ) -> Self {
        Self { guest_id: guest_id.into(), transport, lock: Mutex::new(()), lock_timeout, exec_timeout }
    }

    /// Run one agent command under the per-guest lock.
    #[instrument(skip(self, arguments), fields(guest_id = %self.guest_id))]
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let _guard = match tokio::time::timeout(self.lock_timeout, self.lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                metrics::record_qga_command("busy");
                warn!("Guest agent lock not acquired in time");
                return Err(GuestError::AgentBusy { guest_id: self.guest_id.clone() });
            }
        };

        let (tx, rx) = oneshot::channel();
        let transport = self.transport.clone();
        let cmd = command.to_string();
        tokio::spawn(async move {
            let _ = tx.send(transport.execute(&cmd, arguments).await);
        });

        let result = match tokio::time::timeout(self.exec_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GuestError::Agent { reason: format!("{} aborted", command) }),
            Err(_) => Err(GuestError::Timeout { operation: format!("guest agent {}", command) }),
        };
        metrics::record_qga_command(if result.is_ok() { "ok" } else { "error" });
        debug!(command = %command, ok = result.is_ok(), "Guest agent command finished");
        result
    }

    pub async fn ping(&self) -> Result<()> {
        self.execute("guest-ping", None).await.map(|_| ())
    }

    pub async fn guest_info(&self) -> Result<Value> {
        self.execute("guest-get-osinfo", None).await
    }

    pub async fn network_interfaces(&self) -> Result<Value> {
        self.execute("guest-network-get-interfaces", None).await
    }

    /// Set an account password; the agent expects it base64 encoded.
    pub async fn set_user_password(&self, username: &str, password: &str, crypted: bool) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(password);
        self.execute(
            "guest-set-user-password",
            Some(json!({ "username": username, "password": encoded, "crypted": crypted })),
        )
        .await
        .map(|_| ())
    }

    /// Start a program in the guest and wait for it to exit.
    ///
    /// Each poll is its own agent command, so the wait is bounded by
    /// `wait_timeout` rather than the per-command budget.
    pub async fn exec_command(
        &self,
        path: &str,
        args: &[String],
        wait_timeout: Duration,
    ) -> Result<GuestExecResult> {
        let started = self
            .execute(
                "guest-exec",
                Some(json!({ "path": path, "arg": args, "capture-output": true })),
            )
            .await?;
        let pid = started["pid"].as_i64().ok_or_else(|| GuestError::Agent {
            reason: format!("guest-exec returned no pid: {}", started),
        })?;

        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            let status = self.execute("guest-exec-status", Some(json!({ "pid": pid }))).await?;
            if status["exited"].as_bool() == Some(true) {
                return Ok(GuestExecResult::from_status(&status));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GuestError::Timeout { operation: format!("guest exec {}", path) });
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }
}

/// Outcome of a program run through the agent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GuestExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl GuestExecResult {
    fn from_status(status: &Value) -> Self {
        let decode = |field: &str| {
            status[field]
                .as_str()
                .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
                .map(|b| String::from_utf8_lossy(&b).to_string())
                .unwrap_or_default()
        };
        Self {
            exit_code: status["exitcode"].as_i64().unwrap_or(-1),
            stdout: decode("out-data"),
            stderr: decode("err-data"),
        }
    }
}
