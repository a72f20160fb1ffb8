//! QMP client over the guest's `monitor.sock`.
//!
//! Requests carry a numeric `id`; a background reader task routes each
//! reply to the oneshot channel registered for that id and fans events out
//! on a broadcast channel. When the socket closes every pending request
//! fails with [`GuestError::MonitorDisconnected`] and the `closed` watch
//! flips to `true`.

use super::{Monitor, MonitorEvent};
use crate::error::{GuestError, Result};
use crate::observability::metrics;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

type Pending = Arc<Mutex<HashMap<u64, (String, oneshot::Sender<Result<Value>>)>>>;

/// Connected QMP session.
pub struct QmpMonitor {
    guest_id: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<MonitorEvent>,
    closed: watch::Receiver<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    command_timeout: Duration,
}

async fn read_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Value> {
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| GuestError::Monitor { reason: format!("read failed: {}", e) })?
            .ok_or(GuestError::MonitorDisconnected)?;
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map_err(|e| GuestError::Monitor { reason: format!("invalid message {:?}: {}", line, e) });
    }
}

fn command_error(command: &str, error: &Value) -> GuestError {
    GuestError::MonitorCommand {
        command: command.to_string(),
        class: error["class"].as_str().unwrap_or("GenericError").to_string(),
        desc: error["desc"].as_str().unwrap_or_default().to_string(),
    }
}

impl QmpMonitor {
    /// Connect, consume the greeting and negotiate capabilities.
    #[instrument(skip(socket), fields(guest_id = %guest_id))]
    pub async fn connect(
        guest_id: &str,
        socket: &Path,
        command_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(socket).await.map_err(|e| GuestError::Monitor {
            reason: format!("connect {}: {}", socket.display(), e),
        })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = read_message(&mut lines).await?;
        if greeting.get("QMP").is_none() {
            return Err(GuestError::Monitor { reason: format!("unexpected greeting: {}", greeting) });
        }
        write_half
            .write_all(b"{\"execute\":\"qmp_capabilities\"}\n")
            .await
            .map_err(|e| GuestError::Monitor { reason: format!("write failed: {}", e) })?;
        loop {
            let msg = read_message(&mut lines).await?;
            if msg.get("return").is_some() {
                break;
            }
            if let Some(err) = msg.get("error") {
                return Err(command_error("qmp_capabilities", err));
            }
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(64);
        let (closed_tx, closed) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            guest_id.to_string(),
            lines,
            pending.clone(),
            connected.clone(),
            events.clone(),
            closed_tx,
        ));

        info!("Monitor connected");
        Ok(Arc::new(Self {
            guest_id: guest_id.to_string(),
            writer: Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            connected,
            events,
            closed,
            reader: Mutex::new(Some(reader)),
            command_timeout,
        }))
    }

    /// Flips to `true` when the emulator closes the socket.
    ///
    /// The sender is dropped without flipping on an explicit [`Monitor::disconnect`].
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    async fn fail_pending(pending: &Pending) {
        for (_, (_, tx)) in pending.lock().await.drain() {
            let _ = tx.send(Err(GuestError::MonitorDisconnected));
        }
    }
}

async fn read_loop(
    guest_id: String,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<MonitorEvent>,
    closed: watch::Sender<bool>,
) {
    loop {
        let msg = match read_message(&mut lines).await {
            Ok(msg) => msg,
            Err(GuestError::MonitorDisconnected) => break,
            Err(GuestError::Monitor { reason }) if reason.starts_with("invalid message") => {
                warn!(guest_id = %guest_id, reason = %reason, "Skipping monitor message");
                continue;
            }
            Err(e) => {
                warn!(guest_id = %guest_id, error = %e, "Monitor read failed");
                break;
            }
        };

        if let Some(event) = msg.get("event").and_then(Value::as_str) {
            debug!(guest_id = %guest_id, event = %event, "Monitor event");
            let _ = events.send(MonitorEvent {
                event: event.to_string(),
                data: msg.get("data").cloned().unwrap_or(Value::Null),
            });
            continue;
        }

        let Some(id) = msg.get("id").and_then(Value::as_u64) else {
            debug!(guest_id = %guest_id, "Dropping reply without id");
            continue;
        };
        let Some((command, tx)) = pending.lock().await.remove(&id) else {
            debug!(guest_id = %guest_id, id, "Reply for unknown or expired request");
            continue;
        };
        let result = match (msg.get("return"), msg.get("error")) {
            (Some(ret), _) => Ok(ret.clone()),
            (None, Some(err)) => Err(command_error(&command, err)),
            (None, None) => Err(GuestError::Monitor { reason: format!("malformed reply: {}", msg) }),
        };
        let _ = tx.send(result);
    }

    connected.store(false, Ordering::SeqCst);
    QmpMonitor::fail_pending(&pending).await;
    metrics::record_monitor_disconnect();
    info!(guest_id = %guest_id, "Monitor disconnected");
    let _ = closed.send(true);
}

#[async_trait]
impl Monitor for QmpMonitor {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(GuestError::MonitorDisconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, (command.to_string(), tx));
        // the reader may have exited between the check and the insert
        if !self.is_connected() {
            self.pending.lock().await.remove(&id);
            return Err(GuestError::MonitorDisconnected);
        }

        let mut request = json!({ "execute": command, "id": id });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }
        let mut line = serde_json::to_vec(&request).map_err(GuestError::internal)?;
        line.push(b'\n');
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&line).await {
                self.pending.lock().await.remove(&id);
                return Err(GuestError::Monitor { reason: format!("write failed: {}", e) });
            }
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => {
                metrics::record_monitor_command(if result.is_ok() { "ok" } else { "error" });
                result
            }
            Ok(Err(_)) => Err(GuestError::MonitorDisconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                metrics::record_monitor_command("timeout");
                warn!(guest_id = %self.guest_id, command = %command, "Monitor command timed out");
                Err(GuestError::Timeout { operation: format!("monitor command {}", command) })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        let _ = self.writer.lock().await.shutdown().await;
        Self::fail_pending(&self.pending).await;
        debug!(guest_id = %self.guest_id, "Monitor closed");
    }
}

/// A connected monitor plus its close notification.
pub struct MonitorConnection {
    pub monitor: Arc<dyn Monitor>,
    pub closed: watch::Receiver<bool>,
}

/// Opens monitor sessions; swapped out in tests.
#[async_trait]
pub trait MonitorConnector: Send + Sync {
    async fn connect(&self, guest_id: &str, socket: &Path) -> Result<MonitorConnection>;
}

/// Connector producing [`QmpMonitor`] sessions.
#[derive(Debug, Clone)]
pub struct QmpConnector {
    pub command_timeout: Duration,
}

#[async_trait]
impl MonitorConnector for QmpConnector {
    async fn connect(&self, guest_id: &str, socket: &Path) -> Result<MonitorConnection> {
        let monitor = QmpMonitor::connect(guest_id, socket, self.command_timeout).await?;
        let closed = monitor.closed();
        Ok(MonitorConnection { monitor, closed })
    }
}
