//! Emulator monitor channel.
//!
//! [`Monitor`] is the seam between guest orchestration and the emulator's
//! control socket. Implementations only provide raw command execution; the
//! typed helpers are built on top of [`Monitor::execute`].

mod qmp;

pub use qmp::{MonitorConnection, MonitorConnector, QmpConnector, QmpMonitor};

use crate::error::{GuestError, Result};
use crate::qemu::QemuVersion;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Asynchronous event emitted by the emulator.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEvent {
    pub event: String,
    pub data: Value,
}

/// Result of `query-migrate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MigrationInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ram: Option<MigrationRam>,
    #[serde(default, rename = "error-desc")]
    pub error_desc: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MigrationRam {
    #[serde(default)]
    pub transferred: u64,
    #[serde(default)]
    pub remaining: u64,
    #[serde(default)]
    pub total: u64,
}

impl MigrationInfo {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_str(), "failed" | "cancelled")
    }
}

/// One entry of `query-block-jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockJob {
    pub device: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub len: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub ready: bool,
}

/// One entry of `query-hotpluggable-cpus`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HotpluggableCpu {
    #[serde(rename = "type")]
    pub driver: String,
    #[serde(default, rename = "qom-path")]
    pub qom_path: Option<String>,
    #[serde(default)]
    pub props: serde_json::Map<String, Value>,
}

fn decode<T: for<'de> Deserialize<'de>>(command: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| GuestError::Monitor {
        reason: format!("unexpected {} reply: {}", command, e),
    })
}

/// Monitor channel of one running guest.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Execute a QMP command and return its `return` payload.
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);

    /// Run a human monitor (HMP) command line and return its text output.
    async fn human_monitor_command(&self, command_line: &str) -> Result<String> {
        let reply = self
            .execute("human-monitor-command", Some(json!({ "command-line": command_line })))
            .await?;
        let output = reply.as_str().unwrap_or_default().to_string();
        // HMP reports failures as text
        if output.starts_with("Error") || output.contains("Could not") {
            return Err(GuestError::MonitorCommand {
                command: command_line.to_string(),
                class: "HMPError".to_string(),
                desc: output.trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn query_version(&self) -> Result<QemuVersion> {
        let reply = self.execute("query-version", None).await?;
        let q = &reply["qemu"];
        match (q["major"].as_u64(), q["minor"].as_u64(), q["micro"].as_u64()) {
            (Some(major), Some(minor), Some(micro)) => {
                Ok(QemuVersion::new(major as u32, minor as u32, micro as u32))
            }
            _ => Err(GuestError::Monitor { reason: format!("bad query-version reply: {}", reply) }),
        }
    }

    /// Run state such as `running`, `paused`, `inmigrate`, `postmigrate`.
    async fn query_status(&self) -> Result<String> {
        let reply = self.execute("query-status", None).await?;
        Ok(reply["status"].as_str().unwrap_or("unknown").to_string())
    }

    async fn system_powerdown(&self) -> Result<()> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    async fn cont(&self) -> Result<()> {
        self.execute("cont", None).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        self.execute("stop", None).await.map(|_| ())
    }

    async fn quit(&self) -> Result<()> {
        self.execute("quit", None).await.map(|_| ())
    }

    async fn migrate(&self, uri: &str) -> Result<()> {
        self.execute("migrate", Some(json!({ "uri": uri }))).await.map(|_| ())
    }

    async fn migrate_cancel(&self) -> Result<()> {
        self.execute("migrate_cancel", None).await.map(|_| ())
    }

    async fn query_migrate(&self) -> Result<MigrationInfo> {
        let reply = self.execute("query-migrate", None).await?;
        decode("query-migrate", reply)
    }

    async fn migrate_set_capabilities(&self, capabilities: &[(&str, bool)]) -> Result<()> {
        let caps: Vec<Value> = capabilities
            .iter()
            .map(|(name, state)| json!({ "capability": name, "state": state }))
            .collect();
        self.execute("migrate-set-capabilities", Some(json!({ "capabilities": caps })))
            .await
            .map(|_| ())
    }

    async fn migrate_set_parameters(&self, parameters: Value) -> Result<()> {
        self.execute("migrate-set-parameters", Some(parameters)).await.map(|_| ())
    }

    async fn nbd_server_start(&self, host: &str, port: u16) -> Result<()> {
        let addr = json!({ "type": "inet", "data": { "host": host, "port": port.to_string() } });
        self.execute("nbd-server-start", Some(json!({ "addr": addr }))).await.map(|_| ())
    }

    async fn nbd_server_add(&self, device: &str, writable: bool) -> Result<()> {
        self.execute("nbd-server-add", Some(json!({ "device": device, "writable": writable })))
            .await
            .map(|_| ())
    }

    async fn drive_mirror(&self, device: &str, target: &str, format: &str, sync: &str) -> Result<()> {
        let args = json!({
            "device": device,
            "target": target,
            "format": format,
            "sync": sync,
            "mode": "existing",
        });
        self.execute("drive-mirror", Some(args)).await.map(|_| ())
    }

    async fn block_stream(&self, device: &str) -> Result<()> {
        self.execute("block-stream", Some(json!({ "device": device }))).await.map(|_| ())
    }

    async fn query_block_jobs(&self) -> Result<Vec<BlockJob>> {
        let reply = self.execute("query-block-jobs", None).await?;
        decode("query-block-jobs", reply)
    }

    async fn block_job_cancel(&self, device: &str) -> Result<()> {
        self.execute("block-job-cancel", Some(json!({ "device": device }))).await.map(|_| ())
    }

    async fn block_resize(&self, device: &str, size_bytes: u64) -> Result<()> {
        self.execute("block_resize", Some(json!({ "device": device, "size": size_bytes })))
            .await
            .map(|_| ())
    }

    async fn set_vnc_password(&self, password: &str) -> Result<()> {
        self.execute("change-vnc-password", Some(json!({ "password": password })))
            .await
            .map(|_| ())
    }

    async fn device_add(&self, arguments: Value) -> Result<()> {
        self.execute("device_add", Some(arguments)).await.map(|_| ())
    }

    async fn device_del(&self, id: &str) -> Result<()> {
        self.execute("device_del", Some(json!({ "id": id }))).await.map(|_| ())
    }

    async fn netdev_add(&self, arguments: Value) -> Result<()> {
        self.execute("netdev_add", Some(arguments)).await.map(|_| ())
    }

    async fn netdev_del(&self, id: &str) -> Result<()> {
        self.execute("netdev_del", Some(json!({ "id": id }))).await.map(|_| ())
    }

    async fn object_add(&self, qom_type: &str, id: &str, props: Value) -> Result<()> {
        let mut args = json!({ "qom-type": qom_type, "id": id });
        if let (Some(obj), Value::Object(extra)) = (args.as_object_mut(), props) {
            obj.extend(extra);
        }
        self.execute("object-add", Some(args)).await.map(|_| ())
    }

    async fn query_hotpluggable_cpus(&self) -> Result<Vec<HotpluggableCpu>> {
        let reply = self.execute("query-hotpluggable-cpus", None).await?;
        decode("query-hotpluggable-cpus", reply)
    }

    /// Point `drive` at a new image file without detaching the device.
    async fn reload_disk_blkdev(&self, drive: &str, path: &std::path::Path) -> Result<()> {
        let line = format!("reload_disk_snapshot_blkdev -n {} {}", drive, path.display());
        self.human_monitor_command(&line).await.map(|_| ())
    }
}
