//! Configuration management.

use crate::error::{GuestError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent configuration for the host agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Identifier of this host in the control plane.
    pub host_id: String,
    /// Root directory holding one home directory per guest.
    pub servers_path: PathBuf,
    /// Emulator binary used to run KVM guests.
    pub qemu_binary: PathBuf,
    /// Emulator version assumed when a guest's monitor has not reported one yet.
    pub default_qemu_version: String,
    /// Root of the proc filesystem (overridable for tests).
    pub proc_root: PathBuf,
    /// Root of the PCI sysfs tree.
    pub sysfs_pci_root: PathBuf,
    /// Root of the cpuset cgroup hierarchy.
    pub cgroup_root: PathBuf,
    /// First port probed when allocating a VNC display.
    pub vnc_port_base: u16,
    /// Number of PCIe root ports added to q35/virt guests.
    pub pcie_root_ports: u32,
    /// Enables cpuset pinning and the background balancer.
    pub enable_cpu_pinning: bool,
    pub cpuset_balance_interval_secs: u64,
    /// Default graceful shutdown budget for stop requests.
    pub stop_timeout_secs: u64,
    /// Delay before the first monitor connection attempt after start.
    pub monitor_connect_delay_ms: u64,
    pub monitor_command_timeout_secs: u64,
    /// Concurrency of the general delayed-task worker.
    pub delay_task_workers: usize,
    /// Base URL of the control-plane API.
    pub control_plane_url: String,
    pub control_plane_token: Option<String>,
    /// Unix socket of the deploy agent.
    pub deploy_agent_socket: PathBuf,
    /// Directory holding disk images without an explicit path.
    pub storage_root: PathBuf,
    /// `crictl` binary; pod guests are disabled when unset.
    pub crictl_binary: Option<String>,
    /// Where pod and container configs for the runtime are written.
    pub container_config_dir: PathBuf,
    pub log_level: String,
    /// Prometheus exporter port; `None` disables the listener.
    pub metrics_port: Option<u16>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            servers_path: paths::default_servers_path(),
            qemu_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            default_qemu_version: "4.2.0".to_string(),
            proc_root: PathBuf::from("/proc"),
            sysfs_pci_root: PathBuf::from("/sys/bus/pci/devices"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/cpuset"),
            vnc_port_base: 5900,
            pcie_root_ports: 0,
            enable_cpu_pinning: false,
            cpuset_balance_interval_secs: 120,
            stop_timeout_secs: 30,
            monitor_connect_delay_ms: 1000,
            monitor_command_timeout_secs: 30,
            delay_task_workers: 16,
            control_plane_url: "http://127.0.0.1:8889".to_string(),
            control_plane_token: None,
            deploy_agent_socket: PathBuf::from("/var/run/deploy.sock"),
            storage_root: paths::data_dir().join("disks"),
            crictl_binary: None,
            container_config_dir: paths::data_dir().join("cri"),
            log_level: "info".to_string(),
            metrics_port: Some(crate::ports::PORT_DAEMON_METRICS),
        }
    }
}

impl HostConfig {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load configuration from disk, then apply `GUESTMAN_*` environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| GuestError::InvalidConfig {
                reason: format!("Failed to read config: {}", e),
            })?;
            serde_json::from_str(&content).map_err(|e| GuestError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GuestError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| GuestError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| GuestError::io(path, e))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("GUESTMAN_HOST_ID") {
            self.host_id = v;
        }
        if let Ok(v) = std::env::var("GUESTMAN_SERVERS_PATH") {
            self.servers_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GUESTMAN_QEMU_BINARY") {
            self.qemu_binary = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GUESTMAN_CONTROL_PLANE_URL") {
            self.control_plane_url = v;
        }
        if let Ok(v) = std::env::var("GUESTMAN_CONTROL_PLANE_TOKEN") {
            self.control_plane_token = Some(v);
        }
        if let Ok(v) = std::env::var("GUESTMAN_STORAGE_ROOT") {
            self.storage_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GUESTMAN_CRICTL") {
            self.crictl_binary = Some(v);
        }
        if let Ok(v) = std::env::var("GUESTMAN_METRICS_PORT") {
            self.metrics_port = v.parse().ok();
        }
        if let Ok(v) = std::env::var("GUESTMAN_ENABLE_CPU_PINNING") {
            self.enable_cpu_pinning = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    fn validate(&self) -> Result<()> {
        if self.vnc_port_base == 0 {
            return Err(GuestError::InvalidConfig {
                reason: "vnc_port_base must be non-zero".to_string(),
            });
        }
        if self.delay_task_workers == 0 {
            return Err(GuestError::InvalidConfig {
                reason: "delay_task_workers must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Name of the emulator binary, used to verify guest processes.
    pub fn qemu_binary_name(&self) -> String {
        self.qemu_binary
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "qemu".to_string())
    }
}
