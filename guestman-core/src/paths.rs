//! Centralized path configuration for guestman.
//!
//! All guest directory paths go through this module so the daemon, tasks and
//! tests agree on the on-disk layout of a guest's home directory.

use std::path::{Path, PathBuf};

/// Live descriptor (reflects running hardware layout).
pub const DESC_FILE: &str = "desc";
/// Descriptor as last requested by the control plane.
pub const SOURCE_DESC_FILE: &str = "source-desc";
pub const PID_FILE: &str = "pid";
pub const VNC_FILE: &str = "vnc";
pub const START_SCRIPT: &str = "startvm";
pub const STOP_SCRIPT: &str = "stopvm";
pub const MONITOR_SOCKET: &str = "monitor.sock";
pub const QGA_SOCKET: &str = "qga.sock";
pub const LOG_FILE: &str = "log";
/// Prefix of suspend state blobs.
pub const STATE_FILE_PREFIX: &str = "STATEFILE";
/// Pod variant: desc container id -> runtime container id.
pub const CONTAINERS_FILE: &str = "containers";
/// Pod variant: intended container status.
pub const EXPECTED_STATUS_FILE: &str = "expected_status.json";

/// Get the guestman data directory.
///
/// Resolution order:
/// 1. `GUESTMAN_DATA_DIR` environment variable
/// 2. `/opt/cloud/workspace` if it exists (system install)
/// 3. `~/.guestman` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GUESTMAN_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/opt/cloud/workspace");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".guestman")).unwrap_or(system_dir)
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GUESTMAN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    data_dir().join("etc")
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("guestman.json")
}

/// Default root under which one directory per guest is kept.
pub fn default_servers_path() -> PathBuf {
    data_dir().join("servers")
}

/// Layout of one guest's home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPaths {
    home: PathBuf,
}

impl GuestPaths {
    pub fn new(servers_path: &Path, guest_id: &str) -> Self {
        Self { home: servers_path.join(guest_id) }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn desc(&self) -> PathBuf {
        self.home.join(DESC_FILE)
    }

    pub fn source_desc(&self) -> PathBuf {
        self.home.join(SOURCE_DESC_FILE)
    }

    pub fn pid(&self) -> PathBuf {
        self.home.join(PID_FILE)
    }

    pub fn vnc(&self) -> PathBuf {
        self.home.join(VNC_FILE)
    }

    pub fn start_script(&self) -> PathBuf {
        self.home.join(START_SCRIPT)
    }

    pub fn stop_script(&self) -> PathBuf {
        self.home.join(STOP_SCRIPT)
    }

    pub fn monitor_socket(&self) -> PathBuf {
        self.home.join(MONITOR_SOCKET)
    }

    pub fn qga_socket(&self) -> PathBuf {
        self.home.join(QGA_SOCKET)
    }

    pub fn log(&self) -> PathBuf {
        self.home.join(LOG_FILE)
    }

    pub fn containers(&self) -> PathBuf {
        self.home.join(CONTAINERS_FILE)
    }

    pub fn expected_status(&self) -> PathBuf {
        self.home.join(EXPECTED_STATUS_FILE)
    }

    /// Path of a new suspend state file.
    pub fn state_file(&self, timestamp: i64) -> PathBuf {
        self.home.join(format!("{}_{}", STATE_FILE_PREFIX, timestamp))
    }

    /// All suspend state files currently present, sorted by name.
    pub fn state_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.home)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_string_lossy().starts_with(STATE_FILE_PREFIX))
                    .map(|e| e.path())
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Per-NIC interface up/down helper scripts.
    pub fn ifup_script(&self, nic_index: usize) -> PathBuf {
        self.home.join(format!("if-up-{}.sh", nic_index))
    }

    pub fn ifdown_script(&self, nic_index: usize) -> PathBuf {
        self.home.join(format!("if-down-{}.sh", nic_index))
    }
}
