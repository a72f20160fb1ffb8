//! Guest run states as reported to the control plane.

use serde::{Deserialize, Serialize};

/// Logical guest state derived from process liveness and home-directory files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestStatus {
    NotFound,
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Running with at least one block job in flight.
    BlockStream,
    /// Stopped with a suspend state file on disk.
    Suspend,
}

impl GuestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestStatus::NotFound => "not_found",
            GuestStatus::Stopped => "stopped",
            GuestStatus::Starting => "starting",
            GuestStatus::Running => "running",
            GuestStatus::Stopping => "stopping",
            GuestStatus::BlockStream => "block_stream",
            GuestStatus::Suspend => "suspend",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, GuestStatus::Starting | GuestStatus::Running | GuestStatus::BlockStream)
    }
}

impl std::fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
