//! Power-state tasks: stop, resume, suspend.

use super::{require_monitor, GuestTask, POLL_INTERVAL};
use crate::error::{GuestError, Result};
use crate::instance::{GuestRole, GuestRuntimeInstance, KvmGuestInstance};
use crate::observability::metrics;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Longest a resume waits for an incoming state to load.
const RESUME_TIMEOUT: Duration = Duration::from_secs(600);

/// Longest a suspend waits for the state file to be written.
const SUSPEND_TIMEOUT: Duration = Duration::from_secs(1800);

/// Graceful powerdown followed by a forced kill once `timeout` passes.
///
/// Always completes: the forced path is a normal outcome.
pub struct StopTask {
    guest: Arc<KvmGuestInstance>,
    timeout: Duration,
    poll_interval: Duration,
}

impl StopTask {
    pub fn new(guest: Arc<KvmGuestInstance>, timeout: Duration) -> Self {
        Self { guest, timeout, poll_interval: POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl GuestTask for StopTask {
    fn name(&self) -> &'static str {
        "stop"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let guest = &self.guest;
        guest.set_stopping(true);
        // a stopped guest never resumes as a migration or replication target
        guest.set_role(GuestRole::Plain);

        if !guest.is_running() {
            guest.force_stop().await?;
            return Ok(json!({ "mode": "not_running" }));
        }

        match guest.monitor().filter(|m| m.is_connected()) {
            Some(monitor) => {
                if let Err(e) = monitor.system_powerdown().await {
                    warn!(error = %e, "system_powerdown failed, waiting for timeout");
                }
            }
            None => info!("Monitor unreachable, skipping graceful powerdown"),
        }

        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            if !guest.is_running() {
                info!("Guest powered off");
                metrics::record_guest_stop("graceful");
                // the disconnect handler cleans up when a monitor was attached
                if guest.monitor().is_none() {
                    guest.force_stop().await?;
                }
                return Ok(json!({ "mode": "graceful" }));
            }
        }

        warn!(timeout_secs = self.timeout.as_secs(), "Guest did not power off in time, killing");
        guest.force_stop().await?;
        metrics::record_guest_stop("forced");
        Ok(json!({ "mode": "forced" }))
    }
}

/// Bring a freshly attached emulator into the `running` state.
pub struct ResumeTask {
    guest: Arc<KvmGuestInstance>,
    timeout: Duration,
}

impl ResumeTask {
    pub fn new(guest: Arc<KvmGuestInstance>) -> Self {
        Self { guest, timeout: RESUME_TIMEOUT }
    }
}

#[async_trait]
impl GuestTask for ResumeTask {
    fn name(&self) -> &'static str {
        "resume"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let status = monitor.query_status().await?;
            match status.as_str() {
                "running" => break,
                "paused" | "prelaunch" | "postmigrate" | "suspended" | "restore-vm" => {
                    monitor.cont().await?;
                }
                "inmigrate" | "finish-migrate" => {}
                other => {
                    return Err(GuestError::invalid_state(self.guest.id(), format!("emulator is {}", other)));
                }
            }
            if Instant::now() >= deadline {
                return Err(GuestError::Timeout { operation: format!("resume {}", self.guest.id()) });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        for file in self.guest.paths().state_files() {
            if let Err(e) = tokio::fs::remove_file(&file).await {
                warn!(path = %file.display(), error = %e, "Failed to remove state file");
            }
        }
        Ok(json!({ "vnc_port": self.guest.vnc_port(), "is_running": true }))
    }
}

/// Save RAM to a state file and stop the emulator.
pub struct SuspendTask {
    guest: Arc<KvmGuestInstance>,
}

impl SuspendTask {
    pub fn new(guest: Arc<KvmGuestInstance>) -> Self {
        Self { guest }
    }
}

#[async_trait]
impl GuestTask for SuspendTask {
    fn name(&self) -> &'static str {
        "suspend"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let state_file = self.guest.paths().state_file(chrono::Utc::now().timestamp());

        monitor.stop().await?;
        monitor.migrate(&format!("exec:cat > {}", state_file.display())).await?;

        let deadline = Instant::now() + SUSPEND_TIMEOUT;
        loop {
            let info = monitor.query_migrate().await?;
            if info.is_completed() {
                break;
            }
            if info.is_failed() || Instant::now() >= deadline {
                let reason = info.error_desc.unwrap_or_else(|| format!("migration {}", info.status));
                let _ = tokio::fs::remove_file(&state_file).await;
                if let Err(e) = monitor.cont().await {
                    warn!(error = %e, "Failed to resume after aborted suspend");
                }
                return Err(GuestError::Monitor { reason: format!("suspend failed: {}", reason) });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.guest.set_stopping(true);
        if let Err(e) = monitor.quit().await {
            // quit usually tears the channel down before replying
            info!(error = %e, "quit did not reply");
        }
        self.guest.force_stop().await?;
        info!(state_file = %state_file.display(), "Guest suspended");
        Ok(json!({ "state_file": state_file }))
    }
}
