use super::{require_monitor, CancelToken, GuestTask, POLL_INTERVAL};
use crate::error::{GuestError, Result};
use crate::instance::{GuestRuntimeInstance, KvmGuestInstance};
use crate::monitor::Monitor;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source side of a live migration.
pub struct LiveMigrateTask {
    guest: Arc<KvmGuestInstance>,
    dest_host: String,
    dest_port: u16,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl LiveMigrateTask {
    pub fn new(guest: Arc<KvmGuestInstance>, dest_host: impl Into<String>, dest_port: u16, cancel: CancelToken) -> Self {
        Self { guest, dest_host: dest_host.into(), dest_port, cancel, poll_interval: POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn abort(&self, monitor: &dyn Monitor) -> GuestError {
        info!("Live migration cancelled");
        if let Err(e) = monitor.migrate_cancel().await {
            warn!(error = %e, "migrate_cancel failed");
        }
        GuestError::Cancelled { task: self.name().to_string() }
    }

    async fn drive(&self, monitor: &dyn Monitor) -> Result<Value> {
        self.cancel.check(self.name())?;
        monitor.migrate_set_capabilities(&[("auto-converge", true)]).await?;

        let uri = format!("tcp:{}:{}", self.dest_host, self.dest_port);
        info!(uri = %uri, "Starting live migration");
        monitor.migrate(&uri).await?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.abort(monitor).await);
            }
            let info = monitor.query_migrate().await?;
            if info.is_completed() {
                info!("Live migration completed");
                return Ok(json!({ "status": info.status }));
            }
            if info.is_failed() {
                let reason = info.error_desc.unwrap_or(info.status);
                return Err(GuestError::Monitor { reason: format!("migration failed: {}", reason) });
            }
            if let Some(ram) = &info.ram {
                debug!(transferred = ram.transferred, remaining = ram.remaining, "Migration progress");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }
}

#[async_trait]
impl GuestTask for LiveMigrateTask {
    fn name(&self) -> &'static str {
        "live_migrate"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        self.guest.set_migrate_cancel(Some(self.cancel.clone()));
        let result = self.drive(monitor.as_ref()).await;
        self.guest.set_migrate_cancel(None);
        result
    }
}
