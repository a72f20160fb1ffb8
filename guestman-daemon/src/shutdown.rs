//! Signal handling for guestmand.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Background loops owned by the daemon, aborted on shutdown.
#[derive(Default)]
pub struct ShutdownManager {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, name: &'static str, handle: Option<JoinHandle<()>>) {
        if let Some(handle) = handle {
            self.handles.push((name, handle));
        }
    }

    /// Abort every tracked loop. Guests keep running; their emulators are
    /// reattached by the next bootstrap.
    pub async fn shutdown(self, grace: Duration) {
        info!(loops = self.handles.len(), "Stopping background loops");
        for (name, handle) in self.handles {
            handle.abort();
            match tokio::time::timeout(grace, handle).await {
                Ok(Err(e)) if e.is_panic() => warn!(loop_name = name, error = %e, "Loop panicked"),
                Err(_) => warn!(loop_name = name, "Loop did not stop in time"),
                _ => {}
            }
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received SIGINT");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}
