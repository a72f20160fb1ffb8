use crate::error::{GuestError, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation flag shared between a task and whoever may
/// cancel it. Tasks observe it at their checkpoints.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Checkpoint: `Err(Cancelled)` once cancelled.
    pub fn check(&self, task: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(GuestError::Cancelled { task: task.to_string() })
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
