//! Long-running guest operations.
//!
//! Each operation is a [`GuestTask`]. [`run_task`] drives a task through
//! `Created -> Started -> {Succeeded | Failed | Cancelled}` and reports the
//! outcome exactly once through its [`TaskCompletion`].

mod block;
mod cancel;
mod completion;
mod executor;
mod hotplug;
mod migrate;
mod power;
mod snapshot;
mod sync;

pub use block::{DriveMirrorTask, OnlineResizeDiskTask};
pub use cancel::CancelToken;
pub use completion::{TaskCompletion, TaskContext};
pub use executor::{BoxedJob, TaskExecutor};
pub use hotplug::HotplugCpuMemTask;
pub use migrate::LiveMigrateTask;
pub use power::{ResumeTask, StopTask, SuspendTask};
pub use snapshot::{DeleteSnapshotTask, DiskSnapshotTask, ReloadDiskTask};
pub use sync::{diff_desc, SyncConfigTask, SyncOp};

use crate::error::{GuestError, Result};
use crate::monitor::Monitor;
use crate::observability::metrics;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};

/// Poll period of tasks waiting on the emulator.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Started,
    Succeeded,
    Failed,
    Cancelled,
}

#[async_trait]
pub trait GuestTask: Send {
    fn name(&self) -> &'static str;

    fn guest_id(&self) -> &str;

    async fn execute(&mut self) -> Result<Value>;
}

/// Run `task` to its end and report the outcome. Returns the terminal state.
pub async fn run_task<T: GuestTask>(mut task: T, completion: TaskCompletion) -> TaskState {
    let name = task.name();
    let span = tracing::info_span!(
        "task",
        task = name,
        guest_id = %task.guest_id(),
        task_id = completion.task_id().unwrap_or("-"),
    );
    async move {
        let started = Instant::now();
        info!("Task started");
        let result = task.execute().await;
        let elapsed = started.elapsed().as_secs_f64();

        let state = match &result {
            Ok(_) => TaskState::Succeeded,
            Err(GuestError::Cancelled { .. }) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        let label = match state {
            TaskState::Succeeded => "success",
            TaskState::Cancelled => "cancelled",
            _ => "failure",
        };
        metrics::record_task(name, label, elapsed);
        match &result {
            Ok(_) => info!(elapsed_secs = elapsed, "Task succeeded"),
            Err(e) => warn!(elapsed_secs = elapsed, error = %e, "Task did not succeed"),
        }
        completion.finish(result).await;
        state
    }
    .instrument(span)
    .await
}

/// The guest's monitor, or `InvalidState` when it is not attached.
pub(crate) fn require_monitor(guest_id: &str, monitor: Option<Arc<dyn Monitor>>) -> Result<Arc<dyn Monitor>> {
    match monitor {
        Some(m) if m.is_connected() => Ok(m),
        _ => Err(GuestError::invalid_state(guest_id, "monitor not connected")),
    }
}

/// Poll `query-block-jobs` until no job on `devices` remains, or until each
/// of them has a ready job when `until_ready` is set.
pub(crate) async fn wait_block_jobs(
    monitor: &dyn Monitor,
    devices: &[String],
    until_ready: bool,
    cancel: Option<&CancelToken>,
    task: &str,
) -> Result<()> {
    loop {
        if let Some(cancel) = cancel {
            cancel.check(task)?;
        }
        let jobs = monitor.query_block_jobs().await?;
        let ours: Vec<_> = jobs.iter().filter(|j| devices.contains(&j.device)).collect();
        if until_ready {
            if ours.len() < devices.len() {
                return Err(GuestError::Monitor {
                    reason: "block job ended before becoming ready".to_string(),
                });
            }
            if ours.iter().all(|j| j.ready) {
                return Ok(());
            }
        } else if ours.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
