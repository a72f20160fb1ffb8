//! Exactly-once task outcome reporting.

use crate::error::Result;
use crate::remote::ControlPlane;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Request-scoped context carried into dispatched work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskContext {
    /// Control-plane task waiting on the outcome, if any.
    pub task_id: Option<String>,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self { task_id: Some(task_id.into()) }
    }

    /// Context of work nobody upstream is waiting on.
    pub fn detached() -> Self {
        Self::default()
    }
}

/// Handle that must report one outcome for a task.
///
/// `complete`/`fail`/`finish` consume the handle. A handle dropped without
/// reporting sends task-failed on its own so the control plane never waits
/// forever.
pub struct TaskCompletion {
    ctx: TaskContext,
    control_plane: Arc<dyn ControlPlane>,
    task: &'static str,
    reported: bool,
}

impl TaskCompletion {
    pub fn new(ctx: TaskContext, control_plane: Arc<dyn ControlPlane>, task: &'static str) -> Self {
        Self { ctx, control_plane, task, reported: false }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.ctx.task_id.as_deref()
    }

    pub fn task(&self) -> &'static str {
        self.task
    }

    pub async fn complete(mut self, data: Value) {
        self.reported = true;
        let Some(task_id) = self.ctx.task_id.take() else {
            debug!(task = self.task, "Task finished without upstream task id");
            return;
        };
        if let Err(e) = self.control_plane.task_complete(&task_id, data).await {
            error!(task = self.task, task_id = %task_id, error = %e, "Failed to report task completion");
        }
    }

    pub async fn fail(mut self, reason: impl Into<String>) {
        self.reported = true;
        let reason = reason.into();
        let Some(task_id) = self.ctx.task_id.take() else {
            warn!(task = self.task, reason = %reason, "Task failed without upstream task id");
            return;
        };
        if let Err(e) = self.control_plane.task_failed(&task_id, &reason).await {
            error!(task = self.task, task_id = %task_id, error = %e, "Failed to report task failure");
        }
    }

    pub async fn finish(self, result: Result<Value>) {
        match result {
            Ok(data) => self.complete(data).await,
            Err(e) => self.fail(e.to_string()).await,
        }
    }
}

impl Drop for TaskCompletion {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        let Some(task_id) = self.ctx.task_id.take() else {
            return;
        };
        let task = self.task;
        warn!(task, task_id = %task_id, "Task dropped without reporting, sending failure");
        let control_plane = self.control_plane.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let reason = format!("{} task ended without a result", task);
                    if let Err(e) = control_plane.task_failed(&task_id, &reason).await {
                        error!(task, task_id = %task_id, error = %e, "Failed to report dropped task");
                    }
                });
            }
            Err(_) => error!(task, task_id = %task_id, "No runtime to report dropped task"),
        }
    }
}
