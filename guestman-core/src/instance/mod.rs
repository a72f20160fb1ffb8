//! Guest runtime instances.
//!
//! The manager holds every guest as an `Arc<dyn GuestRuntimeInstance>`.
//! [`KvmGuestInstance`] runs an emulator process; [`PodGuestInstance`] runs
//! containers through the CRI runtime.

mod kvm;
mod pod;

pub use kvm::{GuestRole, KvmGuestInstance, StartOutcome, MAX_TRY};
pub use pod::{ExpectedStatus, PodGuestInstance};

use crate::error::Result;
use crate::paths::GuestPaths;
use crate::tasks::TaskContext;
use crate::types::{GuestDesc, GuestStatus, Hypervisor};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Per-start options not stored in the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartParams {
    /// VNC/spice password applied once the monitor is attached.
    pub vnc_password: Option<String>,
    /// What the emulator does once attached. Applies to this start only.
    pub role: GuestRole,
}

#[async_trait]
pub trait GuestRuntimeInstance: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn hypervisor(&self) -> Hypervisor;

    fn paths(&self) -> &GuestPaths;

    /// Read `source-desc` and `desc` from the home directory.
    fn load_desc(&self) -> Result<()>;

    fn source_desc(&self) -> Option<GuestDesc>;

    fn desc(&self) -> Option<GuestDesc>;

    /// Persist a requested descriptor. The live descriptor follows only
    /// while the guest is not running.
    fn save_source_desc(&self, desc: GuestDesc) -> Result<()>;

    fn save_live_desc(&self, desc: GuestDesc) -> Result<()>;

    fn is_running(&self) -> bool;

    fn is_stopped(&self) -> bool {
        !self.is_running()
    }

    fn is_suspend(&self) -> bool;

    fn status(&self) -> GuestStatus;

    fn is_dirty(&self) -> bool;

    fn set_dirty(&self, dirty: bool);

    /// Begin starting the guest. Returns as soon as the start is queued; the
    /// outcome is reported through `ctx`.
    async fn start(self: Arc<Self>, ctx: TaskContext, params: StartParams) -> Result<Value>;

    /// Dispatch a stop; the outcome is reported through `ctx`.
    async fn stop(self: Arc<Self>, ctx: TaskContext, timeout: Duration) -> Result<()>;

    /// Kill whatever runs and remove the home directory.
    async fn destroy(&self) -> Result<()>;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Load a descriptor file if present.
pub(crate) fn load_optional(path: &std::path::Path) -> Result<Option<GuestDesc>> {
    if path.exists() {
        GuestDesc::load(path).map(Some)
    } else {
        Ok(None)
    }
}
