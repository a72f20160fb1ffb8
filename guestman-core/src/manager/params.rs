//! Typed request parameters of manager operations.

use crate::types::GuestDesc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Filesystem deployment options shared by create and deploy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployParams {
    /// Replaces the stored descriptor when present.
    #[serde(default)]
    pub desc: Option<GuestDesc>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// Files to write into the guest filesystem.
    #[serde(default)]
    pub deploys: Vec<Value>,
    #[serde(default)]
    pub reset_password: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    pub desc: GuestDesc,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub deploys: Vec<Value>,
}

/// Destination-side preparation of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestPrepareMigrateParams {
    pub desc: GuestDesc,
    /// disk id -> backing reference reported by the source host
    #[serde(default)]
    pub disks_back: BTreeMap<String, Option<String>>,
    /// Base URI the source host serves disk snapshots from.
    #[serde(default)]
    pub snapshots_uri: Option<String>,
    /// disk id -> snapshot ids to fetch, oldest first
    #[serde(default)]
    pub disk_snapshots: BTreeMap<String, Vec<String>>,
    /// Start the emulator waiting for an incoming migration stream.
    #[serde(default)]
    pub live_migrate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMigrateParams {
    pub dest_host: String,
    pub dest_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParams {
    pub disk_id: String,
    pub snapshot_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSnapshotParams {
    pub disk_id: String,
    pub snapshot_id: String,
    /// Merge the snapshot into the live image before removing it.
    #[serde(default)]
    pub flatten: bool,
}

/// Outcome of an operation that either finishes inline or runs as a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Finished; nothing will be reported through the task context.
    Done(Value),
    /// A task was queued and reports through the task context.
    Queued,
}
