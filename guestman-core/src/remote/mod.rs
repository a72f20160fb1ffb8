//! Collaborators reached outside this process.
//!
//! Every collaborator is a trait so the manager and tasks can be driven
//! against in-memory implementations in tests.

mod container;
mod control_plane;
mod deploy;
mod storage;

pub use container::{ContainerRuntime, ContainerState, CrictlRuntime};
pub use control_plane::{
    ControlPlane, DirtyGuestVerdict, HttpControlPlane, RemoteGuest, StatusReport,
};
pub use deploy::{DeployAgent, DeployRequest, UnixDeployAgent};
pub use storage::{LocalStorageManager, StorageManager};
