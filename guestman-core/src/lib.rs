//! guestman core library
//!
//! Guest lifecycle management for a compute node: emulator processes and
//! their monitor channel, PCI layout, guest tasks reported to the control
//! plane, and pod guests run through a container runtime.

pub mod cgroup;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod instance;
pub mod manager;
pub mod monitor;
pub mod observability;
pub mod paths;
pub mod pci;
pub mod ports;
pub mod qemu;
pub mod qga;
pub mod remote;
pub mod tasks;
pub mod types;
pub mod vfio;
pub mod worker;

// Re-export commonly used items
pub use config::HostConfig;
pub use context::HostContext;
pub use error::{GuestError, Result};
pub use instance::{GuestRuntimeInstance, KvmGuestInstance, PodGuestInstance, StartParams};
pub use manager::{Dispatch, GuestManager};
pub use observability::{init as init_observability, shutdown as shutdown_observability};
pub use tasks::TaskContext;
pub use types::{GuestDesc, GuestStatus, Hypervisor};
