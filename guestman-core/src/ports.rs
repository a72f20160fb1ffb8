//! Host port ranges and allocation.
//!
//! VNC/spice displays, live-migration listeners and NBD exports each take a
//! host TCP port. [`PortAllocator`] hands them out from a fixed range and
//! tracks which guest owns each one.

use crate::error::{GuestError, Result};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

/// Number of VNC ports probed above the configured base.
pub const VNC_PORT_SPAN: u16 = 1000;

/// Live-migration listener range start.
pub const MIGRATE_PORT_BASE: u16 = 4396;
pub const MIGRATE_PORT_SPAN: u16 = 500;

/// NBD export range start (block replication and storage migration).
pub const NBD_PORT_BASE: u16 = 7396;
pub const NBD_PORT_SPAN: u16 = 500;

/// Default Prometheus `/metrics` port of the daemon.
pub const PORT_DAEMON_METRICS: u16 = 41002;

/// Allocates host ports from a range, one owner per port.
#[derive(Debug)]
pub struct PortAllocator {
    name: &'static str,
    base: u16,
    span: u16,
    /// port -> owning guest id
    allocated: Mutex<HashMap<u16, String>>,
    probe_host: bool,
}

impl PortAllocator {
    pub fn new(name: &'static str, base: u16, span: u16) -> Self {
        info!(name, base, span, "Creating port allocator");
        Self { name, base, span, allocated: Mutex::new(HashMap::new()), probe_host: true }
    }

    /// Allocator that does not check whether the port is bindable on the host.
    pub fn without_probe(name: &'static str, base: u16, span: u16) -> Self {
        Self { probe_host: false, ..Self::new(name, base, span) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, String>> {
        self.allocated.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Reserve the first free port for `owner`.
    #[instrument(skip(self), fields(allocator = self.name))]
    pub fn allocate(&self, owner: &str) -> Result<u16> {
        let mut allocated = self.lock();
        for offset in 0..self.span {
            let port = self.base.saturating_add(offset);
            if allocated.contains_key(&port) {
                continue;
            }
            if self.probe_host && TcpListener::bind(("0.0.0.0", port)).is_err() {
                debug!(port, "Port busy on host");
                continue;
            }
            allocated.insert(port, owner.to_string());
            metrics::gauge!("guestman_ports_allocated", "allocator" => self.name)
                .set(allocated.len() as f64);
            info!(port, owner = %owner, "Allocated port");
            return Ok(port);
        }
        warn!(owner = %owner, "Port range exhausted");
        Err(GuestError::Internal(format!("no free {} port", self.name)))
    }

    /// Record a port already in use by a guest (e.g. read back at bootstrap).
    pub fn mark(&self, port: u16, owner: &str) {
        self.lock().insert(port, owner.to_string());
    }

    /// Release one port.
    pub fn release(&self, port: u16) -> bool {
        let mut allocated = self.lock();
        let released = allocated.remove(&port).is_some();
        if released {
            metrics::gauge!("guestman_ports_allocated", "allocator" => self.name)
                .set(allocated.len() as f64);
        }
        released
    }

    /// Release every port held by `owner`.
    pub fn release_owner(&self, owner: &str) {
        self.lock().retain(|_, o| o != owner);
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        self.lock().get(&port).cloned()
    }

    pub fn allocated_count(&self) -> usize {
        self.lock().len()
    }
}
