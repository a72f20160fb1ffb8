//! Host-wide collaborators shared by the manager, guests and tasks.

use crate::cgroup::CpusetCgroup;
use crate::config::HostConfig;
use crate::monitor::{MonitorConnector, QmpConnector};
use crate::ports::{
    PortAllocator, MIGRATE_PORT_BASE, MIGRATE_PORT_SPAN, NBD_PORT_BASE, NBD_PORT_SPAN, VNC_PORT_SPAN,
};
use crate::qemu::QemuVersion;
use crate::qga::{AgentConnector, UnixAgentConnector};
use crate::remote::{ContainerRuntime, ControlPlane, DeployAgent, StorageManager};
use crate::worker::{WorkerPool, DELAY_TASK_WORKER, GUEST_START_WORKER};
use std::sync::Arc;
use std::time::Duration;

pub struct HostContext {
    pub config: HostConfig,
    pub control_plane: Arc<dyn ControlPlane>,
    pub storage: Arc<dyn StorageManager>,
    pub deploy_agent: Arc<dyn DeployAgent>,
    pub container_runtime: Option<Arc<dyn ContainerRuntime>>,
    pub monitor_connector: Arc<dyn MonitorConnector>,
    pub agent_connector: Arc<dyn AgentConnector>,
    pub start_worker: WorkerPool,
    pub delay_worker: WorkerPool,
    pub vnc_ports: PortAllocator,
    pub migrate_ports: PortAllocator,
    pub nbd_ports: PortAllocator,
    pub cgroup: CpusetCgroup,
}

impl HostContext {
    pub fn new(
        config: HostConfig,
        control_plane: Arc<dyn ControlPlane>,
        storage: Arc<dyn StorageManager>,
        deploy_agent: Arc<dyn DeployAgent>,
    ) -> Self {
        let command_timeout = Duration::from_secs(config.monitor_command_timeout_secs);
        Self {
            control_plane,
            storage,
            deploy_agent,
            container_runtime: None,
            monitor_connector: Arc::new(QmpConnector { command_timeout }),
            agent_connector: Arc::new(UnixAgentConnector),
            start_worker: WorkerPool::new(GUEST_START_WORKER, 1),
            delay_worker: WorkerPool::new(DELAY_TASK_WORKER, config.delay_task_workers),
            vnc_ports: PortAllocator::new("vnc", config.vnc_port_base, VNC_PORT_SPAN),
            migrate_ports: PortAllocator::new("migrate", MIGRATE_PORT_BASE, MIGRATE_PORT_SPAN),
            nbd_ports: PortAllocator::new("nbd", NBD_PORT_BASE, NBD_PORT_SPAN),
            cgroup: CpusetCgroup::new(config.cgroup_root.clone()),
            config,
        }
    }

    pub fn with_container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    pub fn with_monitor_connector(mut self, connector: Arc<dyn MonitorConnector>) -> Self {
        self.monitor_connector = connector;
        self
    }

    pub fn with_agent_connector(mut self, connector: Arc<dyn AgentConnector>) -> Self {
        self.agent_connector = connector;
        self
    }

    /// Use allocators that skip the host bind probe.
    pub fn without_port_probe(mut self) -> Self {
        self.vnc_ports = PortAllocator::without_probe("vnc", self.config.vnc_port_base, VNC_PORT_SPAN);
        self.migrate_ports = PortAllocator::without_probe("migrate", MIGRATE_PORT_BASE, MIGRATE_PORT_SPAN);
        self.nbd_ports = PortAllocator::without_probe("nbd", NBD_PORT_BASE, NBD_PORT_SPAN);
        self
    }

    /// Emulator version assumed before a monitor has reported one.
    pub fn default_qemu_version(&self) -> QemuVersion {
        self.config.default_qemu_version.parse().unwrap_or(QemuVersion::LIVE_SNAPSHOT)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.config.stop_timeout_secs)
    }
}
