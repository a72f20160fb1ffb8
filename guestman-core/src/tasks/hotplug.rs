use super::{require_monitor, GuestTask};
use crate::error::{GuestError, Result};
use crate::instance::{GuestRuntimeInstance, KvmGuestInstance};
use crate::monitor::{HotpluggableCpu, Monitor};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

/// Descriptor metadata key counting hot-added memory modules.
const DIMM_COUNT_KEY: &str = "hotplug_dimms";

fn topology_key(cpu: &HotpluggableCpu) -> (u64, u64, u64) {
    let id = |name: &str| cpu.props.get(name).and_then(Value::as_u64).unwrap_or(0);
    (id("socket-id"), id("core-id"), id("thread-id"))
}

/// Add vCPUs and/or memory to a running guest, within the descriptor's
/// hotplug ceilings.
pub struct HotplugCpuMemTask {
    guest: Arc<KvmGuestInstance>,
    add_cpu: u32,
    /// Memory to add in MB.
    add_mem: u64,
}

impl HotplugCpuMemTask {
    pub fn new(guest: Arc<KvmGuestInstance>, add_cpu: u32, add_mem: u64) -> Self {
        Self { guest, add_cpu, add_mem }
    }

    async fn add_cpus(&self, monitor: &dyn Monitor, first_id: u32) -> Result<()> {
        let mut free: Vec<HotpluggableCpu> =
            monitor.query_hotpluggable_cpus().await?.into_iter().filter(|c| c.qom_path.is_none()).collect();
        if free.len() < self.add_cpu as usize {
            return Err(GuestError::InputParameter {
                name: "cpu".to_string(),
                reason: format!("only {} free cpu slots", free.len()),
            });
        }
        free.sort_by_key(topology_key);
        for (offset, cpu) in free.into_iter().take(self.add_cpu as usize).enumerate() {
            let mut args = Map::new();
            args.insert("driver".to_string(), json!(cpu.driver));
            args.insert("id".to_string(), json!(format!("cpu{}", first_id + offset as u32)));
            args.extend(cpu.props);
            monitor.device_add(Value::Object(args)).await?;
        }
        Ok(())
    }

    async fn add_memory(&self, monitor: &dyn Monitor, slot: u32) -> Result<()> {
        let backend = format!("mem{}", slot);
        monitor
            .object_add("memory-backend-ram", &backend, json!({ "size": self.add_mem * 1024 * 1024 }))
            .await?;
        monitor
            .device_add(json!({ "driver": "pc-dimm", "id": format!("dimm{}", slot), "memdev": backend }))
            .await
    }
}

#[async_trait]
impl GuestTask for HotplugCpuMemTask {
    fn name(&self) -> &'static str {
        "hotplug_cpu_mem"
    }

    fn guest_id(&self) -> &str {
        self.guest.id()
    }

    async fn execute(&mut self) -> Result<Value> {
        let monitor = require_monitor(self.guest.id(), self.guest.monitor())?;
        let desc = self.guest.desc().ok_or_else(|| GuestError::invalid_state(self.guest.id(), "no descriptor"))?;

        let cpu = desc.cpu + self.add_cpu;
        let mem = desc.mem + self.add_mem;
        if cpu > desc.max_cpu() {
            return Err(GuestError::InputParameter {
                name: "cpu".to_string(),
                reason: format!("{} exceeds max_cpu {}", cpu, desc.max_cpu()),
            });
        }
        if mem > desc.max_mem() {
            return Err(GuestError::InputParameter {
                name: "mem".to_string(),
                reason: format!("{} exceeds max_mem {}", mem, desc.max_mem()),
            });
        }

        if self.add_cpu > 0 {
            self.add_cpus(monitor.as_ref(), desc.cpu).await?;
            self.guest.update_live_desc(|d| d.cpu = cpu)?;
        }
        if self.add_mem > 0 {
            let slot: u32 = desc.metadata.get(DIMM_COUNT_KEY).and_then(|v| v.parse().ok()).unwrap_or(0);
            self.add_memory(monitor.as_ref(), slot).await?;
            self.guest.update_live_desc(|d| {
                d.mem = mem;
                d.metadata.insert(DIMM_COUNT_KEY.to_string(), (slot + 1).to_string());
            })?;
        }

        if let Some(mut source) = self.guest.source_desc() {
            source.cpu = cpu;
            source.mem = mem;
            self.guest.save_source_desc(source)?;
        }
        info!(cpu, mem, "Hotplug applied");
        Ok(json!({ "cpu": cpu, "mem": mem }))
    }
}
