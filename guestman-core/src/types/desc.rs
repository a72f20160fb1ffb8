//! Guest descriptor schema.
//!
//! A [`GuestDesc`] is the authoritative hardware and configuration
//! description of one guest. Two copies live in the guest home directory:
//! the source descriptor as last requested by the control plane and the
//! live descriptor carrying the PCI addresses assigned at start.

use crate::error::{GuestError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Machine (chipset) type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    #[default]
    Pc,
    Q35,
    /// ARM virt board.
    Virt,
}

impl MachineType {
    /// Whether the root bus is a PCIe root complex.
    pub fn is_pcie(&self) -> bool {
        !matches!(self, MachineType::Pc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineType::Pc => "pc",
            MachineType::Q35 => "q35",
            MachineType::Virt => "virt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BiosType {
    #[default]
    Bios,
    Uefi,
}

/// Runtime variant backing a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Hypervisor {
    #[default]
    Kvm,
    Pod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VdiProtocol {
    #[default]
    Vnc,
    Spice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VgaType {
    #[default]
    Std,
    Cirrus,
    Qxl,
    Virtio,
    None,
}

impl VgaType {
    /// Emulator device model, `None` when the guest is headless.
    pub fn device_driver(&self) -> Option<&'static str> {
        match self {
            VgaType::Std => Some("VGA"),
            VgaType::Cirrus => Some("cirrus-vga"),
            VgaType::Qxl => Some("qxl-vga"),
            VgaType::Virtio => Some("virtio-vga"),
            VgaType::None => None,
        }
    }

    /// Conventional-PCI only devices must sit behind a PCI bridge on PCIe machines.
    pub fn is_legacy_pci(&self) -> bool {
        matches!(self, VgaType::Cirrus)
    }
}

/// PCI controller kinds making up a guest's bus topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerType {
    PciRoot,
    PcieRoot,
    PciBridge,
    PcieToPciBridge,
    PcieRootPort,
}

impl ControllerType {
    /// Emulator device model used to instantiate the controller.
    pub fn device_driver(&self) -> Option<&'static str> {
        match self {
            ControllerType::PciRoot | ControllerType::PcieRoot => None,
            ControllerType::PciBridge => Some("pci-bridge"),
            ControllerType::PcieToPciBridge => Some("pcie-pci-bridge"),
            ControllerType::PcieRootPort => Some("pcie-root-port"),
        }
    }

    /// Usable slot range `[start, end)` on a bus provided by this controller.
    pub fn slot_range(&self) -> (u8, u8) {
        match self {
            // slot 0 hosts the host bridge / bridge itself
            ControllerType::PciRoot
            | ControllerType::PcieRoot
            | ControllerType::PciBridge
            | ControllerType::PcieToPciBridge => (1, 32),
            ControllerType::PcieRootPort => (0, 1),
        }
    }
}

/// Guest-visible PCI address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    /// Index of the bus (0 is the root bus).
    pub bus: u32,
    pub slot: u8,
    pub function: u8,
    #[serde(default)]
    pub multi_function: bool,
}

impl PciAddress {
    pub fn new(bus: u32, slot: u8, function: u8) -> Self {
        Self { bus, slot, function, multi_function: false }
    }

    /// `addr=` value understood by the emulator.
    pub fn addr_arg(&self) -> String {
        format!("0x{:x}.0x{:x}", self.slot, self.function)
    }
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.slot, self.function)
    }
}

/// A generic PCI device without further configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceDesc {
    pub id: String,
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<PciAddress>,
}

impl PciDeviceDesc {
    pub fn new(id: impl Into<String>, driver: impl Into<String>) -> Self {
        Self { id: id.into(), driver: driver.into(), pci_address: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciControllerDesc {
    pub id: String,
    pub controller: ControllerType,
    /// Index of the bus this controller provides.
    pub bus_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<PciAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskDriver {
    #[default]
    Virtio,
    Scsi,
    Pvscsi,
    Ide,
    Sata,
}

impl DiskDriver {
    /// Drivers that expose the disk as its own PCI function.
    pub fn is_pci(&self) -> bool {
        matches!(self, DiskDriver::Virtio)
    }

    pub fn needs_scsi_controller(&self) -> bool {
        matches!(self, DiskDriver::Scsi | DiskDriver::Pvscsi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

fn default_cache_mode() -> String {
    "none".to_string()
}

fn default_aio_mode() -> String {
    "native".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDesc {
    pub disk_id: String,
    pub index: u32,
    #[serde(default)]
    pub driver: DiskDriver,
    #[serde(default)]
    pub format: DiskFormat,
    #[serde(default)]
    pub path: PathBuf,
    /// Virtual size in MB.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub storage_id: String,
    /// Local disks are migrated by copying; shared disks are not.
    #[serde(default = "default_true")]
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_path: Option<PathBuf>,
    #[serde(default = "default_cache_mode")]
    pub cache_mode: String,
    #[serde(default = "default_aio_mode")]
    pub aio_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u64>,
    /// Throughput cap in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<PciAddress>,
}

fn default_true() -> bool {
    true
}

impl DiskDesc {
    pub fn new(disk_id: impl Into<String>, index: u32) -> Self {
        Self {
            disk_id: disk_id.into(),
            index,
            driver: DiskDriver::default(),
            format: DiskFormat::default(),
            path: PathBuf::new(),
            size: 0,
            storage_id: String::new(),
            is_local: true,
            template_id: None,
            backing_path: None,
            cache_mode: default_cache_mode(),
            aio_mode: default_aio_mode(),
            iops: None,
            bps: None,
            pci_address: None,
        }
    }

    /// Block device node name used in monitor commands.
    pub fn drive_id(&self) -> String {
        format!("drive_{}", self.index)
    }

    /// Front-end device id, used for `device_del` on hot-unplug.
    pub fn device_id(&self) -> String {
        format!("disk_{}", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NicDriver {
    #[default]
    Virtio,
    E1000,
    Rtl8139,
    Vmxnet3,
}

impl NicDriver {
    pub fn device_driver(&self) -> &'static str {
        match self {
            NicDriver::Virtio => "virtio-net-pci",
            NicDriver::E1000 => "e1000",
            NicDriver::Rtl8139 => "rtl8139",
            NicDriver::Vmxnet3 => "vmxnet3",
        }
    }

    pub fn is_legacy_pci(&self) -> bool {
        !matches!(self, NicDriver::Virtio)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub protocol: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

fn default_queues() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDesc {
    pub index: u32,
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default)]
    pub bridge: String,
    /// Host tap interface name.
    #[serde(default)]
    pub ifname: String,
    #[serde(default)]
    pub driver: NicDriver,
    #[serde(default = "default_queues")]
    pub num_queues: u32,
    /// Bandwidth limit in Mbps, 0 for unlimited.
    #[serde(default)]
    pub bandwidth: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<PciAddress>,
}

impl NicDesc {
    pub fn new(index: u32, mac: impl Into<String>) -> Self {
        Self {
            index,
            mac: mac.into(),
            ip: String::new(),
            gateway: None,
            bridge: String::new(),
            ifname: String::new(),
            driver: NicDriver::default(),
            num_queues: default_queues(),
            bandwidth: 0,
            mtu: None,
            port_mappings: Vec::new(),
            is_default: false,
            pci_address: None,
        }
    }

    pub fn netdev_id(&self) -> String {
        format!("vnet{}", self.index)
    }

    pub fn device_id(&self) -> String {
        format!("netdev{}", self.index)
    }

    fn has_gateway(&self) -> bool {
        self.gateway.as_deref().is_some_and(|g| !g.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdromDesc {
    pub ordinal: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_index: Option<u32>,
}

impl CdromDesc {
    pub fn drive_id(&self) -> String {
        format!("cd{}", self.ordinal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolatedDeviceType {
    #[default]
    Pci,
    Usb,
}

/// Host device passed through to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedDeviceDesc {
    pub id: String,
    #[serde(default)]
    pub dev_type: IsolatedDeviceType,
    /// Host address: `0000:01:00.0` for PCI, `bus:device` for USB.
    pub addr: String,
    #[serde(default)]
    pub vendor_device_id: String,
    /// Other host functions of the same IOMMU group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_functions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<PciAddress>,
}

/// Spice VDI device group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiceDesc {
    /// Intel HDA sound card.
    pub hda: PciDeviceDesc,
    /// virtio-serial controller hosting the vdagent channel.
    pub vdagent_serial: PciDeviceDesc,
    /// EHCI companion at function 7 followed by three UHCI controllers.
    pub usb_redirect: Vec<PciDeviceDesc>,
}

impl SpiceDesc {
    pub fn new() -> Self {
        Self {
            hda: PciDeviceDesc::new("sound0", "intel-hda"),
            vdagent_serial: PciDeviceDesc::new("vdagent-serial0", "virtio-serial-pci"),
            usb_redirect: vec![
                PciDeviceDesc::new("ehci0", "ich9-usb-ehci1"),
                PciDeviceDesc::new("uhci0", "ich9-usb-uhci1"),
                PciDeviceDesc::new("uhci1", "ich9-usb-uhci2"),
                PciDeviceDesc::new("uhci2", "ich9-usb-uhci3"),
            ],
        }
    }
}

impl Default for SpiceDesc {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

/// Container spec for pod guests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDesc {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<ContainerMount>,
}

fn default_cpu() -> u32 {
    1
}

fn default_mem() -> u64 {
    512
}

/// Authoritative guest descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDesc {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub hypervisor: Hypervisor,

    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in MB.
    #[serde(default = "default_mem")]
    pub mem: u64,
    /// Hotplug ceiling for vCPUs, defaults to `cpu`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<u32>,
    /// Hotplug ceiling for memory in MB, defaults to `mem`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mem: Option<u64>,
    #[serde(default)]
    pub machine: MachineType,
    #[serde(default)]
    pub bios: BiosType,
    #[serde(default)]
    pub boot_order: String,

    #[serde(default)]
    pub disks: Vec<DiskDesc>,
    #[serde(default)]
    pub nics: Vec<NicDesc>,
    #[serde(default)]
    pub cdroms: Vec<CdromDesc>,
    #[serde(default)]
    pub isolated_devices: Vec<IsolatedDeviceDesc>,
    #[serde(default)]
    pub pci_controllers: Vec<PciControllerDesc>,

    #[serde(default)]
    pub vga: VgaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vga_device: Option<PciDeviceDesc>,
    #[serde(default)]
    pub vdi: VdiProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spice: Option<SpiceDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb: Option<PciDeviceDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtio_serial: Option<PciDeviceDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scsi: Option<PciDeviceDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rng: Option<PciDeviceDesc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerDesc>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GuestDesc {
    /// Minimal descriptor for a freshly registered guest.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: String::new(),
            domain_id: String::new(),
            tenant_id: String::new(),
            hypervisor: Hypervisor::Kvm,
            cpu: default_cpu(),
            mem: default_mem(),
            max_cpu: None,
            max_mem: None,
            machine: MachineType::Pc,
            bios: BiosType::Bios,
            boot_order: String::new(),
            disks: Vec::new(),
            nics: Vec::new(),
            cdroms: Vec::new(),
            isolated_devices: Vec::new(),
            pci_controllers: Vec::new(),
            vga: VgaType::Std,
            vga_device: None,
            vdi: VdiProtocol::Vnc,
            spice: None,
            usb: None,
            virtio_serial: None,
            scsi: None,
            rng: None,
            containers: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Load a descriptor from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| GuestError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| GuestError::InvalidDesc {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Persist the descriptor, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self).map_err(|e| GuestError::InvalidDesc {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| GuestError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| GuestError::io(path, e))
    }

    /// Ensure exactly one NIC is the default route holder.
    ///
    /// Keeps a single existing default when it is the first flagged one,
    /// otherwise prefers the first NIC with a gateway, then the first NIC.
    pub fn fix_default_gateway(&mut self) {
        if self.nics.is_empty() {
            return;
        }
        let chosen = self
            .nics
            .iter()
            .position(|n| n.is_default)
            .or_else(|| self.nics.iter().position(NicDesc::has_gateway))
            .unwrap_or(0);
        for (i, nic) in self.nics.iter_mut().enumerate() {
            nic.is_default = i == chosen;
        }
    }

    /// Whether any device is conventional-PCI only.
    pub fn needs_pci_bridge(&self) -> bool {
        self.vga.is_legacy_pci() || self.nics.iter().any(|n| n.driver.is_legacy_pci())
    }

    pub fn disk(&self, disk_id: &str) -> Option<&DiskDesc> {
        self.disks.iter().find(|d| d.disk_id == disk_id)
    }

    pub fn disk_mut(&mut self, disk_id: &str) -> Option<&mut DiskDesc> {
        self.disks.iter_mut().find(|d| d.disk_id == disk_id)
    }

    pub fn max_cpu(&self) -> u32 {
        self.max_cpu.unwrap_or(self.cpu).max(self.cpu)
    }

    pub fn max_mem(&self) -> u64 {
        self.max_mem.unwrap_or(self.mem).max(self.mem)
    }

    /// Basic structural validation applied before persisting a new descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.uuid.is_empty() {
            return Err(GuestError::MissingParameter { name: "uuid".to_string() });
        }
        if self.cpu == 0 {
            return Err(GuestError::InputParameter {
                name: "cpu".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let mut indexes: Vec<u32> = self.disks.iter().map(|d| d.index).collect();
        indexes.sort_unstable();
        if indexes.windows(2).any(|w| w[0] == w[1]) {
            return Err(GuestError::InputParameter {
                name: "disks".to_string(),
                reason: "duplicate disk index".to_string(),
            });
        }
        if self.hypervisor == Hypervisor::Pod && self.containers.is_empty() {
            return Err(GuestError::MissingParameter { name: "containers".to_string() });
        }
        Ok(())
    }
}
