//! Emulator command-line generation.

use crate::error::{GuestError, Result};
use crate::paths::GuestPaths;
use crate::types::{
    BiosType, ControllerType, DiskDesc, DiskDriver, GuestDesc, IsolatedDeviceType, NicDesc,
    PciAddress, PciDeviceDesc, VdiProtocol,
};
use std::path::PathBuf;
use tracing::{debug, instrument};

const OVMF_PATH: &str = "/usr/share/OVMF/OVMF_CODE.fd";
const MEMORY_HOTPLUG_SLOTS: u32 = 4;

/// Where an incoming guest state comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingSource {
    /// Live migration listener.
    Tcp { port: u16 },
    /// Resume from a suspend state file.
    StateFile(PathBuf),
}

impl IncomingSource {
    pub fn to_arg(&self) -> String {
        match self {
            IncomingSource::Tcp { port } => format!("tcp:0:{}", port),
            IncomingSource::StateFile(path) => format!("exec:cat {}", path.display()),
        }
    }
}

/// Per-launch parameters not stored in the descriptor.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub vnc_port: u16,
    pub vnc_port_base: u16,
    pub incoming: Option<IncomingSource>,
    pub enable_kvm: bool,
}

/// Builds the emulator argument vector for a composed descriptor.
///
/// Every PCI device must already carry an address.
pub struct QemuCommandBuilder<'a> {
    desc: &'a GuestDesc,
    paths: &'a GuestPaths,
    options: &'a LaunchOptions,
    args: Vec<String>,
}

impl<'a> QemuCommandBuilder<'a> {
    pub fn new(desc: &'a GuestDesc, paths: &'a GuestPaths, options: &'a LaunchOptions) -> Self {
        Self { desc, paths, options, args: Vec::new() }
    }

    fn push(&mut self, flag: &str, value: impl Into<String>) {
        self.args.push(flag.to_string());
        self.args.push(value.into());
    }

    fn device(&mut self, value: impl Into<String>) {
        self.push("-device", value);
    }

    /// Name of the bus with the given index.
    fn bus_name(&self, index: u32) -> Result<String> {
        if index == 0 {
            return Ok(if self.desc.machine.is_pcie() { "pcie.0" } else { "pci.0" }.to_string());
        }
        self.desc
            .pci_controllers
            .iter()
            .find(|c| c.bus_index == index)
            .map(|c| c.id.clone())
            .ok_or_else(|| GuestError::Internal(format!("no controller provides bus {}", index)))
    }

    /// `,bus=..,addr=..` suffix for a PCI device.
    fn pci_suffix(&self, device: &str, address: Option<PciAddress>) -> Result<String> {
        let address =
            address.ok_or_else(|| GuestError::NoValidAddress { device: device.to_string() })?;
        let mut suffix = format!(",bus={},addr={}", self.bus_name(address.bus)?, address.addr_arg());
        if address.multi_function {
            suffix.push_str(",multifunction=on");
        }
        Ok(suffix)
    }

    fn plain_device(&mut self, dev: &PciDeviceDesc, extra: &str) -> Result<()> {
        let suffix = self.pci_suffix(&dev.id, dev.pci_address)?;
        self.device(format!("{},id={}{}{}", dev.driver, dev.id, extra, suffix));
        Ok(())
    }

    #[instrument(skip(self), fields(guest_id = %self.desc.uuid))]
    pub fn build(mut self) -> Result<Vec<String>> {
        let desc = self.desc;
        let paths = self.paths;

        self.push("-name", if desc.name.is_empty() { desc.uuid.clone() } else { desc.name.clone() });
        self.push("-uuid", desc.uuid.clone());
        let accel = if self.options.enable_kvm { ",accel=kvm" } else { "" };
        self.push("-machine", format!("{}{}", desc.machine.as_str(), accel));
        if self.options.enable_kvm {
            self.push("-cpu", "host");
        }
        self.push("-smp", format!("cpus={},maxcpus={}", desc.cpu, desc.max_cpu()));
        if desc.max_mem() > desc.mem {
            self.push(
                "-m",
                format!("{}M,slots={},maxmem={}M", desc.mem, MEMORY_HOTPLUG_SLOTS, desc.max_mem()),
            );
        } else {
            self.push("-m", format!("{}M", desc.mem));
        }
        if desc.bios == BiosType::Uefi {
            self.push("-bios", OVMF_PATH);
        }
        if !desc.boot_order.is_empty() {
            self.push("-boot", format!("order={}", desc.boot_order));
        }
        self.args.push("-nodefaults".to_string());
        self.args.push("-daemonize".to_string());
        self.push("-pidfile", paths.pid().display().to_string());
        self.push("-D", paths.log().display().to_string());

        // Monitor
        self.push(
            "-chardev",
            format!("socket,id=qmp,path={},server=on,wait=off", paths.monitor_socket().display()),
        );
        self.push("-mon", "chardev=qmp,mode=control");

        // Display
        if desc.vdi == VdiProtocol::Spice {
            self.push("-spice", format!("port={},disable-ticketing=on", self.options.vnc_port));
        } else {
            let display = self.options.vnc_port.saturating_sub(self.options.vnc_port_base);
            self.push("-vnc", format!(":{}", display));
        }

        self.build_devices()?;

        if let Some(incoming) = &self.options.incoming {
            self.push("-incoming", incoming.to_arg());
        }

        debug!(args = ?self.args, "Built emulator args");
        Ok(self.args)
    }

    fn build_devices(&mut self) -> Result<()> {
        let desc = self.desc;

        if let Some(vga) = &desc.vga_device {
            self.plain_device(vga, "")?;
        }

        if let Some(serial) = &desc.virtio_serial {
            self.plain_device(serial, "")?;
            self.push(
                "-chardev",
                format!("socket,id=qga0,path={},server=on,wait=off", self.paths.qga_socket().display()),
            );
            self.device(format!(
                "virtserialport,bus={}.0,chardev=qga0,name=org.qemu.guest_agent.0",
                serial.id
            ));
        }

        if let Some(spice) = &desc.spice {
            self.plain_device(&spice.hda, "")?;
            self.device(format!("hda-duplex,id=sound0-codec0,bus={}.0,cad=0", spice.hda.id));
            self.plain_device(&spice.vdagent_serial, "")?;
            self.push("-chardev", "spicevmc,id=vdagent,name=vdagent");
            self.device(format!(
                "virtserialport,bus={}.0,chardev=vdagent,name=com.redhat.spice.0",
                spice.vdagent_serial.id
            ));
            if let Some((ehci, companions)) = spice.usb_redirect.split_first() {
                self.plain_device(ehci, "")?;
                for (i, uhci) in companions.iter().enumerate() {
                    let extra = format!(",masterbus={}.0,firstport={}", ehci.id, i * 2);
                    self.plain_device(uhci, &extra)?;
                }
                for i in 0..2 {
                    self.push("-chardev", format!("spicevmc,name=usbredir,id=usbredirchardev{}", i));
                    self.device(format!("usb-redir,chardev=usbredirchardev{},id=usbredirdev{}", i, i));
                }
            }
        }

        if let Some(scsi) = &desc.scsi {
            self.plain_device(scsi, "")?;
        }

        for (chassis, ctrl) in desc.pci_controllers.iter().enumerate() {
            let Some(driver) = ctrl.controller.device_driver() else {
                continue;
            };
            let extra = match ctrl.controller {
                ControllerType::PciBridge => format!(",chassis_nr={}", chassis + 1),
                ControllerType::PcieRootPort => format!(",chassis={},port=0x{:x}", chassis + 1, chassis + 16),
                _ => String::new(),
            };
            let suffix = self.pci_suffix(&ctrl.id, ctrl.pci_address)?;
            self.device(format!("{},id={}{}{}", driver, ctrl.id, extra, suffix));
        }

        for disk in &desc.disks {
            self.push("-drive", drive_arg(disk));
            let dev = self.disk_device_arg(disk)?;
            self.device(dev);
        }

        for cdrom in &desc.cdroms {
            let file = cdrom
                .path
                .as_ref()
                .map(|p| format!(",file={}", p.display()))
                .unwrap_or_default();
            self.push("-drive", format!("id={},media=cdrom,if=none{}", cdrom.drive_id(), file));
            let boot = cdrom.boot_index.map(|b| format!(",bootindex={}", b)).unwrap_or_default();
            self.device(format!("ide-cd,drive={},id={}-dev{}", cdrom.drive_id(), cdrom.drive_id(), boot));
        }

        for nic in &desc.nics {
            self.push("-netdev", netdev_arg(nic, self.paths));
            let dev = self.nic_device_arg(nic)?;
            self.device(dev);
        }

        for dev in &desc.isolated_devices {
            match dev.dev_type {
                IsolatedDeviceType::Pci => {
                    let suffix = self.pci_suffix(&dev.id, dev.pci_address)?;
                    self.device(format!("vfio-pci,host={},id={}{}", dev.addr, dev.id, suffix));
                    if let Some(base) = dev.pci_address {
                        for (i, extra) in dev.extra_functions.iter().enumerate() {
                            let function = i as u8 + 1;
                            let addr = PciAddress::new(base.bus, base.slot, function);
                            let suffix = self.pci_suffix(&dev.id, Some(addr))?;
                            self.device(format!(
                                "vfio-pci,host={},id={}_f{}{}",
                                extra, dev.id, function, suffix
                            ));
                        }
                    }
                }
                IsolatedDeviceType::Usb => {
                    let (bus, addr) = dev.addr.split_once(':').ok_or_else(|| {
                        GuestError::InputParameter {
                            name: format!("{} addr", dev.id),
                            reason: format!("expected bus:device, got {}", dev.addr),
                        }
                    })?;
                    self.device(format!("usb-host,hostbus={},hostaddr={},id={}", bus, addr, dev.id));
                }
            }
        }

        if let Some(usb) = &desc.usb {
            self.plain_device(usb, "")?;
            self.device(format!("usb-tablet,id=input0,bus={}.0", usb.id));
        }

        if let Some(rng) = &desc.rng {
            self.push("-object", "rng-random,filename=/dev/urandom,id=rng0");
            self.plain_device(rng, ",rng=rng0")?;
        }

        Ok(())
    }

    fn disk_device_arg(&self, disk: &DiskDesc) -> Result<String> {
        let base = format!("drive={},id={}", disk.drive_id(), disk.device_id());
        Ok(match disk.driver {
            DiskDriver::Virtio => {
                let suffix = self.pci_suffix(&disk.drive_id(), disk.pci_address)?;
                format!("virtio-blk-pci,{}{}", base, suffix)
            }
            DiskDriver::Scsi | DiskDriver::Pvscsi => {
                let bus = self.desc.scsi.as_ref().map(|s| s.id.as_str()).unwrap_or("scsi");
                format!("scsi-hd,{},bus={}.0,scsi-id={}", base, bus, disk.index)
            }
            DiskDriver::Ide | DiskDriver::Sata => format!("ide-hd,{}", base),
        })
    }

    fn nic_device_arg(&self, nic: &NicDesc) -> Result<String> {
        let mut arg = format!(
            "{},netdev={},id={},mac={}",
            nic.driver.device_driver(),
            nic.netdev_id(),
            nic.device_id(),
            nic.mac
        );
        if nic.num_queues > 1 && !nic.driver.is_legacy_pci() {
            arg.push_str(&format!(",mq=on,vectors={}", nic.num_queues * 2 + 2));
        }
        if let Some(mtu) = nic.mtu {
            if !nic.driver.is_legacy_pci() {
                arg.push_str(&format!(",host_mtu={}", mtu));
            }
        }
        arg.push_str(&self.pci_suffix(&nic.device_id(), nic.pci_address)?);
        Ok(arg)
    }
}

/// `-drive` value for a disk (also used for `drive_add` when hotplugging).
pub fn drive_arg(disk: &DiskDesc) -> String {
    let mut arg = format!(
        "file={},if=none,id={},format={},cache={},aio={}",
        disk.path.display(),
        disk.drive_id(),
        disk.format.as_str(),
        disk.cache_mode,
        disk.aio_mode
    );
    if let Some(iops) = disk.iops {
        arg.push_str(&format!(",iops={}", iops));
    }
    if let Some(bps) = disk.bps {
        arg.push_str(&format!(",bps={}", bps));
    }
    arg
}

/// `-netdev` value for a NIC.
pub fn netdev_arg(nic: &NicDesc, paths: &GuestPaths) -> String {
    let mut arg = format!(
        "tap,id={},ifname={},script={},downscript={}",
        nic.netdev_id(),
        nic.ifname,
        paths.ifup_script(nic.index as usize).display(),
        paths.ifdown_script(nic.index as usize).display()
    );
    if !nic.driver.is_legacy_pci() {
        arg.push_str(",vhost=on");
        if nic.num_queues > 1 {
            arg.push_str(&format!(",queues={}", nic.num_queues));
        }
    }
    arg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::ensure_pci_addresses;
    use crate::types::{MachineType, NicDriver, VgaType};
    use std::path::Path;

    fn options() -> LaunchOptions {
        LaunchOptions { vnc_port: 5903, vnc_port_base: 5900, incoming: None, enable_kvm: true }
    }

    fn composed() -> GuestDesc {
        let mut desc = GuestDesc::new("11111111-2222-3333-4444-555555555555");
        desc.machine = MachineType::Q35;
        desc.vga = VgaType::Qxl;
        desc.cpu = 2;
        desc.mem = 2048;
        desc.disks.push(
            serde_json::from_value(serde_json::json!({
                "disk_id": "d0", "index": 0, "path": "/data/d0.qcow2"
            }))
            .unwrap(),
        );
        let mut nic: NicDesc = serde_json::from_value(serde_json::json!({
            "index": 0, "mac": "00:22:aa:bb:cc:dd", "ifname": "vnet0-g1", "bridge": "br0"
        }))
        .unwrap();
        nic.driver = NicDriver::Virtio;
        desc.nics.push(nic);
        ensure_pci_addresses(&mut desc, 0).unwrap();
        desc
    }

    #[test]
    fn test_builds_core_arguments() {
        let desc = composed();
        let paths = GuestPaths::new(Path::new("/srv"), &desc.uuid);
        let opts = options();
        let args = QemuCommandBuilder::new(&desc, &paths, &opts).build().unwrap();
        let joined = args.join(" ");

        assert!(joined.contains("-machine q35,accel=kvm"));
        assert!(joined.contains("-smp cpus=2,maxcpus=2"));
        assert!(joined.contains("-m 2048M"));
        assert!(joined.contains("-vnc :3"));
        assert!(joined.contains("-daemonize"));
        assert!(joined.contains(&format!("-pidfile {}", paths.pid().display())));
        assert!(joined.contains("mode=control"));
        assert!(joined.contains("virtio-blk-pci,drive=drive_0,id=disk_0,bus=pcie.0,addr=0x3.0x0"));
        assert!(joined.contains("virtio-net-pci,netdev=vnet0,id=netdev0,mac=00:22:aa:bb:cc:dd"));
        assert!(!joined.contains("-incoming"));
    }

    #[test]
    fn test_incoming_argument() {
        let desc = composed();
        let paths = GuestPaths::new(Path::new("/srv"), &desc.uuid);
        let mut opts = options();
        opts.incoming = Some(IncomingSource::Tcp { port: 4397 });
        let args = QemuCommandBuilder::new(&desc, &paths, &opts).build().unwrap();
        let pos = args.iter().position(|a| a == "-incoming").unwrap();
        assert_eq!(args[pos + 1], "tcp:0:4397");
    }

    #[test]
    fn test_unaddressed_device_is_rejected() {
        let mut desc = composed();
        desc.disks[0].pci_address = None;
        let paths = GuestPaths::new(Path::new("/srv"), &desc.uuid);
        let opts = options();
        let err = QemuCommandBuilder::new(&desc, &paths, &opts).build().unwrap_err();
        assert!(matches!(err, GuestError::NoValidAddress { .. }));
    }

    #[test]
    fn test_drive_arg_includes_qos() {
        let mut disk: DiskDesc = serde_json::from_value(serde_json::json!({
            "disk_id": "d0", "index": 1, "path": "/data/d0", "format": "raw"
        }))
        .unwrap();
        disk.iops = Some(500);
        assert_eq!(
            drive_arg(&disk),
            "file=/data/d0,if=none,id=drive_1,format=raw,cache=none,aio=native,iops=500"
        );
    }
}
