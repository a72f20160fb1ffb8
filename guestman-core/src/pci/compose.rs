//! Device composition: walks a descriptor in a fixed order and assigns
//! every PCI device an address.

use super::PciAddressSpace;
use crate::error::{GuestError, Result};
use crate::types::{
    ControllerType, DiskDriver, GuestDesc, IsolatedDeviceType, PciAddress, PciControllerDesc,
    PciDeviceDesc, SpiceDesc, VdiProtocol,
};

/// Controllers a guest needs beyond its root bus.
///
/// PCIe machines get a pcie-to-pci bridge plus a pci bridge when a
/// conventional-PCI device is present, and `root_ports` hotplug-capable
/// root ports.
pub fn topology_controllers(desc: &GuestDesc, root_ports: u32) -> Vec<PciControllerDesc> {
    let mut controllers = Vec::new();
    if !desc.machine.is_pcie() {
        return controllers;
    }
    let mut next_bus = 1;
    if desc.needs_pci_bridge() {
        controllers.push(PciControllerDesc {
            id: "pcie_pci_bridge0".to_string(),
            controller: ControllerType::PcieToPciBridge,
            bus_index: next_bus,
            pci_address: None,
        });
        controllers.push(PciControllerDesc {
            id: "pci_bridge0".to_string(),
            controller: ControllerType::PciBridge,
            bus_index: next_bus + 1,
            pci_address: None,
        });
        next_bus += 2;
    }
    for i in 0..root_ports {
        controllers.push(PciControllerDesc {
            id: format!("root_port{}", i),
            controller: ControllerType::PcieRootPort,
            bus_index: next_bus,
            pci_address: None,
        });
        next_bus += 1;
    }
    controllers
}

/// Bus type for a plain device.
fn device_bus(space: &PciAddressSpace, legacy: bool) -> ControllerType {
    if legacy && space.machine().is_pcie() && space.has_controller(ControllerType::PciBridge) {
        ControllerType::PciBridge
    } else {
        space.root_type()
    }
}

/// Bus type for hotplug-capable devices (disks, NICs).
fn hotplug_bus(space: &PciAddressSpace) -> ControllerType {
    let free_port = space
        .buses()
        .iter()
        .any(|b| b.controller == ControllerType::PcieRootPort && b.find_next_unused_slot().is_some());
    if free_port {
        ControllerType::PcieRootPort
    } else {
        space.root_type()
    }
}

/// Address a device unless it already has one reserved by the pre-pass.
fn assign(
    space: &mut PciAddressSpace,
    id: &str,
    address: &mut Option<PciAddress>,
    controller: ControllerType,
    function: u8,
    multi_function: bool,
) -> Result<PciAddress> {
    match *address {
        Some(existing) => Ok(existing),
        None => space.ensure_device_pci_address(id, address, controller, function, multi_function),
    }
}

fn ensure_plain(space: &mut PciAddressSpace, dev: &mut PciDeviceDesc, legacy: bool) -> Result<()> {
    let ctrl = device_bus(space, legacy);
    assign(space, &dev.id, &mut dev.pci_address, ctrl, 0, false)?;
    Ok(())
}

/// Every address already present in `desc`, with the owning device id.
///
/// Extra IOMMU-group functions of a passthrough device are reported as
/// separate entries on the device's slot.
pub fn existing_addresses(desc: &GuestDesc) -> Vec<(String, PciAddress)> {
    let mut out = Vec::new();
    for dev in [&desc.vga_device, &desc.virtio_serial, &desc.scsi, &desc.usb, &desc.rng]
        .into_iter()
        .flatten()
    {
        if let Some(a) = dev.pci_address {
            out.push((dev.id.clone(), a));
        }
    }
    if let Some(spice) = &desc.spice {
        let devices = [&spice.hda, &spice.vdagent_serial].into_iter().chain(&spice.usb_redirect);
        for dev in devices {
            if let Some(a) = dev.pci_address {
                out.push((dev.id.clone(), a));
            }
        }
    }
    for ctrl in &desc.pci_controllers {
        if let Some(a) = ctrl.pci_address {
            out.push((ctrl.id.clone(), a));
        }
    }
    for disk in &desc.disks {
        if let Some(a) = disk.pci_address {
            out.push((disk.drive_id(), a));
        }
    }
    for nic in &desc.nics {
        if let Some(a) = nic.pci_address {
            out.push((nic.device_id(), a));
        }
    }
    for dev in &desc.isolated_devices {
        if let Some(a) = dev.pci_address {
            out.push((dev.id.clone(), a));
            for function in 1..=dev.extra_functions.len() as u8 {
                out.push((dev.id.clone(), PciAddress::new(a.bus, a.slot, function)));
            }
        }
    }
    out
}

/// Assign PCI addresses to every device of `desc`.
///
/// Allocation order is fixed so that identical descriptors always produce
/// identical layouts: VGA, virtio-serial, VDI group, SCSI controller,
/// bridges/ports, disks, NICs, isolated devices, USB, RNG.
pub fn ensure_pci_addresses(desc: &mut GuestDesc, root_ports: u32) -> Result<PciAddressSpace> {
    if desc.pci_controllers.is_empty() {
        desc.pci_controllers = topology_controllers(desc, root_ports);
    }
    let mut space = PciAddressSpace::with_controllers(desc.machine, &desc.pci_controllers);
    for (id, address) in existing_addresses(desc) {
        space.reserve(&id, address)?;
    }

    // VGA
    match desc.vga.device_driver() {
        Some(driver) => {
            let legacy = desc.vga.is_legacy_pci();
            let dev = desc.vga_device.get_or_insert_with(|| PciDeviceDesc::new("video0", driver));
            dev.driver = driver.to_string();
            ensure_plain(&mut space, dev, legacy)?;
        }
        None => desc.vga_device = None,
    }

    // virtio-serial carries the guest agent channel
    let serial = desc
        .virtio_serial
        .get_or_insert_with(|| PciDeviceDesc::new("virtio-serial0", "virtio-serial-pci"));
    ensure_plain(&mut space, serial, false)?;

    // VDI
    if desc.vdi == VdiProtocol::Spice {
        let spice = desc.spice.get_or_insert_with(SpiceDesc::new);
        ensure_plain(&mut space, &mut spice.hda, false)?;
        ensure_plain(&mut space, &mut spice.vdagent_serial, false)?;
        let root = space.root_type();
        let mut usb = spice.usb_redirect.iter_mut();
        if let Some(ehci) = usb.next() {
            let base = assign(&mut space, &ehci.id, &mut ehci.pci_address, root, 7, true)?;
            for (function, uhci) in usb.enumerate() {
                if uhci.pci_address.is_some() {
                    continue;
                }
                let function = function as u8;
                space.claim_function(
                    &uhci.id,
                    &mut uhci.pci_address,
                    base,
                    function,
                    function == 0,
                )?;
            }
        }
    } else {
        desc.spice = None;
    }

    // SCSI controller
    let scsi_driver = if desc.disks.iter().any(|d| d.driver == DiskDriver::Pvscsi) {
        Some("pvscsi")
    } else if desc.disks.iter().any(|d| d.driver.needs_scsi_controller()) {
        Some("virtio-scsi-pci")
    } else {
        None
    };
    match scsi_driver {
        Some(driver) => {
            let scsi = desc.scsi.get_or_insert_with(|| PciDeviceDesc::new("scsi", driver));
            scsi.driver = driver.to_string();
            ensure_plain(&mut space, scsi, false)?;
        }
        None => desc.scsi = None,
    }

    // Bridges and root ports
    for ctrl in desc.pci_controllers.iter_mut() {
        let parent = match ctrl.controller {
            ControllerType::PcieToPciBridge | ControllerType::PcieRootPort => {
                ControllerType::PcieRoot
            }
            ControllerType::PciBridge => ControllerType::PcieToPciBridge,
            ControllerType::PciRoot | ControllerType::PcieRoot => continue,
        };
        assign(&mut space, &ctrl.id, &mut ctrl.pci_address, parent, 0, false)?;
    }

    // Disks
    for disk in desc.disks.iter_mut().filter(|d| d.driver.is_pci()) {
        let ctrl = hotplug_bus(&space);
        assign(&mut space, &disk.drive_id(), &mut disk.pci_address, ctrl, 0, false)?;
    }

    // NICs
    for nic in desc.nics.iter_mut() {
        let ctrl = if nic.driver.is_legacy_pci() {
            device_bus(&space, true)
        } else {
            hotplug_bus(&space)
        };
        assign(&mut space, &nic.device_id(), &mut nic.pci_address, ctrl, 0, false)?;
    }

    // Passthrough devices, one multi-function slot per IOMMU group
    let root = space.root_type();
    for dev in desc.isolated_devices.iter_mut().filter(|d| d.dev_type == IsolatedDeviceType::Pci) {
        if dev.extra_functions.len() >= 8 {
            return Err(GuestError::InputParameter {
                name: format!("{} extra functions", dev.id),
                reason: "an IOMMU group cannot exceed 8 functions".to_string(),
            });
        }
        if dev.pci_address.is_some() {
            continue;
        }
        let multi = !dev.extra_functions.is_empty();
        let base = space.ensure_device_pci_address(&dev.id, &mut dev.pci_address, root, 0, multi)?;
        for function in 1..=dev.extra_functions.len() as u8 {
            let mut extra = None;
            space.claim_function(&dev.id, &mut extra, base, function, false)?;
        }
    }

    // USB host controller
    let usb = desc.usb.get_or_insert_with(|| PciDeviceDesc::new("usb", "qemu-xhci"));
    ensure_plain(&mut space, usb, false)?;

    // RNG
    let rng = desc.rng.get_or_insert_with(|| PciDeviceDesc::new("random0", "virtio-rng-pci"));
    ensure_plain(&mut space, rng, false)?;

    Ok(space)
}
