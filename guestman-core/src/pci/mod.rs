//! PCI address allocation.
//!
//! A [`PciAddressSpace`] is rebuilt for every composition pass of a guest.
//! It owns one [`PciBus`] per controller, each with a per-slot function
//! bitmap, and hands out guest-visible addresses so that no
//! (bus, slot, function) triple is used twice.

mod compose;

pub use compose::{ensure_pci_addresses, existing_addresses, topology_controllers};

use crate::error::{GuestError, Result};
use crate::types::{ControllerType, MachineType, PciAddress, PciControllerDesc};
use tracing::debug;

const SLOTS_PER_BUS: usize = 32;
const FUNCTIONS_PER_SLOT: u8 = 8;

/// One PCI bus with its slot/function occupancy.
#[derive(Debug, Clone)]
pub struct PciBus {
    pub index: u32,
    pub id: String,
    pub controller: ControllerType,
    /// Bit `n` set means function `n` of the slot is taken.
    slots: [u8; SLOTS_PER_BUS],
}

impl PciBus {
    fn new(index: u32, id: impl Into<String>, controller: ControllerType) -> Self {
        Self { index, id: id.into(), controller, slots: [0; SLOTS_PER_BUS] }
    }

    pub fn is_used(&self, slot: u8, function: u8) -> bool {
        self.slots[slot as usize] & (1 << function) != 0
    }

    fn slot_in_range(&self, slot: u8) -> bool {
        let (start, end) = self.controller.slot_range();
        slot >= start && slot < end
    }

    /// First slot with no function taken, within the controller's range.
    pub fn find_next_unused_slot(&self) -> Option<u8> {
        let (start, end) = self.controller.slot_range();
        (start..end).find(|&slot| self.slots[slot as usize] == 0)
    }

    fn mark_used(&mut self, slot: u8, function: u8) {
        self.slots[slot as usize] |= 1 << function;
    }
}

/// Chipset devices hard-wired by the emulator, per machine type.
pub fn fixed_chipset_devices(machine: MachineType) -> &'static [(&'static str, u8, u8)] {
    match machine {
        MachineType::Pc => &[
            ("host-bridge", 0, 0),
            ("piix3-isa", 1, 0),
            ("piix3-ide", 1, 1),
            ("piix3-usb-uhci", 1, 2),
            ("piix4-acpi", 1, 3),
        ],
        MachineType::Q35 => &[
            ("host-bridge", 0, 0),
            ("ich9-lpc", 31, 0),
            ("ich9-ahci", 31, 2),
            ("ich9-smbus", 31, 3),
        ],
        MachineType::Virt => &[("host-bridge", 0, 0)],
    }
}

/// Per-guest PCI address table.
#[derive(Debug, Clone)]
pub struct PciAddressSpace {
    machine: MachineType,
    buses: Vec<PciBus>,
}

impl PciAddressSpace {
    /// Address space holding only the root bus with chipset devices reserved.
    pub fn new(machine: MachineType) -> Self {
        let (id, controller) = if machine.is_pcie() {
            ("pcie.0", ControllerType::PcieRoot)
        } else {
            ("pci.0", ControllerType::PciRoot)
        };
        let mut root = PciBus::new(0, id, controller);
        for &(_, slot, function) in fixed_chipset_devices(machine) {
            root.mark_used(slot, function);
        }
        Self { machine, buses: vec![root] }
    }

    /// Address space for the given controller topology.
    pub fn with_controllers(machine: MachineType, controllers: &[PciControllerDesc]) -> Self {
        let mut space = Self::new(machine);
        for ctrl in controllers {
            space.add_bus(ctrl);
        }
        space
    }

    pub fn machine(&self) -> MachineType {
        self.machine
    }

    pub fn root_type(&self) -> ControllerType {
        self.buses[0].controller
    }

    /// Register the bus a controller provides.
    pub fn add_bus(&mut self, ctrl: &PciControllerDesc) {
        if self.bus(ctrl.bus_index).is_none() {
            self.buses.push(PciBus::new(ctrl.bus_index, ctrl.id.clone(), ctrl.controller));
        }
    }

    pub fn bus(&self, index: u32) -> Option<&PciBus> {
        self.buses.iter().find(|b| b.index == index)
    }

    pub fn buses(&self) -> &[PciBus] {
        &self.buses
    }

    pub fn has_controller(&self, controller: ControllerType) -> bool {
        self.buses.iter().any(|b| b.controller == controller)
    }

    /// Bus id used in `bus=` device arguments.
    pub fn bus_id(&self, index: u32) -> Option<&str> {
        self.bus(index).map(|b| b.id.as_str())
    }

    /// Make sure a device has an address on a bus of type `controller`.
    ///
    /// A device that already carries an address is only validated and marked
    /// occupied. Otherwise the first bus of the requested type with a free slot
    /// is chosen. `function` must be below 8.
    pub fn ensure_device_pci_address(
        &mut self,
        device: &str,
        address: &mut Option<PciAddress>,
        controller: ControllerType,
        function: u8,
        multi_function: bool,
    ) -> Result<PciAddress> {
        assert!(function < FUNCTIONS_PER_SLOT, "PCI function {} out of range", function);

        if let Some(existing) = *address {
            self.reserve(device, existing)?;
            return Ok(existing);
        }

        let Some(bus) = self.buses.iter_mut().find(|b| {
            b.controller == controller && b.find_next_unused_slot().is_some()
        }) else {
            return Err(GuestError::NoValidAddress { device: device.to_string() });
        };
        let Some(slot) = bus.find_next_unused_slot() else {
            return Err(GuestError::NoValidAddress { device: device.to_string() });
        };
        bus.mark_used(slot, function);
        let assigned = PciAddress { bus: bus.index, slot, function, multi_function };
        debug!(device = %device, address = %assigned, "Assigned PCI address");
        *address = Some(assigned);
        Ok(assigned)
    }

    /// Claim another function of a slot already owned by a device group.
    pub fn claim_function(
        &mut self,
        device: &str,
        address: &mut Option<PciAddress>,
        base: PciAddress,
        function: u8,
        multi_function: bool,
    ) -> Result<PciAddress> {
        assert!(function < FUNCTIONS_PER_SLOT, "PCI function {} out of range", function);
        if let Some(existing) = *address {
            self.reserve(device, existing)?;
            return Ok(existing);
        }
        let assigned = PciAddress { bus: base.bus, slot: base.slot, function, multi_function };
        self.reserve(device, assigned)?;
        *address = Some(assigned);
        Ok(assigned)
    }

    /// Mark a fixed address occupied, failing on collisions.
    pub fn reserve(&mut self, device: &str, address: PciAddress) -> Result<()> {
        let invalid = |reason: &str| GuestError::InputParameter {
            name: format!("{} pci address", device),
            reason: format!("{}: {}", address, reason),
        };
        if address.function >= FUNCTIONS_PER_SLOT {
            return Err(invalid("function out of range"));
        }
        let bus = self
            .buses
            .iter_mut()
            .find(|b| b.index == address.bus)
            .ok_or_else(|| invalid("unknown bus"))?;
        if !bus.slot_in_range(address.slot) {
            return Err(invalid("slot out of range"));
        }
        if bus.is_used(address.slot, address.function) {
            return Err(invalid("already in use"));
        }
        bus.mark_used(address.slot, address.function);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_slot_zero_reserved() {
        let mut space = PciAddressSpace::new(MachineType::Virt);
        let mut addr = None;
        let a = space
            .ensure_device_pci_address("dev", &mut addr, ControllerType::PcieRoot, 0, false)
            .unwrap();
        assert_eq!((a.bus, a.slot, a.function), (0, 1, 0));
        assert!(space.bus(0).unwrap().is_used(0, 0));
    }

    #[test]
    fn test_pc_chipset_slot_one_reserved() {
        let mut space = PciAddressSpace::new(MachineType::Pc);
        let mut addr = None;
        let a = space
            .ensure_device_pci_address("dev", &mut addr, ControllerType::PciRoot, 0, false)
            .unwrap();
        assert_eq!(a.slot, 2);
    }

    #[test]
    fn test_q35_chipset_slot_31_reserved() {
        let space = PciAddressSpace::new(MachineType::Q35);
        let root = space.bus(0).unwrap();
        assert!(root.is_used(31, 0));
        assert!(root.is_used(31, 2));
        assert!(root.is_used(31, 3));
        assert!(!root.is_used(31, 1));
    }

    #[test]
    fn test_existing_address_validated() {
        let mut space = PciAddressSpace::new(MachineType::Pc);
        let mut addr = Some(PciAddress::new(0, 1, 0));
        let err = space
            .ensure_device_pci_address("dev", &mut addr, ControllerType::PciRoot, 0, false)
            .unwrap_err();
        assert!(matches!(err, GuestError::InputParameter { .. }));
    }

    #[test]
    fn test_bus_full_returns_no_valid_address() {
        let mut space = PciAddressSpace::new(MachineType::Pc);
        // slots 2..32 are free on the pc root bus
        for _ in 2..32 {
            let mut addr = None;
            space
                .ensure_device_pci_address("dev", &mut addr, ControllerType::PciRoot, 0, false)
                .unwrap();
        }
        let mut addr = None;
        let err = space
            .ensure_device_pci_address("last", &mut addr, ControllerType::PciRoot, 0, false)
            .unwrap_err();
        assert!(matches!(err, GuestError::NoValidAddress { device } if device == "last"));
    }

    #[test]
    fn test_root_port_has_single_slot() {
        let ctrl = PciControllerDesc {
            id: "root_port0".into(),
            controller: ControllerType::PcieRootPort,
            bus_index: 1,
            pci_address: None,
        };
        let mut space = PciAddressSpace::with_controllers(MachineType::Q35, &[ctrl]);
        let mut first = None;
        let a = space
            .ensure_device_pci_address("d0", &mut first, ControllerType::PcieRootPort, 0, false)
            .unwrap();
        assert_eq!((a.bus, a.slot), (1, 0));
        let mut second = None;
        assert!(space
            .ensure_device_pci_address("d1", &mut second, ControllerType::PcieRootPort, 0, false)
            .is_err());
    }

    #[test]
    fn test_claim_function_on_group_slot() {
        let mut space = PciAddressSpace::new(MachineType::Pc);
        let mut base = None;
        let b = space
            .ensure_device_pci_address("ehci", &mut base, ControllerType::PciRoot, 7, true)
            .unwrap();
        let mut uhci = None;
        let u = space.claim_function("uhci", &mut uhci, b, 0, true).unwrap();
        assert_eq!((u.slot, u.function), (b.slot, 0));
        let mut again = None;
        assert!(space.claim_function("dup", &mut again, b, 0, false).is_err());
    }

    #[test]
    #[should_panic]
    fn test_function_out_of_range_panics() {
        let mut space = PciAddressSpace::new(MachineType::Pc);
        let mut addr = None;
        let _ = space.ensure_device_pci_address("dev", &mut addr, ControllerType::PciRoot, 8, false);
    }
}
