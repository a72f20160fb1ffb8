//! Core domain types for guestman.

pub mod desc;
pub mod status;

// Re-exports
pub use desc::{
    BiosType, CdromDesc, ContainerDesc, ContainerMount, ControllerType, DiskDesc, DiskDriver,
    DiskFormat, GuestDesc, Hypervisor, IsolatedDeviceDesc, IsolatedDeviceType, MachineType,
    NicDesc, NicDriver, PciAddress, PciControllerDesc, PciDeviceDesc, PortMapping, SpiceDesc,
    VdiProtocol, VgaType,
};
pub use status::GuestStatus;
