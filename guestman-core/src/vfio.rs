//! Host PCI passthrough helpers.
//!
//! Passthrough devices must bring their whole IOMMU group along. The
//! sibling functions found in sysfs are recorded on the descriptor as extra
//! functions so the allocator can place them on the same guest slot.

use crate::error::{GuestError, Result};
use crate::types::{GuestDesc, IsolatedDeviceType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Host PCI address: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Validate host PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// All host devices sharing the IOMMU group of `address`, sorted.
///
/// Returns `Ok(None)` when the device or its group link is absent.
pub fn iommu_group_members(sysfs_pci_root: &Path, address: &str) -> Result<Option<Vec<String>>> {
    if !is_valid_pci_address(address) {
        return Err(GuestError::InputParameter {
            name: "isolated device address".to_string(),
            reason: format!("{} (expected: 0000:01:00.0)", address),
        });
    }
    let devices_path = sysfs_pci_root.join(address).join("iommu_group").join("devices");
    if !devices_path.exists() {
        return Ok(None);
    }
    let mut members = Vec::new();
    for entry in fs::read_dir(&devices_path).map_err(|e| GuestError::io(&devices_path, e))? {
        let entry = entry.map_err(|e| GuestError::io(&devices_path, e))?;
        if let Some(name) = entry.file_name().to_str() {
            members.push(name.to_string());
        }
    }
    members.sort();
    debug!(address = %address, members = ?members, "Read IOMMU group");
    Ok(Some(members))
}

/// Fill `extra_functions` of PCI passthrough devices from their IOMMU groups.
///
/// Members that are themselves requested as separate devices are skipped.
pub fn fill_extra_functions(desc: &mut GuestDesc, sysfs_pci_root: &Path) -> Result<()> {
    let requested: HashSet<String> = desc
        .isolated_devices
        .iter()
        .filter(|d| d.dev_type == IsolatedDeviceType::Pci)
        .map(|d| d.addr.clone())
        .collect();

    for dev in desc.isolated_devices.iter_mut() {
        if dev.dev_type != IsolatedDeviceType::Pci || !dev.extra_functions.is_empty() {
            continue;
        }
        let Some(members) = iommu_group_members(sysfs_pci_root, &dev.addr)? else {
            continue;
        };
        dev.extra_functions = members.into_iter().filter(|m| !requested.contains(m)).collect();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IsolatedDeviceDesc;

    #[test]
    fn test_pci_address_validation() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:af:1f.7"));
        assert!(!is_valid_pci_address("01:00.0"));
        assert!(!is_valid_pci_address("0000:01:00.8"));
    }

    fn make_group(root: &Path, device: &str, members: &[&str]) {
        let devices = root.join(device).join("iommu_group").join("devices");
        fs::create_dir_all(&devices).unwrap();
        for m in members {
            fs::create_dir_all(devices.join(m)).unwrap();
        }
    }

    #[test]
    fn test_fill_extra_functions_from_group() {
        let dir = tempfile::tempdir().unwrap();
        make_group(dir.path(), "0000:01:00.0", &["0000:01:00.1", "0000:01:00.0"]);

        let mut desc = GuestDesc::new("g1");
        desc.isolated_devices.push(IsolatedDeviceDesc {
            id: "gpu0".into(),
            dev_type: IsolatedDeviceType::Pci,
            addr: "0000:01:00.0".into(),
            vendor_device_id: String::new(),
            extra_functions: Vec::new(),
            pci_address: None,
        });
        fill_extra_functions(&mut desc, dir.path()).unwrap();
        assert_eq!(desc.isolated_devices[0].extra_functions, vec!["0000:01:00.1".to_string()]);
    }

    #[test]
    fn test_missing_group_leaves_device_alone() {
        let dir = tempfile::tempdir().unwrap();
        assert!(iommu_group_members(dir.path(), "0000:02:00.0").unwrap().is_none());
    }
}
