//! QEMU process plumbing: command lines, launch scripts and version gates.

mod cmdline;
mod scripts;

pub use cmdline::{drive_arg, netdev_arg, IncomingSource, LaunchOptions, QemuCommandBuilder};
pub use scripts::{
    ifdown_script, ifup_script, shell_quote, start_script, stop_script, write_script,
};

use crate::error::{GuestError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Emulator version as reported by `query-version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QemuVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl QemuVersion {
    /// First version able to snapshot and stream disks of a running guest.
    pub const LIVE_SNAPSHOT: QemuVersion = QemuVersion { major: 2, minor: 12, micro: 1 };

    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self { major, minor, micro }
    }

    pub fn supports_live_snapshot(&self) -> bool {
        *self >= Self::LIVE_SNAPSHOT
    }
}

impl FromStr for QemuVersion {
    type Err = GuestError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || GuestError::InputParameter {
            name: "qemu version".to_string(),
            reason: format!("cannot parse {:?}", s),
        };
        // tolerate suffixes such as "4.2.0 (Debian 1:4.2-3)"
        let core = s.split_whitespace().next().ok_or_else(invalid)?;
        let mut parts = core.split('.').map(|p| p.parse::<u32>());
        let major = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
        let minor = parts.next().unwrap_or(Ok(0)).map_err(|_| invalid())?;
        let micro = parts.next().unwrap_or(Ok(0)).map_err(|_| invalid())?;
        Ok(Self { major, minor, micro })
    }
}

impl fmt::Display for QemuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_gate() {
        let v: QemuVersion = "2.12.1".parse().unwrap();
        assert!(v.supports_live_snapshot());
        assert!(!"2.12.0".parse::<QemuVersion>().unwrap().supports_live_snapshot());
        assert!(!"2.9".parse::<QemuVersion>().unwrap().supports_live_snapshot());
        assert_eq!("4.2.0 (Debian)".parse::<QemuVersion>().unwrap(), QemuVersion::new(4, 2, 0));
        assert!("abc".parse::<QemuVersion>().is_err());
    }
}
