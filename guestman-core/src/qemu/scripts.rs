//! `startvm` / `stopvm` and NIC helper script generation.

use crate::error::{GuestError, Result};
use crate::paths::GuestPaths;
use crate::types::NicDesc;
use std::path::Path;

/// Quote a single shell word.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_=:,./@%+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Script that launches the emulator unless this guest's process is already up.
pub fn start_script(binary: &Path, args: &[String], paths: &GuestPaths, uuid: &str) -> String {
    let pid = paths.pid();
    let mut script = String::from("#!/bin/bash\n");
    script.push_str(&format!(
        r#"PID_FILE={pid}
if [ -f "$PID_FILE" ]; then
    PID=$(cat "$PID_FILE")
    if [ -n "$PID" ] && [ -f /proc/$PID/cmdline ] && grep -qa {uuid} /proc/$PID/cmdline; then
        echo "guest {uuid} already running"
        exit 0
    fi
fi
rm -f {monitor} {qga}
"#,
        pid = shell_quote(&pid.display().to_string()),
        uuid = shell_quote(uuid),
        monitor = shell_quote(&paths.monitor_socket().display().to_string()),
        qga = shell_quote(&paths.qga_socket().display().to_string()),
    ));
    script.push_str(&shell_quote(&binary.display().to_string()));
    for arg in args {
        script.push_str(" \\\n    ");
        script.push_str(&shell_quote(arg));
    }
    script.push('\n');
    script
}

/// Script that kills the guest process recorded in the pid file.
pub fn stop_script(paths: &GuestPaths, uuid: &str) -> String {
    format!(
        r#"#!/bin/bash
PID_FILE={pid}
if [ -f "$PID_FILE" ]; then
    PID=$(cat "$PID_FILE")
    if [ -n "$PID" ] && [ -f /proc/$PID/cmdline ] && grep -qa {uuid} /proc/$PID/cmdline; then
        kill -9 $PID
    fi
    rm -f "$PID_FILE"
fi
"#,
        pid = shell_quote(&paths.pid().display().to_string()),
        uuid = shell_quote(uuid),
    )
}

/// Tap up script: attach to the bridge and apply bandwidth/MTU.
pub fn ifup_script(nic: &NicDesc) -> String {
    let mut script = String::from("#!/bin/bash\nIF=$1\n");
    if let Some(mtu) = nic.mtu {
        script.push_str(&format!("ip link set dev \"$IF\" mtu {}\n", mtu));
    }
    script.push_str("ip link set dev \"$IF\" up\n");
    if !nic.bridge.is_empty() {
        script.push_str(&format!("ip link set dev \"$IF\" master {}\n", shell_quote(&nic.bridge)));
    }
    if nic.bandwidth > 0 {
        script.push_str(&format!(
            "tc qdisc replace dev \"$IF\" root tbf rate {}mbit burst 256kb latency 100ms\n",
            nic.bandwidth
        ));
    }
    script
}

pub fn ifdown_script(nic: &NicDesc) -> String {
    let mut script = String::from("#!/bin/bash\nIF=$1\n");
    if nic.bandwidth > 0 {
        script.push_str("tc qdisc del dev \"$IF\" root 2>/dev/null\n");
    }
    script.push_str("ip link set dev \"$IF\" nomaster 2>/dev/null\n");
    script.push_str("ip link set dev \"$IF\" down\n");
    script
}

/// Write an executable script.
pub async fn write_script(path: &Path, content: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, content).await.map_err(|e| GuestError::io(path, e))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| GuestError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-arg=1,2"), "plain-arg=1,2");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_start_script_contains_guard_and_command() {
        let paths = GuestPaths::new(Path::new("/srv"), "g1");
        let args = vec!["-name".to_string(), "my guest".to_string()];
        let script = start_script(Path::new("/usr/bin/qemu-system-x86_64"), &args, &paths, "g1");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("grep -qa g1 /proc/$PID/cmdline"));
        assert!(script.contains("/usr/bin/qemu-system-x86_64 \\\n    -name \\\n    'my guest'\n"));
    }

    #[test]
    fn test_ifup_script_applies_bandwidth() {
        let mut nic: NicDesc = serde_json::from_value(serde_json::json!({
            "index": 0, "mac": "00:22:00:00:00:01", "bridge": "br0"
        }))
        .unwrap();
        nic.bandwidth = 100;
        let script = ifup_script(&nic);
        assert!(script.contains("master br0"));
        assert!(script.contains("rate 100mbit"));
    }

    #[tokio::test]
    async fn test_write_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("startvm");
        write_script(&path, "#!/bin/bash\n").await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
