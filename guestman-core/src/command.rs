//! Subprocess helpers for host tools (`qemu-img`, `crictl`, guest scripts).

use crate::error::{GuestError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

fn describe(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run a program to completion and return its trimmed stdout.
#[instrument(skip(args), fields(args = args.len()))]
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!(command = %describe(program, args), "Running command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| GuestError::Subprocess {
            command: describe(program, args),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GuestError::Subprocess {
            command: describe(program, args),
            reason: format!("exit status {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a generated shell script.
pub async fn run_script(script: &Path) -> Result<String> {
    let script = script.to_string_lossy();
    run("/bin/sh", &[script.as_ref()]).await
}
