//! Preflight checks for host tool availability.
//!
//! The pipeline orchestrates a dozen external tools; a missing one
//! mid-run would abort after the donor root is already half-replaced.
//! Checking up front turns that into a clean early failure.

use crate::process::Exec;
use anyhow::{bail, Result};

/// Host tools required by the composition pipeline.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("sfdisk", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("dosfsck", "dosfstools"),
    ("fsck.ext4", "e2fsprogs"),
    ("chroot", "coreutils"),
    ("tar", "tar"),
    ("cp", "coreutils"),
    ("mv", "coreutils"),
    ("rm", "coreutils"),
];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with the list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check all tools the pipeline needs, including `sudo` when the
/// process is not already root.
pub fn check_host_tools(exec: Exec) -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    if exec.needs_sudo() {
        check_required_tools(&[("sudo", "sudo")])?;
    }
    Ok(())
}
