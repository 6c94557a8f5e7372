//! Pipeline configuration.
//!
//! All knobs have defaults matching the reference Raspberry Pi target;
//! a TOML file can override any subset of them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Packages installed into the replacement root during provisioning.
///
/// Covers init, user management, SSH, networking, shell comfort,
/// documentation, WiFi, and time sync. The target must boot to a
/// loginable, network-reachable system from this set alone.
pub const DEFAULT_PACKAGES: &[&str] = &[
    "systemd",
    "shadow-utils",
    "openssh",
    "iproute",
    "sudo",
    "procps-ng",
    "less",
    "vim",
    "vim-extra",
    "man-pages",
    "man-db",
    "which",
    "wpa_supplicant",
    "file",
    "bash-completion",
    "chrony",
    "dhcpcd",
];

/// Directory-name prefix marking board-vendor trees under `usr/lib`
/// that must survive the root swap.
pub const DEFAULT_VENDOR_PREFIX: &str = "rasp";

/// Filename of the preservation archive while parked outside the root
/// mount during the swap.
const STAGING_ARCHIVE_NAME: &str = "donor-preserve.tar";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ComposeConfig {
    /// Written to `/etc/hostname` in the replacement root.
    pub hostname: String,
    /// Root account password, hashed before it ever reaches the tree.
    pub root_password: String,
    /// Package set installed inside the chroot.
    pub packages: Vec<String>,
    /// Prefix matched against entries directly under `usr/lib` when
    /// resolving the preservation set.
    pub vendor_prefix: String,
    /// Directory outside the root mount where the preservation archive
    /// is parked between wipe and restore.
    pub staging_dir: PathBuf,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            hostname: "azurelinux".to_string(),
            root_password: "azl".to_string(),
            packages: DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect(),
            vendor_prefix: DEFAULT_VENDOR_PREFIX.to_string(),
            staging_dir: std::env::temp_dir(),
        }
    }
}

impl ComposeConfig {
    /// Load a config from a TOML file, filling unset fields with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let config: ComposeConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            bail!("hostname must not be empty");
        }
        if self.packages.is_empty() {
            bail!("package set must not be empty");
        }
        if self.vendor_prefix.is_empty() {
            bail!("vendor_prefix must not be empty");
        }
        Ok(())
    }

    /// Where the preservation archive lives for the duration of the swap.
    pub fn staging_archive_path(&self) -> PathBuf {
        self.staging_dir.join(STAGING_ARCHIVE_NAME)
    }
}
