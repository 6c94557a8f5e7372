//! Resolves which donor-root directories must survive the root swap.
//!
//! The donor image carries hardware-specific content the replacement
//! distribution cannot provide: kernel modules matching the donor
//! kernel, firmware blobs, and board-vendor library trees. The rules
//! are fixed and additive; the result is recomputed fresh on every run
//! from the mounted root's current listing.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Fixed-path preservation rules, applied in order.
pub const FIXED_PRESERVED_DIRS: &[&str] = &["usr/lib/modules", "usr/src", "usr/lib/firmware"];

/// Compute the preservation set for a mounted donor root.
///
/// Rules, each independently additive:
/// 1. `usr/lib/modules` if present
/// 2. `usr/src` if present
/// 3. `usr/lib/firmware` if present
/// 4. every entry directly under `usr/lib` whose name starts with
///    `vendor_prefix`
///
/// Returns relative paths in rule order; every returned path exists
/// under `root` at resolution time. An empty set is valid.
pub fn resolve_preserved_dirs(root: &Path, vendor_prefix: &str) -> Result<Vec<PathBuf>> {
    let mut preserved: Vec<PathBuf> = Vec::new();

    for fixed in FIXED_PRESERVED_DIRS {
        if root.join(fixed).exists() {
            preserved.push(PathBuf::from(fixed));
        } else {
            println!("  No {fixed} in donor root, skipping");
        }
    }

    let usr_lib = root.join("usr/lib");
    if usr_lib.is_dir() {
        let mut entries: Vec<String> = Vec::new();
        for entry in fs::read_dir(&usr_lib)
            .with_context(|| format!("listing '{}'", usr_lib.display()))?
        {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(vendor_prefix) {
                    entries.push(name.to_string());
                }
            }
        }
        // Directory iteration order is not stable; the set must be.
        entries.sort();
        for name in entries {
            let path = Path::new("usr/lib").join(name);
            if !preserved.contains(&path) {
                preserved.push(path);
            }
        }
    }

    for path in &preserved {
        println!("  Preserving {}", path.display());
    }
    Ok(preserved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn mkdirs(root: &Path, dirs: &[&str]) {
        for dir in dirs {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
    }

    #[test]
    fn test_empty_root_yields_empty_set() {
        let dir = TempDir::new().unwrap();
        let set = resolve_preserved_dirs(dir.path(), "rasp").unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_full_set_in_rule_order() {
        let dir = TempDir::new().unwrap();
        mkdirs(
            dir.path(),
            &["usr/lib/modules", "usr/src", "usr/lib/firmware", "usr/lib/raspberrypi-sys-mods"],
        );

        let set = resolve_preserved_dirs(dir.path(), "rasp").unwrap();
        assert_eq!(
            set,
            vec![
                PathBuf::from("usr/lib/modules"),
                PathBuf::from("usr/src"),
                PathBuf::from("usr/lib/firmware"),
                PathBuf::from("usr/lib/raspberrypi-sys-mods"),
            ]
        );
    }

    #[test]
    fn test_each_rule_is_independent() {
        let dir = TempDir::new().unwrap();
        mkdirs(dir.path(), &["usr/src", "usr/lib/raspi-config"]);

        let set = resolve_preserved_dirs(dir.path(), "rasp").unwrap();
        assert_eq!(
            set,
            vec![PathBuf::from("usr/src"), PathBuf::from("usr/lib/raspi-config")]
        );
    }

    #[test]
    fn test_vendor_prefix_matches_files_too() {
        // The rule covers any entry under usr/lib, not just directories.
        let dir = TempDir::new().unwrap();
        mkdirs(dir.path(), &["usr/lib"]);
        fs::write(dir.path().join("usr/lib/rasp-overlay.dtb"), b"dtb").unwrap();

        let set = resolve_preserved_dirs(dir.path(), "rasp").unwrap();
        assert_eq!(set, vec![PathBuf::from("usr/lib/rasp-overlay.dtb")]);
    }

    #[test]
    fn test_vendor_entries_sorted() {
        let dir = TempDir::new().unwrap();
        mkdirs(
            dir.path(),
            &["usr/lib/raspz", "usr/lib/raspa", "usr/lib/other"],
        );

        let set = resolve_preserved_dirs(dir.path(), "rasp").unwrap();
        assert_eq!(
            set,
            vec![PathBuf::from("usr/lib/raspa"), PathBuf::from("usr/lib/raspz")]
        );
    }

    #[test]
    fn test_prefix_overlapping_fixed_rule_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        mkdirs(dir.path(), &["usr/lib/firmware"]);

        let set = resolve_preserved_dirs(dir.path(), "firm").unwrap();
        assert_eq!(set, vec![PathBuf::from("usr/lib/firmware")]);
    }

    #[test]
    fn test_non_matching_entries_ignored() {
        let dir = TempDir::new().unwrap();
        mkdirs(dir.path(), &["usr/lib/systemd", "usr/lib/udev"]);

        let set = resolve_preserved_dirs(dir.path(), "rasp").unwrap();
        assert!(set.is_empty());
    }
}
