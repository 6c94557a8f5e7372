//! The root-filesystem swap.
//!
//! Strict order, no partial-success checkpointing: archive the
//! preservation set and park it outside the root mount, wipe every
//! top-level entry except `boot`, copy the replacement tree in, then
//! overlay the archived content back and delete the archive. A failure
//! after the wipe leaves the donor root indeterminate; the documented
//! contract is to operate only on a disposable copy of the donor
//! image.

use crate::error::ComposeError;
use crate::process::Exec;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the archive while it is still inside the mounted root.
const ARCHIVE_NAME: &str = "donor-preserve.tar";

/// Replace the mounted donor root with the replacement tree,
/// preserving `preserved` (paths relative to `root_mount`).
///
/// `staging_archive` must point outside the root mount; the archive
/// parks there while the wipe runs and never outlives this call.
pub fn replace_root(
    root_mount: &Path,
    replacement: &Path,
    preserved: &[PathBuf],
    staging_archive: &Path,
    exec: Exec,
) -> Result<()> {
    let archived = if preserved.is_empty() {
        println!("  Nothing to preserve, skipping archive");
        false
    } else {
        archive_preserved(root_mount, preserved, staging_archive, exec).with_context(|| {
            ComposeError::ReplacementFailed {
                step: "archiving the preservation set".to_string(),
            }
        })?;
        true
    };

    wipe_root(root_mount, exec).with_context(|| ComposeError::ReplacementFailed {
        step: "wiping the donor root".to_string(),
    })?;

    copy_replacement(replacement, root_mount, exec).with_context(|| {
        ComposeError::ReplacementFailed {
            step: "copying the replacement tree".to_string(),
        }
    })?;

    if archived {
        restore_preserved(root_mount, staging_archive, exec).with_context(|| {
            ComposeError::ReplacementFailed {
                step: "restoring the preservation set".to_string(),
            }
        })?;
    }

    Ok(())
}

/// Archive the preserved paths (relative to the root mount) and move
/// the archive outside the mount so the wipe cannot touch it.
fn archive_preserved(
    root_mount: &Path,
    preserved: &[PathBuf],
    staging_archive: &Path,
    exec: Exec,
) -> Result<()> {
    println!("  Archiving {} preserved path(s)...", preserved.len());
    let archive_inside = root_mount.join(ARCHIVE_NAME);

    let mut cmd = exec
        .cmd("tar")
        .arg("cf")
        .arg_path(&archive_inside)
        .dir(root_mount)
        .error_msg("tar failed to archive preserved directories");
    for path in preserved {
        cmd = cmd.arg_path(path);
    }
    cmd.run()?;

    exec.cmd("mv")
        .arg_path(&archive_inside)
        .arg_path(staging_archive)
        .error_msg("failed to move preservation archive out of the root mount")
        .run()?;
    Ok(())
}

/// Delete every top-level entry of the root mount except `boot`.
fn wipe_root(root_mount: &Path, exec: Exec) -> Result<()> {
    println!("  Wiping donor root (keeping boot)...");
    for entry in
        fs::read_dir(root_mount).with_context(|| format!("listing '{}'", root_mount.display()))?
    {
        let entry = entry?;
        if entry.file_name() == "boot" {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            exec.cmd("rm")
                .args(["-rf"])
                .arg_path(&path)
                .error_msg(format!("failed to remove '{}'", path.display()))
                .run()?;
        } else {
            exec.cmd("rm")
                .args(["-f"])
                .arg_path(&path)
                .error_msg(format!("failed to remove '{}'", path.display()))
                .run()?;
        }
    }
    Ok(())
}

/// Copy every top-level entry of the replacement tree into the root
/// mount. Directories keep their attributes; files are copied plain.
fn copy_replacement(replacement: &Path, root_mount: &Path, exec: Exec) -> Result<()> {
    println!("  Copying replacement tree...");
    for entry in
        fs::read_dir(replacement).with_context(|| format!("listing '{}'", replacement.display()))?
    {
        let entry = entry?;
        let src = entry.path();
        let dst = root_mount.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            exec.cmd("cp")
                .arg("-a")
                .arg_path(&src)
                .arg_path(&dst)
                .error_msg(format!("failed to copy '{}'", src.display()))
                .run()?;
        } else {
            exec.cmd("cp")
                .arg_path(&src)
                .arg_path(&dst)
                .error_msg(format!("failed to copy '{}'", src.display()))
                .run()?;
        }
    }
    Ok(())
}

/// Extract the parked archive over the freshly copied tree, then
/// delete it. The archive must never outlive the pipeline run.
fn restore_preserved(root_mount: &Path, staging_archive: &Path, exec: Exec) -> Result<()> {
    println!("  Restoring preserved directories...");
    exec.cmd("tar")
        .arg("xf")
        .arg_path(staging_archive)
        .arg("-C")
        .arg_path(root_mount)
        .error_msg("tar failed to restore preserved directories")
        .run()?;
    exec.cmd("rm")
        .args(["-f"])
        .arg_path(staging_archive)
        .error_msg("failed to delete preservation archive")
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preserve::resolve_preserved_dirs;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Map of relative file path -> content for a whole tree.
    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut map = BTreeMap::new();
        for entry in walkdir::WalkDir::new(root).min_depth(1) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
                map.insert(rel, fs::read(entry.path()).unwrap());
            }
        }
        map
    }

    struct Fixture {
        root: TempDir,
        replacement: TempDir,
        staging: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: TempDir::new().unwrap(),
                replacement: TempDir::new().unwrap(),
                staging: TempDir::new().unwrap(),
            }
        }

        fn staging_archive(&self) -> PathBuf {
            self.staging.path().join("donor-preserve.tar")
        }
    }

    #[test]
    fn test_preserved_content_survives_swap_byte_identical() {
        let fx = Fixture::new();
        write(fx.root.path(), "usr/lib/modules/6.6/net.ko", b"module-bytes");
        write(fx.root.path(), "usr/lib/firmware/brcm/blob.bin", b"firmware-bytes");
        write(fx.root.path(), "usr/src/header.h", b"header");
        write(fx.root.path(), "etc/passwd", b"root:x:0:0");
        write(fx.replacement.path(), "etc/os-release", b"NAME=other");

        let preserved = resolve_preserved_dirs(fx.root.path(), "rasp").unwrap();
        assert_eq!(preserved.len(), 3);

        replace_root(
            fx.root.path(),
            fx.replacement.path(),
            &preserved,
            &fx.staging_archive(),
            Exec::Direct,
        )
        .unwrap();

        let after = snapshot(fx.root.path());
        assert_eq!(
            after.get(Path::new("usr/lib/modules/6.6/net.ko")).unwrap(),
            b"module-bytes"
        );
        assert_eq!(
            after.get(Path::new("usr/lib/firmware/brcm/blob.bin")).unwrap(),
            b"firmware-bytes"
        );
        assert_eq!(after.get(Path::new("usr/src/header.h")).unwrap(), b"header");
    }

    #[test]
    fn test_non_preserved_entries_wiped_and_boot_untouched() {
        let fx = Fixture::new();
        write(fx.root.path(), "boot/kernel.img", b"kernel-image");
        write(fx.root.path(), "etc/passwd", b"donor-passwd");
        write(fx.root.path(), "home/pi/notes.txt", b"notes");
        write(fx.root.path(), "stray-file", b"stray");
        write(fx.replacement.path(), "etc/os-release", b"NAME=other");

        let preserved = resolve_preserved_dirs(fx.root.path(), "rasp").unwrap();
        assert!(preserved.is_empty());

        replace_root(
            fx.root.path(),
            fx.replacement.path(),
            &preserved,
            &fx.staging_archive(),
            Exec::Direct,
        )
        .unwrap();

        // etc came back from the replacement tree; the donor file must not.
        assert!(!fx.root.path().join("etc/passwd").exists());
        assert!(!fx.root.path().join("home").exists());
        assert!(!fx.root.path().join("stray-file").exists());
        assert_eq!(
            fs::read(fx.root.path().join("boot/kernel.img")).unwrap(),
            b"kernel-image"
        );
        assert_eq!(
            fs::read(fx.root.path().join("etc/os-release")).unwrap(),
            b"NAME=other"
        );
    }

    #[test]
    fn test_archive_round_trip_restores_identical_tree() {
        let fx = Fixture::new();
        write(fx.root.path(), "usr/lib/modules/a/one.ko", b"one");
        write(fx.root.path(), "usr/lib/modules/b/two.ko", b"two");
        write(fx.root.path(), "usr/src/linux/Makefile", b"all:");
        let before = snapshot(&fx.root.path().join("usr"));

        let preserved = resolve_preserved_dirs(fx.root.path(), "rasp").unwrap();
        archive_preserved(
            fx.root.path(),
            &preserved,
            &fx.staging_archive(),
            Exec::Direct,
        )
        .unwrap();

        // Originals deleted, then restored from the archive alone.
        fs::remove_dir_all(fx.root.path().join("usr")).unwrap();
        restore_preserved(fx.root.path(), &fx.staging_archive(), Exec::Direct).unwrap();

        let after = snapshot(&fx.root.path().join("usr"));
        assert_eq!(before, after);
        // Consumed: the archive must not outlive the run.
        assert!(!fx.staging_archive().exists());
    }

    #[test]
    fn test_empty_preservation_set_skips_archive() {
        let fx = Fixture::new();
        write(fx.root.path(), "etc/passwd", b"donor");
        write(fx.replacement.path(), "etc/os-release", b"NAME=other");

        replace_root(
            fx.root.path(),
            fx.replacement.path(),
            &[],
            &fx.staging_archive(),
            Exec::Direct,
        )
        .unwrap();

        assert!(!fx.staging_archive().exists());
        assert_eq!(
            fs::read(fx.root.path().join("etc/os-release")).unwrap(),
            b"NAME=other"
        );
    }

    #[test]
    fn test_end_to_end_scenario() {
        let fx = Fixture::new();
        // Donor root: board modules, donor config, boot firmware.
        write(fx.root.path(), "usr/lib/modules/y.ko", b"donor-module");
        write(fx.root.path(), "etc/passwd", b"donor-passwd");
        write(fx.root.path(), "boot/kernel.img", b"kernel");
        // Replacement tree: its own modules and distro identity.
        write(fx.replacement.path(), "usr/lib/modules/x.ko", b"new-module");
        write(fx.replacement.path(), "etc/os-release", b"NAME=replacement");

        let preserved = resolve_preserved_dirs(fx.root.path(), "rasp").unwrap();
        assert_eq!(preserved, vec![PathBuf::from("usr/lib/modules")]);

        replace_root(
            fx.root.path(),
            fx.replacement.path(),
            &preserved,
            &fx.staging_archive(),
            Exec::Direct,
        )
        .unwrap();

        // Boot content unchanged.
        assert_eq!(fs::read(fx.root.path().join("boot/kernel.img")).unwrap(), b"kernel");
        // Donor modules preserved, overlaid onto the replacement tree.
        assert_eq!(
            fs::read(fx.root.path().join("usr/lib/modules/y.ko")).unwrap(),
            b"donor-module"
        );
        // Replacement content present.
        assert_eq!(
            fs::read(fx.root.path().join("etc/os-release")).unwrap(),
            b"NAME=replacement"
        );
        // Donor /etc/passwd must not survive (not in the replacement tree).
        assert!(!fx.root.path().join("etc/passwd").exists());
    }

    #[test]
    fn test_missing_replacement_tree_is_replacement_failed() {
        let fx = Fixture::new();
        write(fx.root.path(), "etc/passwd", b"donor");

        let err = replace_root(
            fx.root.path(),
            Path::new("/nonexistent_tree_12345"),
            &[],
            &fx.staging_archive(),
            Exec::Direct,
        )
        .unwrap_err();

        let kind = err.downcast_ref::<ComposeError>().unwrap();
        assert!(matches!(kind, ComposeError::ReplacementFailed { .. }));
    }
}
