//! Loop-device attachment, partition verification, and mount lifecycle.
//!
//! A donor image is attached with partition scanning so the kernel
//! exposes `p1`/`p2` sub-device nodes, each partition is fsck'd before
//! it is ever mounted, and both partitions are mounted into fresh
//! temporary directories. Release is the critical contract: unmount in
//! reverse order, detach the loop device, and remove the mount points
//! on every exit path. [`MountedImage::release`] surfaces cleanup
//! errors; `Drop` is the best-effort backstop when a stage above
//! aborted.
//!
//! Only the attachment created by this run is ever detached. Loop
//! devices belonging to other images on the host are never touched.

use crate::error::ComposeError;
use crate::process::Exec;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Partition index of the FAT boot partition.
pub const BOOT_PARTITION: u32 = 1;
/// Partition index of the ext4 root partition.
pub const ROOT_PARTITION: u32 = 2;

/// Pause before the first unmount so in-flight writes from the copy
/// phase settle. A heuristic carried over from observed unmount races
/// on slow SD-image hosts, not a flush guarantee.
const UNMOUNT_SETTLE: Duration = Duration::from_secs(5);

/// `fsck`-family exit code: errors were found and corrected.
const FSCK_CORRECTED: i32 = 1;
/// ext-family exit code: corrected, reboot recommended.
const FSCK_CORRECTED_REBOOT: i32 = 2;

#[derive(Debug, Deserialize)]
struct SfdiskOutput {
    partitiontable: PartitionTable,
}

/// Partition table as reported by `sfdisk --json`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    pub label: String,
    pub device: String,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Deserialize)]
pub struct Partition {
    pub node: String,
    pub start: u64,
    pub size: u64,
    #[serde(rename = "type")]
    pub parttype: String,
}

/// Read the partition table of an attached device.
pub fn partitions_of(dev: &Path, exec: Exec) -> Result<PartitionTable> {
    let result = exec
        .cmd("sfdisk")
        .args(["--json"])
        .arg_path(dev)
        .error_msg(format!("sfdisk could not read '{}'", dev.display()))
        .run()?;
    let parsed: SfdiskOutput = serde_json::from_str(&result.stdout)
        .with_context(|| format!("parsing sfdisk output for '{}'", dev.display()))?;
    Ok(parsed.partitiontable)
}

/// Require the boot + root two-partition layout.
fn verify_layout(table: &PartitionTable) -> Result<()> {
    if table.partitions.len() != 2 {
        anyhow::bail!(
            "expected 2 partitions (boot, root) on {}, found {}",
            table.device,
            table.partitions.len()
        );
    }
    Ok(())
}

/// An exclusive loop-device attachment of one disk image.
///
/// Detached exactly once: explicitly via [`close`](Self::close), or by
/// `Drop` if an error unwinds past the owner.
pub struct LoopDevice {
    /// Present until the device is detached.
    dev: Option<PathBuf>,
    exec: Exec,
}

impl LoopDevice {
    /// Attach `image` to an automatically assigned loop device with
    /// partition scanning enabled.
    pub fn attach(image: &Path, exec: Exec) -> Result<Self> {
        if !image.is_file() {
            return Err(ComposeError::AttachFailed {
                image: image.to_path_buf(),
            })
            .with_context(|| format!("'{}' does not exist or is not a file", image.display()));
        }

        let result = exec
            .cmd("losetup")
            .args(["--find", "--show", "-P"])
            .arg_path(image)
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(ComposeError::AttachFailed {
                image: image.to_path_buf(),
            })
            .with_context(|| {
                format!(
                    "losetup exited with code {}: {}",
                    result.code(),
                    result.stderr_trimmed()
                )
            });
        }

        let dev = PathBuf::from(result.stdout_trimmed());
        println!("  Attached {} -> {}", image.display(), dev.display());
        Ok(Self {
            dev: Some(dev),
            exec,
        })
    }

    /// Path of the loop device node.
    pub fn path(&self) -> &Path {
        // The option is only taken on detach, which consumes or drops self.
        self.dev.as_deref().expect("loop device already detached")
    }

    /// Device node of partition `index` (1-based), e.g. `/dev/loop0p2`.
    pub fn partition(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}p{}", self.path().display(), index))
    }

    fn impl_close(&mut self) -> Result<()> {
        let Some(dev) = self.dev.take() else {
            return Ok(());
        };
        self.exec
            .cmd("losetup")
            .args(["-d"])
            .arg_path(&dev)
            .error_msg(format!("failed to detach {}", dev.display()))
            .run()?;
        Ok(())
    }

    /// Detach the loop device.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if let Err(err) = self.impl_close() {
            eprintln!("  Warning: {err:#}");
        }
    }
}

/// Run `dosfsck -a` against the FAT boot partition.
///
/// Exit 0 is clean, 1 means repairs were made; anything else is
/// corruption we must not mount over.
pub fn check_boot_filesystem(device: &Path, exec: Exec) -> Result<()> {
    let result = exec.cmd("dosfsck").arg("-a").arg_path(device).allow_fail().run()?;
    match result.code() {
        0 | FSCK_CORRECTED => Ok(()),
        code => Err(ComposeError::FilesystemCorrupt {
            device: device.display().to_string(),
            checker: "dosfsck".to_string(),
            code,
        })
        .with_context(|| result.stderr_trimmed().to_string()),
    }
}

/// Run `fsck.ext4 -y` against the root partition.
///
/// Exit codes are a bitmask: 1 = corrected, 2 = corrected but reboot
/// recommended. Bits above that mean uncorrected errors or operational
/// failure.
pub fn check_root_filesystem(device: &Path, exec: Exec) -> Result<()> {
    let result = exec
        .cmd("fsck.ext4")
        .arg("-y")
        .arg_path(device)
        .allow_fail()
        .run()?;
    let code = result.code();
    if code <= (FSCK_CORRECTED | FSCK_CORRECTED_REBOOT) && code >= 0 {
        return Ok(());
    }
    Err(ComposeError::FilesystemCorrupt {
        device: device.display().to_string(),
        checker: "fsck.ext4".to_string(),
        code,
    })
    .with_context(|| result.stderr_trimmed().to_string())
}

/// One active mount of a partition at a temporary directory.
struct Mount {
    device: PathBuf,
    /// Present until the mount point is removed during release.
    target: Option<TempDir>,
    active: bool,
    exec: Exec,
}

impl Mount {
    fn new(device: PathBuf, label: &str, exec: Exec) -> Result<Self> {
        let target = TempDir::with_prefix(format!("mnt_{label}_"))
            .context("creating temporary mount point")?;

        let result = exec
            .cmd("mount")
            .arg_path(&device)
            .arg_path(target.path())
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(ComposeError::MountFailed {
                device: device.display().to_string(),
                target: target.path().to_path_buf(),
            })
            .with_context(|| {
                format!(
                    "mount exited with code {}: {}",
                    result.code(),
                    result.stderr_trimmed()
                )
            });
        }

        println!("  Mounted {} at {}", device.display(), target.path().display());
        Ok(Self {
            device,
            target: Some(target),
            active: true,
            exec,
        })
    }

    fn path(&self) -> &Path {
        // The option is only taken in remove_dir, after unmount.
        self.target
            .as_ref()
            .expect("mount point already removed")
            .path()
    }

    /// Unmount, falling back to a lazy unmount if the target is busy.
    fn unmount(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        let result = self
            .exec
            .cmd("umount")
            .arg_path(self.path())
            .allow_fail()
            .run()?;
        if result.success() {
            return Ok(());
        }

        // Strongest recovery available: detach from the namespace now,
        // let the kernel finish when the last user goes away.
        self.exec
            .cmd("umount")
            .args(["-l"])
            .arg_path(self.path())
            .error_msg(format!("failed to unmount {}", self.device.display()))
            .run()?;
        Ok(())
    }

    fn remove_dir(&mut self) -> Result<()> {
        if let Some(target) = self.target.take() {
            target.close().context("removing mount point directory")?;
        }
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.unmount() {
                eprintln!("  Warning: {err:#}");
            }
        }
    }
}

/// A donor image attached, checked, and mounted: boot and root
/// partitions live at temporary directories until release.
pub struct MountedImage {
    loopdev: LoopDevice,
    boot: Mount,
    root: Mount,
    released: bool,
}

impl MountedImage {
    /// Attach `image`, verify its layout and filesystems, and mount
    /// both partitions.
    ///
    /// On any failure the partially acquired resources (loop device,
    /// boot mount) are released before the error returns.
    pub fn attach(image: &Path, exec: Exec) -> Result<Self> {
        println!("=== Mounting donor image ===");
        let loopdev = LoopDevice::attach(image, exec)?;

        let table = partitions_of(loopdev.path(), exec).map_err(|err| {
            err.context(ComposeError::AttachFailed {
                image: image.to_path_buf(),
            })
        })?;
        verify_layout(&table).map_err(|err| {
            err.context(ComposeError::AttachFailed {
                image: image.to_path_buf(),
            })
        })?;

        let boot_dev = loopdev.partition(BOOT_PARTITION);
        let root_dev = loopdev.partition(ROOT_PARTITION);

        println!("  Checking filesystems...");
        check_boot_filesystem(&boot_dev, exec)?;
        check_root_filesystem(&root_dev, exec)?;

        let boot = Mount::new(boot_dev, "boot", exec)?;
        let root = Mount::new(root_dev, "root", exec)?;

        Ok(Self {
            loopdev,
            boot,
            root,
            released: false,
        })
    }

    /// Mount point of the FAT boot partition.
    pub fn boot_dir(&self) -> &Path {
        self.boot.path()
    }

    /// Mount point of the ext4 root partition.
    pub fn root_dir(&self) -> &Path {
        self.root.path()
    }

    fn impl_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Give in-flight writes from the copy phase a moment to land.
        // TODO: replace with confirmed flush semantics (syncfs on the
        // root mount) once the unmount races are reproducible in CI.
        thread::sleep(UNMOUNT_SETTLE);

        let mut failures = Vec::new();

        // Reverse order of mounting: root was mounted last.
        if let Err(err) = self.root.unmount() {
            failures.push(format!("{err:#}"));
        }
        if let Err(err) = self.boot.unmount() {
            failures.push(format!("{err:#}"));
        }
        if let Err(err) = self.loopdev.impl_close() {
            failures.push(format!("{err:#}"));
        }
        if let Err(err) = self.root.remove_dir() {
            failures.push(format!("{err:#}"));
        }
        if let Err(err) = self.boot.remove_dir() {
            failures.push(format!("{err:#}"));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ComposeError::ReleaseFailed {
                detail: failures.join("; "),
            }
            .into())
        }
    }

    /// Unmount both partitions, detach the loop device, and remove the
    /// temporary mount points. Every step is attempted even if an
    /// earlier one fails; the first group of failures is reported.
    pub fn release(mut self) -> Result<()> {
        println!("=== Releasing donor image ===");
        self.impl_release()
    }
}

impl Drop for MountedImage {
    fn drop(&mut self) {
        if let Err(err) = self.impl_release() {
            eprintln!("  Warning: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Exec;

    const TWO_PARTITION_TABLE: &str = r#"
    {
        "partitiontable": {
            "label": "dos",
            "id": "0x5452574f",
            "device": "/dev/loop0",
            "unit": "sectors",
            "partitions": [
                {
                    "node": "/dev/loop0p1",
                    "start": 8192,
                    "size": 1048576,
                    "type": "c"
                },
                {
                    "node": "/dev/loop0p2",
                    "start": 1056768,
                    "size": 4194304,
                    "type": "83"
                }
            ]
        }
    }
    "#;

    #[test]
    fn test_parse_sfdisk_output() {
        let parsed: SfdiskOutput = serde_json::from_str(TWO_PARTITION_TABLE).unwrap();
        let table = parsed.partitiontable;
        assert_eq!(table.device, "/dev/loop0");
        assert_eq!(table.partitions.len(), 2);
        assert_eq!(table.partitions[0].node, "/dev/loop0p1");
        assert_eq!(table.partitions[1].parttype, "83");
    }

    #[test]
    fn test_verify_layout_accepts_two_partitions() {
        let parsed: SfdiskOutput = serde_json::from_str(TWO_PARTITION_TABLE).unwrap();
        assert!(verify_layout(&parsed.partitiontable).is_ok());
    }

    #[test]
    fn test_verify_layout_rejects_single_partition() {
        let mut parsed: SfdiskOutput = serde_json::from_str(TWO_PARTITION_TABLE).unwrap();
        parsed.partitiontable.partitions.pop();
        let err = verify_layout(&parsed.partitiontable).unwrap_err();
        assert!(err.to_string().contains("expected 2 partitions"));
    }

    #[test]
    fn test_attach_missing_image_is_attach_failed() {
        let err = LoopDevice::attach(Path::new("/nonexistent_image_12345.img"), Exec::Direct)
            .err()
            .unwrap();
        let kind = err.downcast_ref::<ComposeError>().unwrap();
        assert!(matches!(kind, ComposeError::AttachFailed { .. }));
    }

    #[test]
    fn test_partition_node_naming() {
        let dev = LoopDevice {
            dev: Some(PathBuf::from("/dev/loop7")),
            exec: Exec::Direct,
        };
        assert_eq!(dev.partition(1), PathBuf::from("/dev/loop7p1"));
        assert_eq!(dev.partition(2), PathBuf::from("/dev/loop7p2"));
        // Avoid a real losetup -d in the test environment.
        std::mem::forget(dev);
    }
}
