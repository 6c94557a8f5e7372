//! End-to-end composition pipeline.
//!
//! Strict stage order: provision the replacement tree, attach and
//! mount the donor image, resolve the preservation set, swap the root,
//! release everything. Any stage failure aborts the remaining forward
//! steps; release still runs, and a release failure never masks the
//! error that aborted the run.
//!
//! There is no rollback. A failure between wipe and copy leaves the
//! donor root emptied, so run only against a disposable copy of the
//! donor image.

use crate::blockdev::MountedImage;
use crate::config::ComposeConfig;
use crate::process::Exec;
use crate::{fsutil, preflight, preserve, provision, replace};
use anyhow::{bail, Result};
use std::path::Path;

/// Compose a bootable image: donor boot partition and preserved
/// hardware directories, replacement root for everything else.
///
/// The image is mutated in place.
pub fn compose(image: &Path, replacement_tree: &Path, config: &ComposeConfig) -> Result<()> {
    compose_with(image, replacement_tree, config, Exec::detect())
}

/// [`compose`] with an explicit privilege context.
pub fn compose_with(
    image: &Path,
    replacement_tree: &Path,
    config: &ComposeConfig,
    exec: Exec,
) -> Result<()> {
    println!("=== Composing bootable image ===");
    if !image.is_file() {
        bail!("donor image '{}' does not exist", image.display());
    }
    if !replacement_tree.is_dir() {
        bail!(
            "replacement tree '{}' does not exist",
            replacement_tree.display()
        );
    }

    preflight::check_host_tools(exec)?;

    provision::provision(replacement_tree, config, exec)?;

    let summary = fsutil::summarize_tree(replacement_tree)?;
    println!(
        "  Replacement tree: {} entries ({} MB)",
        summary.entries,
        summary.mebibytes()
    );

    let mounted = MountedImage::attach(image, exec)?;
    let outcome = swap_root(&mounted, replacement_tree, config, exec);
    let release_outcome = mounted.release();

    match (outcome, release_outcome) {
        (Ok(()), Ok(())) => {
            println!("=== Image composition complete ===");
            Ok(())
        }
        (Ok(()), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            eprintln!("  Warning: release after failed composition also failed: {release_err:#}");
            Err(err)
        }
    }
}

fn swap_root(
    mounted: &MountedImage,
    replacement_tree: &Path,
    config: &ComposeConfig,
    exec: Exec,
) -> Result<()> {
    println!("=== Replacing root filesystem ===");
    let preserved = preserve::resolve_preserved_dirs(mounted.root_dir(), &config.vendor_prefix)?;
    replace::replace_root(
        mounted.root_dir(),
        replacement_tree,
        &preserved,
        &config.staging_archive_path(),
        exec,
    )
}
