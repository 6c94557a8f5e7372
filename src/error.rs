//! Typed failure kinds for the composition pipeline.
//!
//! Each stage reports a distinct error kind so callers can tell a
//! corrupt donor image apart from a failed chroot command without
//! string-matching. Errors travel through `anyhow::Result` chains and
//! remain reachable via `downcast_ref::<ComposeError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    /// The donor image could not be bound to a loop device, or its
    /// partition table does not expose the expected two partitions.
    #[error("failed to attach '{image}' to a loop device")]
    AttachFailed { image: PathBuf },

    /// A filesystem check reported corruption it could not repair.
    #[error("unrepairable filesystem corruption on {device} ({checker} exit code {code})")]
    FilesystemCorrupt {
        device: String,
        checker: String,
        code: i32,
    },

    /// A partition could not be mounted at its temporary mount point.
    #[error("failed to mount {device} at '{target}'")]
    MountFailed { device: String, target: PathBuf },

    /// A privileged command inside the chroot exited non-zero.
    #[error("provisioning command `{command}` failed (exit code {code})")]
    ProvisioningFailed { command: String, code: i32 },

    /// An archive/wipe/copy/restore step of the root swap failed.
    ///
    /// There is no rollback: a failure after the wipe leaves the donor
    /// root partition emptied. Run only against a disposable copy.
    #[error("root replacement failed while {step}")]
    ReplacementFailed { step: String },

    /// Cleanup-phase failure. Reported, but never masks the error that
    /// aborted the pipeline.
    #[error("resource release failed: {detail}")]
    ReleaseFailed { detail: String },
}
