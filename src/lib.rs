//! Rebase a donor SD-card image onto a replacement root filesystem.
//!
//! A donor image (e.g. a vendor-published Raspberry Pi image) supplies
//! the boot partition, kernel, and board firmware; a replacement tree
//! (e.g. a container-image export of another distribution) supplies
//! everything else. This crate owns the composition pipeline between
//! those two inputs:
//!
//! - **Provisioning** - chroot the replacement tree with host
//!   pseudo-filesystems bound in, install the package set, set the
//!   root password
//! - **Block device mounting** - loop-attach the donor image, fsck and
//!   mount its boot and root partitions
//! - **Preservation** - resolve which donor directories (kernel
//!   modules, firmware, vendor trees) must survive
//! - **Replacement** - archive, wipe, copy, restore
//!
//! Acquiring the donor image and the replacement tree, compressing the
//! result, and the CLI around all of this are external collaborators.
//!
//! # Architecture
//!
//! ```text
//! provision::provision()        replacement tree -> bootable tree
//!         │
//! blockdev::MountedImage        donor image -> /dev/loopNp{1,2} mounted
//!         │
//! preserve::resolve_preserved_dirs()
//!         │
//! replace::replace_root()       the swap itself
//!         │
//! MountedImage::release()       always runs, success or abort
//! ```
//!
//! Every privileged operation is an external command routed through
//! [`process::Exec`]; resource handles ([`blockdev::LoopDevice`],
//! [`blockdev::MountedImage`], [`provision::ChrootSession`]) release
//! on every exit path.
//!
//! The pipeline mutates the donor image in place and has no rollback:
//! operate on a disposable copy.

pub mod blockdev;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod pipeline;
pub mod preflight;
pub mod preserve;
pub mod process;
pub mod provision;
pub mod replace;

pub use config::ComposeConfig;
pub use error::ComposeError;
pub use pipeline::{compose, compose_with};
pub use process::Exec;
