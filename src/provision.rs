//! Provisioning of the replacement root inside an isolated context.
//!
//! The replacement tree arrives as a bare distribution export: no
//! kernel, no services enabled, no root password. [`ChrootSession`]
//! binds the host's pseudo-filesystems into the tree so package
//! tooling behaves as if it were running on the target, then the
//! session installs the package set and sets the root password. The
//! binds are a scoped acquisition: released in reverse order on every
//! exit path, with release failures reported but never masking the
//! error that aborted the session.

use crate::config::ComposeConfig;
use crate::error::ComposeError;
use crate::process::Exec;
use anyhow::{anyhow, Context, Result};
use sha_crypt::{sha512_simple, Sha512Params};
use std::fs;
use std::path::{Path, PathBuf};

/// Host pseudo-filesystems bound into the tree for the chroot.
const BOUND_FILESYSTEMS: &[&str] = &["dev", "proc", "sys"];

/// SHA-512 crypt iteration count. The scheme's floor; kept explicit so
/// the cost factor is visible at the call site.
const PASSWORD_ROUNDS: usize = 5_000;

/// Fixed fstab describing the two target partitions.
pub fn render_fstab() -> String {
    concat!(
        "proc /proc proc defaults 0 0\n",
        "/dev/mmcblk0p2 / ext4 defaults,rw 0 1\n",
        "/dev/mmcblk0p1 /boot/firmware vfat defaults,rw,nofail 0 1\n",
    )
    .to_string()
}

/// Single-line hostname file content.
pub fn render_hostname(hostname: &str) -> String {
    format!("{hostname}\n")
}

/// Hash a root password as a salted SHA-512 crypt string (`$6$...`).
///
/// A fast unsalted digest is not acceptable here: the hash lands in
/// the image's shadow database and must resist precomputation.
pub fn hash_root_password(password: &str) -> Result<String> {
    let params = Sha512Params::new(PASSWORD_ROUNDS)
        .map_err(|err| anyhow!("invalid SHA-512 crypt parameters: {err:?}"))?;
    sha512_simple(password, &params).map_err(|err| anyhow!("password hashing failed: {err:?}"))
}

/// A replacement tree with host pseudo-filesystems bound in.
///
/// `close` is idempotent and error-reporting; `Drop` is the
/// best-effort backstop when an error unwinds past the owner.
pub struct ChrootSession {
    tree: PathBuf,
    exec: Exec,
    /// Bind targets in mount order; unmounted in reverse.
    bound: Vec<PathBuf>,
    /// Whether the host resolv.conf was copied in and needs removal.
    resolv_copied: bool,
}

impl ChrootSession {
    /// Bind `/dev`, `/proc`, and `/sys` into the tree.
    ///
    /// If any bind fails, the ones already made are released before
    /// the error returns.
    pub fn open(tree: &Path, exec: Exec) -> Result<Self> {
        let mut session = Self {
            tree: tree.to_path_buf(),
            exec,
            bound: Vec::new(),
            resolv_copied: false,
        };

        for name in BOUND_FILESYSTEMS {
            if let Err(err) = session.bind(name) {
                if let Err(close_err) = session.close() {
                    eprintln!("  Warning: {close_err:#}");
                }
                return Err(err);
            }
        }
        Ok(session)
    }

    fn bind(&mut self, name: &str) -> Result<()> {
        let target = self.tree.join(name);
        fs::create_dir_all(&target)
            .with_context(|| format!("creating bind target '{}'", target.display()))?;

        let result = self
            .exec
            .cmd("mount")
            .args(["--bind"])
            .arg(format!("/{name}"))
            .arg_path(&target)
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(ComposeError::MountFailed {
                device: format!("/{name}"),
                target: target.clone(),
            })
            .with_context(|| {
                format!(
                    "mount --bind exited with code {}: {}",
                    result.code(),
                    result.stderr_trimmed()
                )
            });
        }

        self.bound.push(target);
        Ok(())
    }

    /// Copy the host's resolver config into the tree so name
    /// resolution works inside the chroot. Removed again on close; it
    /// is host configuration, not target content.
    pub fn copy_host_resolver(&mut self) -> Result<()> {
        let dst = self.tree.join("etc/resolv.conf");
        fs::create_dir_all(self.tree.join("etc"))?;
        self.exec
            .cmd("cp")
            .arg("/etc/resolv.conf")
            .arg_path(&dst)
            .error_msg("failed to copy host resolv.conf into the tree")
            .run()?;
        self.resolv_copied = true;
        Ok(())
    }

    /// Run a command inside the chroot, streaming its output.
    pub fn run(&self, command: &[&str]) -> Result<()> {
        let display = command.join(" ");
        println!("  chroot: {display}");
        let status = self
            .exec
            .cmd("chroot")
            .arg_path(&self.tree)
            .args(command)
            .allow_fail()
            .run_interactive()?;
        if !status.success() {
            return Err(ComposeError::ProvisioningFailed {
                command: display,
                code: status.code().unwrap_or(-1),
            }
            .into());
        }
        Ok(())
    }

    /// Release everything the session acquired: the resolv.conf copy,
    /// then the binds in reverse order. Idempotent. All steps are
    /// attempted; failures are collected into one `ReleaseFailed`.
    pub fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        if self.resolv_copied {
            self.resolv_copied = false;
            let result = self
                .exec
                .cmd("rm")
                .args(["-f"])
                .arg_path(&self.tree.join("etc/resolv.conf"))
                .allow_fail()
                .run();
            match result {
                Ok(r) if r.success() => {}
                Ok(r) => failures.push(format!(
                    "removing resolv.conf copy: exit code {}",
                    r.code()
                )),
                Err(err) => failures.push(format!("{err:#}")),
            }
        }

        while let Some(target) = self.bound.pop() {
            let result = self
                .exec
                .cmd("umount")
                .arg_path(&target)
                .allow_fail()
                .run();
            match result {
                Ok(r) if r.success() => {}
                Ok(r) => failures.push(format!(
                    "unbinding '{}': exit code {}: {}",
                    target.display(),
                    r.code(),
                    r.stderr_trimmed()
                )),
                Err(err) => failures.push(format!("{err:#}")),
            }
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
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if self.bound.is_empty() && !self.resolv_copied {
            return;
        }
        if let Err(err) = self.close() {
            eprintln!("  Warning: {err:#}");
        }
    }
}

/// Write `/etc/fstab` into the tree.
pub fn write_fstab(tree: &Path) -> Result<()> {
    fs::create_dir_all(tree.join("etc"))?;
    fs::write(tree.join("etc/fstab"), render_fstab()).context("writing /etc/fstab")
}

/// Write `/etc/hostname` into the tree.
pub fn write_hostname(tree: &Path, hostname: &str) -> Result<()> {
    fs::create_dir_all(tree.join("etc"))?;
    fs::write(tree.join("etc/hostname"), render_hostname(hostname)).context("writing /etc/hostname")
}

/// Bring the replacement tree to a bootable, package-complete,
/// authenticated state.
///
/// The pseudo-filesystem binds are released unconditionally; a release
/// failure after a provisioning failure is reported as a warning and
/// never masks the original error.
pub fn provision(tree: &Path, config: &ComposeConfig, exec: Exec) -> Result<()> {
    println!("=== Provisioning replacement root ===");

    let mut session = ChrootSession::open(tree, exec)?;
    let outcome = provision_inner(&mut session, tree, config);
    let close_outcome = session.close();

    match (outcome, close_outcome) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(close_err)) => Err(close_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            eprintln!("  Warning: cleanup after failed provisioning also failed: {close_err:#}");
            Err(err)
        }
    }
}

fn provision_inner(
    session: &mut ChrootSession,
    tree: &Path,
    config: &ComposeConfig,
) -> Result<()> {
    session.copy_host_resolver()?;
    write_fstab(tree)?;
    write_hostname(tree, &config.hostname)?;

    session.run(&["tdnf", "-y", "update"])?;

    let mut install: Vec<&str> = vec!["tdnf", "-y", "install"];
    install.extend(config.packages.iter().map(|p| p.as_str()));
    session.run(&install)?;

    let hash = hash_root_password(&config.root_password)?;
    session.run(&["usermod", "-p", &hash, "root"])?;

    Ok(())
}
