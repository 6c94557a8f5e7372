//! Centralized command execution with consistent error handling.
//!
//! Every external operation in the pipeline (mount, losetup, fsck,
//! tar, chroot) goes through [`Cmd`], which captures stderr and turns
//! non-zero exits into errors carrying the command's identity. [`Exec`]
//! decides whether commands are escalated through sudo; substituting
//! [`Exec::Direct`] lets tests run the same code paths against
//! user-owned fixture trees.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Privilege context for external commands.
///
/// The pipeline needs root for loop devices, mounts, and writes into
/// the mounted donor root. When the process already runs as root the
/// commands execute directly; otherwise each one is prefixed with
/// `sudo`, matching how the tool is normally invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exec {
    /// Run commands as-is (process is root, or test fixtures are user-owned).
    Direct,
    /// Prefix each command with `sudo`.
    Sudo,
}

impl Exec {
    /// Pick the privilege context from the current effective uid.
    pub fn detect() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            Exec::Direct
        } else {
            Exec::Sudo
        }
    }

    /// Returns true if commands will be escalated through sudo.
    pub fn needs_sudo(&self) -> bool {
        matches!(self, Exec::Sudo)
    }

    /// Start building a command in this privilege context.
    ///
    /// Error messages always name `program`, never `sudo`.
    pub fn cmd(&self, program: impl AsRef<str>) -> Cmd {
        let program = program.as_ref();
        match self {
            Exec::Direct => Cmd::new(program),
            Exec::Sudo => Cmd::escalated(program),
        }
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    /// Name reported in errors; differs from `program` under sudo.
    display: String,
    args: Vec<String>,
    current_dir: Option<std::path::PathBuf>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        let program = program.as_ref().to_string();
        Self {
            display: program.clone(),
            program,
            args: Vec::new(),
            current_dir: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Create a command that runs `program` through sudo.
    fn escalated(program: impl AsRef<str>) -> Self {
        let program = program.as_ref().to_string();
        Self {
            display: program.clone(),
            program: "sudo".to_string(),
            args: vec![program],
            current_dir: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// The command identity reported in errors (the real program, not sudo).
    pub fn display_name(&self) -> &str {
        &self.display
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.display))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.display));

            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }

    /// Run the command with inherited stdio (interactive/streaming).
    ///
    /// Output goes directly to the terminal. Use for long-running
    /// commands where the user should see progress (e.g., package
    /// installation inside the chroot).
    pub fn run_interactive(self) -> Result<ExitStatus> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        let status = cmd
            .status()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.display))?;

        if !self.allow_fail && !status.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.display));
            bail!("{} (exit code {})", prefix, status.code().unwrap_or(-1));
        }

        Ok(status)
    }
}
