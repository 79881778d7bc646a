//! Centralized command execution.
//!
//! [`Cmd`] describes a command (program, argv, working directory, error
//! prefix). It can be run two ways:
//!
//! - [`Cmd::run`] executes it directly with captured stdout/stderr. Used for
//!   short checks (`df`, `dpkg-query`, `fdisk`, `xorriso -report_el_torito`).
//! - [`ProcessRunner`] executes it under a pseudo-TTY, the way long-running
//!   tools expect to be driven, with a cancellable "current process" slot.

mod pty;
mod runner;

pub mod privileged;

pub use pty::{AsyncProcess, Chunk, Expect, DEFAULT_TIMEOUT};
pub(crate) use pty::signal_group;
pub use runner::{is_alive, CancelToken, ProcessOutput, ProcessRunner};

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

/// Result of a captured (non-TTY) command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// A single command string, interpreted by `sh -c`.
    pub fn shell(command: impl AsRef<str>) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    /// Build from a list where element 0 is the program.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut iter = argv.into_iter();
        let program = iter.next()?;
        Some(Self::new(program).args(iter))
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

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

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// True when this runs through `pkexec` and therefore as root.
    pub fn is_elevated(&self) -> bool {
        Path::new(&self.program)
            .file_name()
            .is_some_and(|name| name == "pkexec")
    }

    /// Convert into a `std::process::Command` with program, args and cwd set.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let output = self.to_command().output().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program)
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));

            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }
}

impl fmt::Display for Cmd {
    /// Space-joined command line. For `pkexec <helper> ...` the helper's
    /// directory is dropped so logs read `pkexec cubic-helper delete-path ...`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for (index, arg) in self.args.iter().enumerate() {
            if index == 0 && self.is_elevated() && privileged::is_helper_path(arg) {
                let name = Path::new(arg)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| arg.clone());
                write!(f, " {}", name)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("No such file") || msg.contains("cannot access"));
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Custom step failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("Custom step failed"));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_run_in_directory() {
        let result = Cmd::new("pwd").dir(Path::new("/tmp")).run().unwrap();
        assert!(result.stdout_trimmed().contains("tmp"));
    }

    #[test]
    fn test_from_argv_splits_program() {
        let cmd = Cmd::from_argv(["mksquashfs", "a", "b"]).unwrap();
        assert_eq!(cmd.program(), "mksquashfs");
        assert_eq!(cmd.get_args(), ["a", "b"]);
        assert!(Cmd::from_argv(Vec::<String>::new()).is_none());
    }

    #[test]
    fn test_display_elides_helper_directory() {
        let cmd = Cmd::new("pkexec")
            .arg(privileged::DEFAULT_HELPER)
            .arg("delete-path")
            .arg("/work/custom-root");
        assert_eq!(
            cmd.to_string(),
            "pkexec cubic-helper delete-path /work/custom-root"
        );

        let plain = Cmd::new("rsync").arg("/usr/libexec/cubic/cubic-helper");
        assert_eq!(plain.to_string(), "rsync /usr/libexec/cubic/cubic-helper");
    }
}
