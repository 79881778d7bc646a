//! Typed errors for the library seams.
//!
//! Application-level flows use `anyhow::Result` with context. The types here
//! exist where callers need to branch on the failure: a cancelled run is not
//! an error worth a dialog, a full disk gets its own message, and validation
//! failures are shown inline.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Substring that identifies an out-of-space failure in tool output.
pub const DISK_FULL_MESSAGE: &str = "No space left on device";

pub type ProcessResult<T> = Result<T, ProcessError>;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Command failed: {command} (exit={exit_status:?}, signal={signal_status:?}): {output}")]
    Failed {
        command: String,
        exit_status: Option<i32>,
        signal_status: Option<i32>,
        output: String,
    },

    #[error("Command timed out: {command} produced no output for {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// True when the failure text shows the target filesystem ran out of space.
    pub fn is_disk_full(&self) -> bool {
        match self {
            ProcessError::Failed { output, .. } => output.contains(DISK_FULL_MESSAGE),
            ProcessError::Io(e) => {
                e.raw_os_error() == Some(libc::ENOSPC) || e.to_string().contains(DISK_FULL_MESSAGE)
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled)
    }
}

/// Check an `anyhow` chain for a full disk anywhere in its causes.
pub fn is_disk_full(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(process) = cause.downcast_ref::<ProcessError>() {
            return process.is_disk_full();
        }
        cause.to_string().contains(DISK_FULL_MESSAGE)
    })
}

/// Check an `anyhow` chain for a user cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ProcessError>())
        .any(ProcessError::is_cancelled)
}

/// Problems with user-supplied inputs. Reported inline, never fatal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Directory must be an absolute path: {0}")]
    RelativeDirectory(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Directory is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("Unsupported filesystem type '{fs_type}' for {path}; use a Linux filesystem")]
    UnsupportedFilesystem { path: PathBuf, fs_type: String },

    #[error("ISO file not found: {0}")]
    IsoNotFound(PathBuf),

    #[error("Not an ISO 9660 image: {0}")]
    NotAnIso(PathBuf),

    #[error("Project is in use by another Cubic session: {0}")]
    ProjectInUse(PathBuf),

    #[error("Required layout entry '{0}' was not found on the disk")]
    MissingLayout(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_command_detects_disk_full() {
        let err = ProcessError::Failed {
            command: "mksquashfs".to_string(),
            exit_status: Some(1),
            signal_status: None,
            output: "Write failed because No space left on device".to_string(),
        };
        assert!(err.is_disk_full());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn io_enospc_is_disk_full() {
        let err = ProcessError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(err.is_disk_full());
    }

    #[test]
    fn anyhow_chain_is_searched() {
        let err = anyhow::Error::new(ProcessError::Cancelled).context("compressing custom-root");
        assert!(is_cancelled(&err));
        assert!(!is_disk_full(&err));

        let err = anyhow::anyhow!("cp: error writing 'x': No space left on device")
            .context("copying kernel");
        assert!(is_disk_full(&err));
    }
}
