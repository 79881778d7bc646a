//! Preflight checks for the host.
//!
//! Opening a project and assembling an ISO both shell out to a handful of
//! tools. Checking for them up front turns a failure halfway through a
//! long extraction into a clear message before anything is touched.
//!
//! # Example
//!
//! ```rust,no_run
//! use cubic::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("mksquashfs") {
//!     println!("squashfs-tools not installed");
//! }
//!
//! let tools = &[("mksquashfs", "squashfs-tools"), ("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::process::privileged;
use anyhow::{bail, Result};
use std::os::unix::fs::PermissionsExt;

/// Check if a command exists on the host system's `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Needed to turn a source ISO into a project.
///
/// Each tuple is (command_name, package_name).
pub const OPEN_TOOLS: &[(&str, &str)] = &[
    ("pkexec", "pkexec"),
    ("rsync", "rsync"),
    ("fdisk", "fdisk"),
    ("df", "coreutils"),
    ("unsquashfs", "squashfs-tools"),
];

/// Needed to build the custom ISO.
pub const ASSEMBLE_TOOLS: &[(&str, &str)] = &[
    ("pkexec", "pkexec"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
    ("du", "coreutils"),
];

/// Fail with one line per missing tool, naming the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    for line in &missing {
        log::error!("Missing host tool:{}", line);
    }
    bail!("Missing required host tools:\n{}", missing.join("\n"))
}

/// The elevated helper must be an executable file.
pub fn check_helper() -> Result<()> {
    let path = privileged::helper_path();
    let executable = std::fs::metadata(&path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !executable {
        bail!(
            "Helper {} is missing or not executable (set {} to override)",
            path.display(),
            privileged::HELPER_ENV
        );
    }
    Ok(())
}

/// Everything [`crate::session::IsoSession::open`] runs.
pub fn check_open_tools() -> Result<()> {
    check_required_tools(OPEN_TOOLS)?;
    check_helper()
}

/// Everything [`crate::artifact::IsoAssembler::assemble`] runs.
pub fn check_assemble_tools() -> Result<()> {
    check_required_tools(ASSEMBLE_TOOLS)?;
    check_helper()
}
