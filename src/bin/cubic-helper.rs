//! cubic-helper - privileged operations for Cubic, run through `pkexec`.

use anyhow::{bail, Result};

fn main() -> Result<()> {
    // SAFETY: geteuid(2) cannot fail and touches no memory.
    if unsafe { libc::geteuid() } != 0 {
        bail!("cubic-helper must be run as root (through pkexec)");
    }
    let args: Vec<String> = std::env::args().skip(1).collect();
    cubic::helper::run(&args)
}
