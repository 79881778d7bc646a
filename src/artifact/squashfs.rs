//! Squashfs image commands and the `filesystem.size` record.

use crate::process::Cmd;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// `mksquashfs` invocation that replaces `image` with a fresh archive of
/// `source`.
///
/// `-noappend` matters: without it mksquashfs adds to an existing image.
pub fn mksquashfs_command(source: &Path, image: &Path, compression: &str) -> Cmd {
    Cmd::new("mksquashfs")
        .arg_path(source)
        .arg_path(image)
        .args(["-noappend", "-comp", compression])
        .error_msg("mksquashfs failed. Install squashfs-tools.")
}

/// `unsquashfs` invocation that unpacks `image` into `target`, overwriting
/// what is there.
pub fn unsquashfs_command(image: &Path, target: &Path) -> Cmd {
    Cmd::new("unsquashfs")
        .args(["-f", "-d"])
        .arg_path(target)
        .arg_path(image)
        .error_msg("unsquashfs failed. Install squashfs-tools.")
}

/// Bytes used by the tree at `root`, as `du -sx --block-size=1` counts them.
///
/// Unreadable subdirectories make `du` exit non-zero while still printing a
/// total, so only a missing total is an error.
pub fn filesystem_size(root: &Path) -> Result<u64> {
    let result = Cmd::new("du")
        .args(["-sx", "--block-size=1"])
        .arg_path(root)
        .allow_fail()
        .run()?;
    if !result.success() {
        log::warn!(
            "du reported errors for {}: {}",
            root.display(),
            result.stderr_trimmed()
        );
    }
    parse_du_total(&result.stdout)
        .with_context(|| format!("could not measure {}: {}", root.display(), result.stderr_trimmed()))
}

/// The byte count from `du -s` output (`<bytes>\t<path>`).
pub fn parse_du_total(output: &str) -> Option<u64> {
    output.lines().last()?.split_whitespace().next()?.parse().ok()
}

pub fn write_size_file(path: &Path, bytes: u64) -> Result<()> {
    fs::write(path, bytes.to_string()).with_context(|| format!("writing {}", path.display()))?;
    log::info!("Wrote {} ({} bytes)", path.display(), bytes);
    Ok(())
}
