//! MD5 checksums: `md5sum.txt` on the disk and `<iso>.md5` beside it.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MD5SUM_FILE: &str = "md5sum.txt";

/// Files that change when the ISO is written, so their sums would be stale.
pub const MD5SUM_EXCLUDES: &[&str] = &[MD5SUM_FILE, "boot.catalog", "isolinux/boot.cat"];

pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("reading {}", path.display()))?;
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Regenerate `md5sum.txt` in `disk_root` as `<hash>  ./<path>` lines,
/// sorted by path. Symlinks are not followed. Returns the number of files.
pub fn write_md5sum_file(disk_root: &Path) -> Result<usize> {
    let mut lines = Vec::new();
    for entry in WalkDir::new(disk_root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", disk_root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(disk_root)
            .context("walked outside the disk root")?;
        let name = relative.to_string_lossy();
        if MD5SUM_EXCLUDES.contains(&name.as_ref()) {
            continue;
        }
        lines.push(format!("{}  ./{}\n", md5_file(entry.path())?, name));
    }

    let path = disk_root.join(MD5SUM_FILE);
    fs::write(&path, lines.concat()).with_context(|| format!("writing {}", path.display()))?;
    log::info!("Wrote {} ({} files)", path.display(), lines.len());
    Ok(lines.len())
}

/// Write `<hash>  <filename>` next to the ISO so users can verify it with
/// `md5sum -c` from the same directory.
pub fn write_iso_checksum(iso_path: &Path) -> Result<PathBuf> {
    let hash = md5_file(iso_path)?;
    let filename = iso_path
        .file_name()
        .context("Could not get ISO filename")?
        .to_string_lossy();

    let checksum_path = iso_path.with_extension("md5");
    fs::write(&checksum_path, format!("{}  {}\n", hash, filename))
        .with_context(|| format!("writing {}", checksum_path.display()))?;
    log::info!("MD5 {} written to {}", hash, checksum_path.display());
    Ok(checksum_path)
}
