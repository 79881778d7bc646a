//! `/proc/self/mountinfo` parsing.
//!
//! Teardown and the chroot exit only call the elevated unmount helpers for
//! paths that are actually mounted.

use std::fs;
use std::path::{Path, PathBuf};

pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Parse mountinfo lines of the form
/// `<id> <parent> <maj:min> <root> <mount point> <opts> [optional...] - <fstype> <source> <superopts>`.
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let (pre, post) = line.split_once(" - ")?;
            let mount_point = pre.split_whitespace().nth(4)?;
            let mut post_fields = post.split_whitespace();
            let fs_type = post_fields.next()?.to_string();
            let source = post_fields.next().unwrap_or_default().to_string();
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_path(mount_point)),
                fs_type,
                source,
            })
        })
        .collect()
}

pub fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Current mount table; empty if it cannot be read.
pub fn read_mounts() -> Vec<MountEntry> {
    match fs::read_to_string(MOUNTINFO_PATH) {
        Ok(content) => parse_mountinfo(&content),
        Err(e) => {
            log::warn!("Unable to read {}: {}", MOUNTINFO_PATH, e);
            Vec::new()
        }
    }
}

pub fn is_mounted(path: &Path, entries: &[MountEntry]) -> bool {
    let target = trim_trailing_slash(path);
    entries
        .iter()
        .any(|e| trim_trailing_slash(&e.mount_point) == target)
}

/// Mount points at or below `root`, deepest first, the order they must be
/// unmounted in.
pub fn mounts_under(root: &Path, entries: &[MountEntry]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = entries
        .iter()
        .map(|e| e.mount_point.clone())
        .filter(|p| p.starts_with(root))
        .collect();
    found.sort();
    found.dedup();
    found.reverse();
    found
}

fn trim_trailing_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.len() > 1 {
        s.trim_end_matches('/').to_string()
    } else {
        s.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
36 28 0:31 / / rw,relatime shared:1 - ext4 /dev/sda3 rw
90 36 7:0 / /work/source-disk ro,relatime - iso9660 /dev/loop0 ro
91 36 0:5 / /work/custom-root/proc rw - proc proc rw
92 36 0:6 / /work/custom-root/dev rw - devtmpfs udev rw
93 92 0:7 / /work/custom-root/dev/pts rw - devpts devpts rw
94 36 0:31 / /mnt/data\\040disk rw - ext4 /dev/sdb1 rw
";

    #[test]
    fn parses_fields() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[1].mount_point, PathBuf::from("/work/source-disk"));
        assert_eq!(entries[1].fs_type, "iso9660");
        assert_eq!(entries[1].source, "/dev/loop0");
        assert_eq!(entries[5].mount_point, PathBuf::from("/mnt/data disk"));
    }

    #[test]
    fn mounted_matches_exact_paths() {
        let entries = parse_mountinfo(SAMPLE);
        assert!(is_mounted(Path::new("/work/source-disk/"), &entries));
        assert!(!is_mounted(Path::new("/work"), &entries));
    }

    #[test]
    fn mounts_under_lists_deepest_first() {
        let entries = parse_mountinfo(SAMPLE);
        let mounts = mounts_under(Path::new("/work/custom-root"), &entries);
        assert_eq!(
            mounts,
            [
                PathBuf::from("/work/custom-root/proc"),
                PathBuf::from("/work/custom-root/dev/pts"),
                PathBuf::from("/work/custom-root/dev"),
            ]
        );
    }
}
