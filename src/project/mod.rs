//! A customization project: one working directory and everything under it.
//!
//! ```text
//! <work_dir>/
//!   cubic.conf              persisted state
//!   source-disk/            source ISO mount point
//!   custom-disk/            writable copy of the disk tree
//!   custom-root/            extracted root filesystem (root-owned)
//!   partition-<n>.img       appended partitions, n in 1..=9
//!   .#custom-root.lck       held while the root is being edited
//!   *.iso, *.md5            generated outputs
//!   cubic.<stamp>.log       per-run log
//! ```

pub mod config;
pub mod naming;
pub mod options;

pub use config::ProjectConfig;
pub use options::{Compression, OptionsBundle};

use crate::error::ValidationError;
use crate::process::Cmd;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;

pub const CONFIG_FILE_NAME: &str = "cubic.conf";
pub const ISO_MOUNT_DIRECTORY: &str = "source-disk";
pub const CUSTOM_ROOT_DIRECTORY: &str = "custom-root";
pub const CUSTOM_DISK_DIRECTORY: &str = "custom-disk";
pub const LOCK_FILE_NAME: &str = ".#custom-root.lck";
pub const MAX_PARTITIONS: usize = 9;

/// Filesystems that cannot hold a root filesystem (no ownership, no
/// special files).
pub const UNSUPPORTED_FILESYSTEMS: &[&str] = &["vfat", "msdos", "exfat", "ntfs", "fuseblk"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    work_dir: PathBuf,
}

impl Project {
    /// `work_dir` must be absolute. Existing directories are canonicalized.
    pub fn new(work_dir: &Path) -> Result<Self, ValidationError> {
        if !work_dir.is_absolute() {
            return Err(ValidationError::RelativeDirectory(work_dir.to_path_buf()));
        }
        let work_dir = work_dir
            .canonicalize()
            .unwrap_or_else(|_| normalize(work_dir));
        Ok(Self { work_dir })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn iso_mount_point(&self) -> PathBuf {
        self.work_dir.join(ISO_MOUNT_DIRECTORY)
    }

    pub fn custom_root(&self) -> PathBuf {
        self.work_dir.join(CUSTOM_ROOT_DIRECTORY)
    }

    pub fn custom_disk(&self) -> PathBuf {
        self.work_dir.join(CUSTOM_DISK_DIRECTORY)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.work_dir.join(LOCK_FILE_NAME)
    }

    pub fn config_file(&self) -> PathBuf {
        self.work_dir.join(CONFIG_FILE_NAME)
    }

    pub fn log_file(&self, timestamp: &str) -> PathBuf {
        self.work_dir.join(format!("cubic.{}.log", timestamp))
    }

    /// `partition-<index>.img` for index in `1..=9`.
    pub fn partition_image(&self, index: usize) -> Option<PathBuf> {
        (1..=MAX_PARTITIONS)
            .contains(&index)
            .then(|| self.work_dir.join(format!("partition-{}.img", index)))
    }

    /// Partition images currently present, by index.
    pub fn partition_images(&self) -> Vec<(usize, PathBuf)> {
        (1..=MAX_PARTITIONS)
            .filter_map(|i| self.partition_image(i).map(|p| (i, p)))
            .filter(|(_, p)| p.is_file())
            .collect()
    }

    /// Generated `*.iso` and `*.md5` files at the top of the work directory.
    pub fn generated_outputs(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.work_dir) else {
            return Vec::new();
        };
        let mut outputs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "iso" || ext == "md5")
            })
            .collect();
        outputs.sort();
        outputs
    }

    /// True if the project has been created before.
    pub fn exists(&self) -> bool {
        self.config_file().is_file()
    }

    /// True if `path` is the work directory or lies under it.
    pub fn contains(&self, path: &Path) -> bool {
        path.is_absolute() && normalize(path).starts_with(&self.work_dir)
    }
}

/// Resolve `.` and `..` lexically.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Check that `path` can hold a project.
pub fn validate_project_directory(path: &Path) -> Result<(), ValidationError> {
    if !path.is_absolute() {
        return Err(ValidationError::RelativeDirectory(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(ValidationError::NotADirectory(path.to_path_buf()));
    }
    if !is_writable(path) {
        return Err(ValidationError::NotWritable(path.to_path_buf()));
    }

    let df = Cmd::new("df")
        .arg("--print-type")
        .arg_path(path)
        .allow_fail()
        .run();
    match df {
        Ok(result) if result.success() => {
            if let Some(fs_type) = parse_df_type(result.stdout_trimmed()) {
                log::debug!("{} is on a {} filesystem", path.display(), fs_type);
                if UNSUPPORTED_FILESYSTEMS.contains(&fs_type.as_str()) {
                    return Err(ValidationError::UnsupportedFilesystem {
                        path: path.to_path_buf(),
                        fs_type,
                    });
                }
            }
        }
        Ok(result) => log::warn!("df failed for {}: {}", path.display(), result.stderr_trimmed()),
        Err(e) => log::warn!("Unable to check filesystem type of {}: {:#}", path.display(), e),
    }
    Ok(())
}

fn is_writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

/// Filesystem type column of `df --print-type` output.
pub fn parse_df_type(output: &str) -> Option<String> {
    let mut lines = output.lines();
    let header = lines.next()?;
    let column = header.split_whitespace().position(|c| c == "Type")?;
    // Long device names wrap onto their own line.
    let fields: Vec<&str> = lines.flat_map(str::split_whitespace).collect();
    fields.get(column).map(|s| s.to_string())
}

/// `YYYYMMDDHHMMSS`, used in log file names.
pub fn timestamp_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// `YYYY-MM-DD HH:MM`, used in the project config and os-release.
pub fn timestamp_display() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute()
    )
}
