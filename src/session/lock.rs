use crate::error::ValidationError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive hold on a project's `.#custom-root.lck`.
///
/// The lock file exists exactly while the root filesystem is being edited.
/// Dropping the guard unlocks and removes it.
#[derive(Debug)]
pub struct ProjectLock {
    _file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Take the lock, failing with [`ValidationError::ProjectInUse`] if
    /// another session holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            drop(file);
            return Err(ValidationError::ProjectInUse(path.to_path_buf()).into());
        }

        log::debug!("Acquired {}", path.display());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// True if some session currently holds the lock at `path`.
    ///
    /// A lock file left behind by a crashed session is not held; it is
    /// removed.
    pub fn is_held(path: &Path) -> bool {
        let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
            return false;
        };
        if file.try_lock_exclusive().is_err() {
            return true;
        }
        let _ = FileExt::unlock(&file);
        log::warn!("Removing stale lock file {}", path.display());
        let _ = fs::remove_file(path);
        false
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
