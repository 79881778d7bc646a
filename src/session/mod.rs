//! The ISO session: from a source ISO to an editable project, and back.
//!
//! [`IsoSession::open`] mounts the source ISO, identifies its layout, copies
//! the disk tree into `custom-disk`, extracts the root filesystem into
//! `custom-root` and pulls out appended partitions. The session owns the
//! project's [`VirtualEnvironment`]. [`IsoSession::teardown`] leaves it and
//! then undoes as much of the rest as requested, and never fails.

mod iso;
mod lock;
mod partitions;

pub use iso::{read_disk_info, validate_source_iso, IsoInfo, DISK_INFO_PATH};
pub use lock::ProjectLock;
pub use partitions::{extract_partitions, parse_fdisk, PartitionEntry, PartitionTable};

use crate::error::{ProcessResult, ValidationError};
use crate::layout::LayoutProfile;
use crate::mountinfo;
use crate::process::{privileged, CancelToken, Cmd, ProcessRunner};
use crate::progress::ProgressTracker;
use crate::project::{Project, ProjectConfig};
use crate::virtual_env::VirtualEnvironment;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Long-running phases of [`IsoSession::open`], for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPhase {
    Copy,
    Extract,
}

/// Which parts of a project to remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub delete_custom_root: bool,
    pub delete_custom_disk: bool,
    pub delete_generated_outputs: bool,
    pub delete_config: bool,
}

impl Teardown {
    /// Normal close: release the source ISO and keep the project.
    pub fn close() -> Self {
        Self::default()
    }

    /// A failed open: drop the partial extraction, keep the config.
    pub fn discard() -> Self {
        Self {
            delete_custom_root: true,
            delete_custom_disk: true,
            ..Self::default()
        }
    }

    /// Remove the whole project.
    pub fn delete_project() -> Self {
        Self {
            delete_custom_root: true,
            delete_custom_disk: true,
            delete_generated_outputs: true,
            delete_config: true,
        }
    }
}

/// Outcome of each teardown step.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: String, result: Result<bool>) {
        match result {
            Ok(true) => self.completed.push(step),
            Ok(false) => self.skipped.push(step),
            Err(e) => {
                log::warn!("Teardown step '{}' failed: {:#}", step, e);
                self.failures.push((step, format!("{:#}", e)));
            }
        }
    }
}

pub struct IsoSession {
    project: Project,
    runner: Arc<ProcessRunner>,
    cancel: CancelToken,
    environment: Mutex<VirtualEnvironment>,
}

impl IsoSession {
    pub fn new(project: Project, runner: Arc<ProcessRunner>) -> Self {
        let environment = VirtualEnvironment::new(project.clone(), Arc::clone(&runner));
        Self {
            project,
            runner,
            cancel: CancelToken::new(),
            environment: Mutex::new(environment),
        }
    }

    /// The chroot shell of this project.
    pub fn virtual_environment(&self) -> MutexGuard<'_, VirtualEnvironment> {
        self.environment.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn runner(&self) -> &Arc<ProcessRunner> {
        &self.runner
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Stop the running step. Safe to call from another thread.
    pub fn cancel(&self) -> ProcessResult<()> {
        self.cancel.cancel();
        self.runner.terminate_process()
    }

    /// Turn `iso` into an editable project, recording progress in `config`.
    pub fn open<F>(&self, iso: &Path, config: &mut ProjectConfig, mut on_progress: F) -> Result<()>
    where
        F: FnMut(OpenPhase, f64),
    {
        self.cancel.reset();
        if ProjectLock::is_held(&self.project.lock_file()) {
            return Err(ValidationError::ProjectInUse(self.project.lock_file()).into());
        }
        let info = validate_source_iso(iso)?;
        log::info!("Opening '{}' ({})", iso.display(), info.volume_id);

        self.mount_source(iso)?;
        let mount_point = self.project.iso_mount_point();

        let layout = LayoutProfile::discover(&mount_point);
        layout.require_bootable()?;
        config.layout = layout.clone();
        config.original.iso_volume_id = info.volume_id;
        if let Some((disk_name, release)) = read_disk_info(&mount_point) {
            config.original.iso_disk_name = disk_name;
            config.original.iso_release_name = release.unwrap_or_default();
        }

        let custom_disk = self.project.custom_disk();
        fs::create_dir_all(&custom_disk)
            .with_context(|| format!("creating {}", custom_disk.display()))?;
        let tracker = ProgressTracker::new(1);
        tracker.track(
            &self.runner,
            &copy_disk_command(&mount_point, &custom_disk, &layout),
            &self.cancel,
            |f| on_progress(OpenPhase::Copy, f),
        )?;
        config.status.is_success_copy = true;

        let layers = layout.root_layer_files(&mount_point);
        if layers.is_empty() {
            return Err(ValidationError::MissingLayout("squashfs file").into());
        }
        let count = layers.len() as f64;
        for (index, image) in layers.iter().enumerate() {
            log::info!("Extracting {}", image.display());
            tracker.track(
                &self.runner,
                &privileged::extract_squashfs(image, &self.project.custom_root()),
                &self.cancel,
                |f| on_progress(OpenPhase::Extract, (index as f64 + f) / count),
            )?;
        }
        config.status.is_success_extract = true;

        match PartitionTable::read(iso) {
            Ok(table) => {
                extract_partitions(iso, &table, &self.project)?;
            }
            Err(e) => log::warn!("No partition table read from {}: {:#}", iso.display(), e),
        }

        log::info!("Project ready in {}", self.project.work_dir().display());
        Ok(())
    }

    /// Mount `iso` read-only on the project's mount point.
    pub fn mount_source(&self, iso: &Path) -> Result<()> {
        let mount_point = self.project.iso_mount_point();
        if mountinfo::is_mounted(&mount_point, &mountinfo::read_mounts()) {
            log::info!("{} is already mounted", mount_point.display());
            return Ok(());
        }
        fs::create_dir_all(&mount_point)
            .with_context(|| format!("creating {}", mount_point.display()))?;
        let cmd = privileged::mount_iso(iso, &mount_point);
        self.runner
            .run_sync(&cmd)?
            .check(&cmd)
            .with_context(|| format!("mounting '{}'", iso.display()))?;
        Ok(())
    }

    /// Undo the requested parts of the project. Every step runs regardless of
    /// earlier failures; running it twice is harmless.
    pub fn teardown(&self, teardown: &Teardown) -> TeardownReport {
        let mut report = TeardownReport::default();
        let project = &self.project;

        {
            let mut environment = self.virtual_environment();
            let entered = environment.is_entered();
            report.record(
                "leave virtual environment".to_string(),
                environment.exit_virtual_environment().map(|()| entered),
            );
        }

        let mounts = mountinfo::read_mounts();
        let custom_root = project.custom_root();
        report.record(
            "unmount virtual environment".to_string(),
            if mountinfo::mounts_under(&custom_root, &mounts).is_empty() {
                Ok(false)
            } else {
                self.elevated(privileged::unmount_chroot(&custom_root))
            },
        );

        let mount_point = project.iso_mount_point();
        report.record(
            "unmount source disk".to_string(),
            if mountinfo::is_mounted(&mount_point, &mounts) {
                self.elevated(privileged::unmount_path(&mount_point))
            } else {
                Ok(false)
            },
        );
        report.record("remove mount point".to_string(), remove_dir(&mount_point));

        if teardown.delete_custom_root {
            report.record(
                "delete custom root".to_string(),
                if custom_root.exists() {
                    self.elevated(privileged::delete_path(&custom_root))
                } else {
                    Ok(false)
                },
            );
        }

        if teardown.delete_custom_disk {
            report.record("delete custom disk".to_string(), remove_tree(&project.custom_disk()));
            for (index, image) in project.partition_images() {
                report.record(format!("delete partition {}", index), remove_file(&image));
            }
        }

        if teardown.delete_generated_outputs {
            for output in project.generated_outputs() {
                report.record(format!("delete {}", output.display()), remove_file(&output));
            }
        }

        if teardown.delete_config {
            report.record("delete project config".to_string(), remove_file(&project.config_file()));
        }

        let lock = project.lock_file();
        report.record(
            "remove lock file".to_string(),
            if ProjectLock::is_held(&lock) {
                Err(anyhow::Error::from(ValidationError::ProjectInUse(lock)))
            } else {
                Ok(false)
            },
        );

        log::info!(
            "Teardown finished: {} done, {} skipped, {} failed",
            report.completed.len(),
            report.skipped.len(),
            report.failures.len()
        );
        report
    }

    fn elevated(&self, cmd: Cmd) -> Result<bool> {
        self.runner.run_sync_unregistered(&cmd)?.check(&cmd)?;
        Ok(true)
    }
}

/// `rsync` of the mounted disk into `custom-disk` with owner-writable
/// permissions. The rebuilt image is left out; other layers are carried
/// over as they are.
pub fn copy_disk_command(mount_point: &Path, custom_disk: &Path, layout: &LayoutProfile) -> Cmd {
    let mut cmd = Cmd::new("rsync").args(["--archive", "--delete", "--info=progress2", "--chmod=u+w"]);
    if let (Some(dir), Some(name)) = (layout.squashfs_directory.as_deref(), layout.rebuilt_squashfs_name()) {
        cmd = cmd.arg(format!("--exclude=/{}/{}", dir.trim_matches('/'), name));
    }
    cmd.arg(format!("{}/", mount_point.display()))
        .arg(format!("{}/", custom_disk.display()))
}

fn remove_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    fs::remove_dir(path).with_context(|| format!("removing {}", path.display()))?;
    Ok(true)
}

fn remove_tree(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(path).with_context(|| format!("removing {}", path.display()))?;
    Ok(true)
}

fn remove_file(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(temp: &TempDir) -> IsoSession {
        let project = Project::new(temp.path()).unwrap();
        IsoSession::new(project, Arc::new(ProcessRunner::new()))
    }

    fn layout(squashfs: Option<&str>, minimal: Option<&str>, standard: Option<&str>) -> LayoutProfile {
        LayoutProfile {
            casper_directory: Some("casper".to_string()),
            squashfs_directory: Some("casper".to_string()),
            squashfs_name: squashfs.map(str::to_string),
            minimal_squashfs_name: minimal.map(str::to_string),
            standard_squashfs_name: standard.map(str::to_string),
            installer_squashfs_name: minimal.map(|_| "minimal.standard.live.squashfs".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn copy_command_excludes_rebuilt_image() {
        let flat = layout(Some("filesystem.squashfs"), None, None);
        let cmd = copy_disk_command(Path::new("/w/source-disk"), Path::new("/w/custom-disk"), &flat);
        let args = cmd.get_args();
        assert_eq!(cmd.program(), "rsync");
        assert!(args.contains(&"--info=progress2".to_string()));
        assert!(args.contains(&"--exclude=/casper/filesystem.squashfs".to_string()));
        assert_eq!(&args[args.len() - 2..], ["/w/source-disk/", "/w/custom-disk/"]);
    }

    #[test]
    fn copy_command_carries_over_other_layers() {
        let layered = layout(None, Some("minimal.squashfs"), Some("minimal.standard.squashfs"));
        let cmd = copy_disk_command(Path::new("/w/source-disk"), Path::new("/w/custom-disk"), &layered);
        let excludes: Vec<&String> = cmd
            .get_args()
            .iter()
            .filter(|arg| arg.starts_with("--exclude="))
            .collect();
        assert_eq!(excludes, ["--exclude=/casper/minimal.standard.squashfs"]);
    }

    #[test]
    fn teardown_removes_requested_parts_and_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        let project = session.project().clone();

        fs::create_dir_all(project.iso_mount_point()).unwrap();
        fs::create_dir_all(project.custom_disk().join("casper")).unwrap();
        fs::write(project.custom_disk().join("casper/vmlinuz"), b"k").unwrap();
        fs::write(project.partition_image(2).unwrap(), b"efi").unwrap();
        fs::write(temp.path().join("custom.iso"), b"iso").unwrap();
        fs::write(project.config_file(), b"").unwrap();
        fs::write(project.lock_file(), b"").unwrap();

        let report = session.teardown(&Teardown::delete_project());
        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(!project.iso_mount_point().exists());
        assert!(!project.custom_disk().exists());
        assert!(project.partition_images().is_empty());
        assert!(project.generated_outputs().is_empty());
        assert!(!project.config_file().exists());
        assert!(!project.lock_file().exists());

        let again = session.teardown(&Teardown::delete_project());
        assert!(again.is_clean());
        assert!(again.completed.is_empty());
    }

    #[test]
    fn close_keeps_project_files() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        let project = session.project().clone();
        fs::create_dir_all(project.iso_mount_point()).unwrap();
        fs::create_dir_all(project.custom_disk()).unwrap();
        fs::write(project.config_file(), b"").unwrap();

        let report = session.teardown(&Teardown::close());
        assert!(report.is_clean());
        assert!(!project.iso_mount_point().exists());
        assert!(project.custom_disk().exists());
        assert!(project.config_file().exists());
    }

    #[test]
    fn teardown_reports_lock_held_by_another_session() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        let _lock = ProjectLock::acquire(&session.project().lock_file()).unwrap();

        let report = session.teardown(&Teardown::close());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "remove lock file");
    }

    #[test]
    fn close_leaves_the_virtual_environment() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        let lock_file = session.project().lock_file();
        session
            .virtual_environment()
            .enter_with(&Cmd::shell("sleep 30"))
            .unwrap();
        assert!(session.virtual_environment().is_running());
        assert!(lock_file.exists());

        let report = session.teardown(&Teardown::close());
        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(report.completed.contains(&"leave virtual environment".to_string()));
        assert!(!session.virtual_environment().is_running());
        assert!(!lock_file.exists());

        let again = session.teardown(&Teardown::close());
        assert!(again.is_clean());
        assert!(!again.completed.contains(&"leave virtual environment".to_string()));
    }

    #[test]
    fn open_refuses_project_in_use() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        let _lock = ProjectLock::acquire(&session.project().lock_file()).unwrap();
        let iso = temp.path().join("source.iso");
        iso::write_fake_iso(&iso, "Ubuntu");

        let mut config = ProjectConfig::default();
        let err = session.open(&iso, &mut config, |_, _| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::ProjectInUse(_))
        ));
    }

    #[test]
    fn open_rejects_foreign_file_before_mounting() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        let bogus = temp.path().join("notes.txt");
        fs::write(&bogus, b"hello").unwrap();

        let mut config = ProjectConfig::default();
        let err = session.open(&bogus, &mut config, |_, _| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::NotAnIso(_))
        ));
        assert!(!session.project().iso_mount_point().exists());
    }
}
