//! Repackaging the customized project into a bootable ISO.
//!
//! [`IsoAssembler::assemble`] runs the steps of [`AssemblyStep`] in order:
//! - [`squashfs`] - `mksquashfs`/`unsquashfs` command lines and `filesystem.size`
//! - [`manifest`] - package manifests from the dpkg database
//! - [`checksum`] - `md5sum.txt` and the ISO's `.md5` file
//! - [`iso`] - replaying the source ISO's boot setup through `xorriso`
//!
//! The long steps run as the runner's current process, so
//! [`IsoAssembler::cancel`] stops whichever one is active.

pub mod checksum;
pub mod iso;
pub mod manifest;
pub mod squashfs;

use crate::boot_config::{find_boot_configurations, rewrite_boot_config_files, RewriteParams};
use crate::error::{ProcessError, ProcessResult, ValidationError};
use crate::kernel::KernelEntry;
use crate::mountinfo;
use crate::preflight;
use crate::process::{privileged, CancelToken, Cmd, ProcessRunner};
use crate::progress::ProgressTracker;
use crate::project::{Project, ProjectConfig};
use crate::session::DISK_INFO_PATH;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStep {
    CopyKernel,
    UpdateBootConfigs,
    Manifests,
    Compress,
    FilesystemSize,
    DiskChecksums,
    WriteIso,
    IsoChecksum,
}

impl AssemblyStep {
    pub const ALL: [AssemblyStep; 8] = [
        AssemblyStep::CopyKernel,
        AssemblyStep::UpdateBootConfigs,
        AssemblyStep::Manifests,
        AssemblyStep::Compress,
        AssemblyStep::FilesystemSize,
        AssemblyStep::DiskChecksums,
        AssemblyStep::WriteIso,
        AssemblyStep::IsoChecksum,
    ];

    pub fn description(self) -> &'static str {
        match self {
            AssemblyStep::CopyKernel => "Copy the selected kernel",
            AssemblyStep::UpdateBootConfigs => "Update boot configurations",
            AssemblyStep::Manifests => "Create package manifests",
            AssemblyStep::Compress => "Compress the customized root filesystem",
            AssemblyStep::FilesystemSize => "Record the filesystem size",
            AssemblyStep::DiskChecksums => "Update disk checksums",
            AssemblyStep::WriteIso => "Write the ISO",
            AssemblyStep::IsoChecksum => "Compute the ISO checksum",
        }
    }
}

pub struct IsoAssembler {
    project: Project,
    runner: Arc<ProcessRunner>,
    cancel: CancelToken,
}

impl IsoAssembler {
    pub fn new(project: Project, runner: Arc<ProcessRunner>) -> Self {
        Self {
            project,
            runner,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Stop the running step. Safe to call from another thread.
    pub fn cancel(&self) -> ProcessResult<()> {
        self.cancel.cancel();
        self.runner.terminate_process()
    }

    /// Where the ISO is written: the custom ISO directory, or the project
    /// directory when none is set.
    pub fn output_path(&self, config: &ProjectConfig) -> Result<PathBuf> {
        if config.custom.iso_file_name.is_empty() {
            bail!("no file name set for the custom ISO");
        }
        let directory = if config.custom.iso_directory.is_empty() {
            self.project.work_dir().to_path_buf()
        } else {
            PathBuf::from(&config.custom.iso_directory)
        };
        Ok(directory.join(&config.custom.iso_file_name))
    }

    /// Build the ISO. `on_progress` receives each step with `0.0` when it
    /// starts, intermediate fractions for tracked steps, and `1.0` when it
    /// ends. Returns the path of the written ISO.
    pub fn assemble<F>(&self, config: &ProjectConfig, mut on_progress: F) -> Result<PathBuf>
    where
        F: FnMut(AssemblyStep, f64),
    {
        self.cancel.reset();
        config.layout.require_bootable()?;
        let kernel = config
            .kernels
            .selected()
            .context("no kernel selected for the custom disk")?;
        let output = self.output_path(config)?;
        preflight::check_assemble_tools()?;
        log::info!("Assembling {}", output.display());

        for step in AssemblyStep::ALL {
            if self.cancel.is_cancelled() {
                return Err(ProcessError::Cancelled.into());
            }
            log::info!("{}", step.description());
            on_progress(step, 0.0);
            let mut report = |fraction| on_progress(step, fraction);
            match step {
                AssemblyStep::CopyKernel => self.copy_kernel(config, kernel)?,
                AssemblyStep::UpdateBootConfigs => self.update_boot_configs(config, kernel)?,
                AssemblyStep::Manifests => self.write_manifests(config)?,
                AssemblyStep::Compress => self.compress(config, &mut report)?,
                AssemblyStep::FilesystemSize => self.write_filesystem_size(config)?,
                AssemblyStep::DiskChecksums => self.write_disk_checksums(config)?,
                AssemblyStep::WriteIso => self.write_iso(config, &output, &mut report)?,
                AssemblyStep::IsoChecksum => {
                    checksum::write_iso_checksum(&output)?;
                }
            }
            on_progress(step, 1.0);
        }

        log::info!("Custom ISO ready: {}", output.display());
        Ok(output)
    }

    fn copy_kernel(&self, config: &ProjectConfig, kernel: &KernelEntry) -> Result<()> {
        let custom_root = self.project.custom_root();
        let custom_disk = self.project.custom_disk();
        let layout = &config.layout;
        let copies = [
            (
                kernel.vmlinuz_source(&custom_root),
                layout.in_casper_directory(&custom_disk, Some(&kernel.vmlinuz_target_name)),
            ),
            (
                kernel.initrd_source(&custom_root),
                layout.in_casper_directory(&custom_disk, Some(&kernel.initrd_target_name)),
            ),
        ];
        for (source, target) in copies {
            let target = target.ok_or(ValidationError::MissingLayout("casper directory"))?;
            self.run_checked(&privileged::copy_path(&source, &target))
                .with_context(|| format!("copying {}", source.display()))?;
        }
        Ok(())
    }

    fn update_boot_configs(&self, config: &ProjectConfig, kernel: &KernelEntry) -> Result<()> {
        let custom_disk = self.project.custom_disk();
        let files = if config.options.boot_configurations.is_empty() {
            find_boot_configurations(&custom_disk)?
        } else {
            config.options.boot_configurations.clone()
        };
        let params = RewriteParams::new(&config.layout, kernel)?;
        let rewrites = rewrite_boot_config_files(&custom_disk, &files, &params)?;
        let updates: usize = rewrites.iter().map(|(_, r)| r.update_count).sum();
        log::info!("{} boot configuration update(s) in {} file(s)", updates, rewrites.len());
        Ok(())
    }

    fn write_manifests(&self, config: &ProjectConfig) -> Result<()> {
        let custom_disk = self.project.custom_disk();
        let layout = &config.layout;
        let in_squashfs = |name: Option<&str>| layout.in_squashfs_directory(&custom_disk, name);
        let entries = manifest::installed_packages(&self.project.custom_root())?;

        let rebuilt = in_squashfs(layout.rebuilt_manifest_name().as_deref())
            .ok_or(ValidationError::MissingLayout("squashfs directory"))?;
        let previous = manifest::read_manifest(&rebuilt)?;
        manifest::write_manifest(&rebuilt, &entries)?;

        if let Some(path) = in_squashfs(layout.installer_manifest_name.as_deref()) {
            let installer = manifest::read_manifest(&path)?;
            manifest::write_manifest(&path, &manifest::installer_manifest(&entries, &installer, &previous))?;
        }

        if config.options.has_minimal_install {
            if let Some(path) = in_squashfs(layout.minimal_remove_name.as_deref()) {
                manifest::update_remove_list(&path, &entries)?;
            }
            if layout.rebuilt_squashfs_name() != layout.minimal_squashfs_name.as_deref()
                && layout.minimal_squashfs_name.is_some()
            {
                log::warn!("The minimal layer is carried over unchanged; minimal installs get the original package set");
            }
        }
        if let Some(path) = in_squashfs(layout.standard_remove_name.as_deref()) {
            manifest::update_remove_list(&path, &entries)?;
        }
        Ok(())
    }

    fn compress(&self, config: &ProjectConfig, on_progress: &mut dyn FnMut(f64)) -> Result<()> {
        let custom_root = self.project.custom_root();
        if !mountinfo::mounts_under(&custom_root, &mountinfo::read_mounts()).is_empty() {
            bail!("leave the virtual environment before compressing {}", custom_root.display());
        }

        let image = config
            .layout
            .squashfs_file(&self.project.custom_disk())
            .ok_or(ValidationError::MissingLayout("squashfs file"))?;
        let compression = config.options.compression;
        log::info!("Compressing {} with {}", image.display(), compression);
        ProgressTracker::new(1)
            .track(
                &self.runner,
                &privileged::compress_squashfs(&custom_root, &image, compression.as_str()),
                &self.cancel,
                on_progress,
            )
            .with_context(|| format!("compressing {}", custom_root.display()))
    }

    fn write_filesystem_size(&self, config: &ProjectConfig) -> Result<()> {
        let layout = &config.layout;
        let path = layout
            .in_squashfs_directory(&self.project.custom_disk(), layout.rebuilt_size_name().as_deref())
            .ok_or(ValidationError::MissingLayout("squashfs directory"))?;
        let bytes = squashfs::filesystem_size(&self.project.custom_root())?;
        squashfs::write_size_file(&path, bytes)
    }

    fn write_disk_checksums(&self, config: &ProjectConfig) -> Result<()> {
        let custom_disk = self.project.custom_disk();
        write_disk_info(&custom_disk, &config.custom.iso_disk_name)?;
        checksum::write_md5sum_file(&custom_disk)?;
        Ok(())
    }

    fn write_iso(&self, config: &ProjectConfig, output: &Path, on_progress: &mut dyn FnMut(f64)) -> Result<()> {
        let source = Path::new(&config.original.iso_directory).join(&config.original.iso_file_name);
        let report = iso::report_boot_options(&source)
            .with_context(|| format!("reading the boot setup of {}", source.display()))?;
        let options = iso::boot_options(&report, &config.custom.iso_volume_id, &self.project.partition_images())?;

        if output.exists() {
            fs::remove_file(output).with_context(|| format!("removing old {}", output.display()))?;
        }
        ProgressTracker::new(1)
            .track(
                &self.runner,
                &iso::xorriso_command(&self.project.custom_disk(), output, &options),
                &self.cancel,
                on_progress,
            )
            .with_context(|| format!("writing {}", output.display()))
    }

    fn run_checked(&self, cmd: &Cmd) -> Result<()> {
        self.runner.run_sync(cmd)?.check(cmd)?;
        Ok(())
    }
}

/// Replace `.disk/info` with the custom disk name. An empty name leaves
/// the file alone.
pub fn write_disk_info(disk_root: &Path, disk_name: &str) -> Result<()> {
    if disk_name.is_empty() {
        return Ok(());
    }
    let path = disk_root.join(DISK_INFO_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&path, disk_name).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
