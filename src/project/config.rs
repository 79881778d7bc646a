//! `cubic.conf`: persisted project state.

use super::naming;
use super::options::OptionsBundle;
use crate::kernel::KernelList;
use crate::layout::LayoutProfile;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use time::Date;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectSection {
    /// Version of Cubic that created the project.
    pub cubic_version: String,
    pub create_date: String,
    pub modify_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OriginalSection {
    pub iso_file_name: String,
    pub iso_directory: String,
    pub iso_volume_id: String,
    pub iso_release_name: String,
    pub iso_disk_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CustomSection {
    pub iso_version_number: String,
    pub iso_file_name: String,
    pub iso_directory: String,
    pub iso_volume_id: String,
    pub iso_release_name: String,
    pub iso_disk_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSection {
    pub is_success_copy: bool,
    pub is_success_extract: bool,
}

impl StatusSection {
    /// Both the disk tree and the root filesystem were fully extracted.
    pub fn is_extracted(&self) -> bool {
        self.is_success_copy && self.is_success_extract
    }
}

/// Everything persisted for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    pub original: OriginalSection,
    pub custom: CustomSection,
    pub status: StatusSection,
    pub layout: LayoutProfile,
    pub options: OptionsBundle,
    pub kernels: KernelList,
}

impl ProjectConfig {
    /// Fresh configuration for customizing `iso`.
    pub fn for_source_iso(iso: &Path, volume_id: &str, created: &str, date: Date) -> Self {
        let file_name = iso
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = iso
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let mut config = Self {
            project: ProjectSection {
                cubic_version: env!("CARGO_PKG_VERSION").to_string(),
                create_date: created.to_string(),
                modify_date: created.to_string(),
            },
            original: OriginalSection {
                iso_file_name: file_name,
                iso_directory: directory.clone(),
                iso_volume_id: volume_id.to_string(),
                ..OriginalSection::default()
            },
            ..Self::default()
        };
        config.custom.iso_directory = directory;
        config.refresh_custom_names(date);
        config
    }

    /// Recompute the custom disk names for a build on `date`.
    pub fn refresh_custom_names(&mut self, date: Date) {
        let version = naming::version_number(date);
        let volume_id = naming::custom_volume_id(&self.original.iso_volume_id, &version);
        self.custom.iso_file_name = naming::custom_iso_file_name(&self.original.iso_file_name, &version);
        self.custom.iso_release_name = self.original.iso_release_name.clone();
        self.custom.iso_disk_name = naming::custom_disk_name(&volume_id, &self.custom.iso_release_name, date);
        self.custom.iso_volume_id = volume_id;
        self.custom.iso_version_number = version;
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading project config '{}'", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing project config '{}'", path.display()))?;
        if config.project.cubic_version != env!("CARGO_PKG_VERSION") {
            log::info!(
                "Project was created by Cubic {}, this is {}",
                config.project.cubic_version,
                env!("CARGO_PKG_VERSION")
            );
        }
        Ok(config)
    }

    /// Write atomically: a temporary file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(self).context("serializing project config")?;
        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, text).with_context(|| format!("writing '{}'", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing project config '{}'", path.display()))?;
        log::debug!("Saved {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelEntry;
    use crate::project::Compression;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use time::Month;

    fn sample() -> ProjectConfig {
        let date = Date::from_calendar_date(2026, Month::October, 18).unwrap();
        let mut config = ProjectConfig::for_source_iso(
            Path::new("/isos/ubuntu-24.04-desktop-amd64.iso"),
            "Ubuntu 24.04 LTS amd64",
            "2026-10-18 09:30",
            date,
        );
        config.layout.casper_directory = Some("casper".to_string());
        config.layout.squashfs_name = Some("filesystem.squashfs".to_string());
        config.options.compression = Compression::Zstd;
        config.options.boot_configurations = vec![PathBuf::from("boot/grub/grub.cfg")];
        config.status.is_success_copy = true;
        config.kernels = KernelList::from_entries(vec![KernelEntry {
            version_name: "6.8.0-45-generic".to_string(),
            vmlinuz_source_name: "vmlinuz-6.8.0-45-generic".to_string(),
            vmlinuz_target_name: "vmlinuz".to_string(),
            initrd_source_name: "initrd.img-6.8.0-45-generic".to_string(),
            initrd_target_name: "initrd".to_string(),
            directory: "boot".to_string(),
            note: String::new(),
            selected: true,
        }]);
        config
    }

    #[test]
    fn fresh_config_derives_custom_names() {
        let config = sample();
        assert_eq!(config.original.iso_file_name, "ubuntu-24.04-desktop-amd64.iso");
        assert_eq!(config.original.iso_directory, "/isos");
        assert_eq!(config.custom.iso_version_number, "2026.10.18");
        assert_eq!(config.custom.iso_file_name, "ubuntu-24.04-desktop-amd64-2026.10.18.iso");
        assert_eq!(config.custom.iso_directory, "/isos");
        assert!(config.custom.iso_volume_id.ends_with("2026.10.18"));
        assert_eq!(config.project.cubic_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn save_and_load_preserve_everything() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cubic.conf");
        let config = sample();
        config.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("compression = \"zstd\""));
        assert!(text.contains("[[kernels]]"));

        let loaded = ProjectConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!temp.path().join("cubic.conf.tmp").exists());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cubic.conf");
        fs::write(&path, "[project]\ncubic_version = \"0.1.0\"\nfavourite_colour = \"blue\"\n").unwrap();
        assert!(ProjectConfig::load(&path).is_err());
    }

    #[test]
    fn missing_sections_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cubic.conf");
        fs::write(&path, "[original]\niso_file_name = \"a.iso\"\n").unwrap();
        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.original.iso_file_name, "a.iso");
        assert_eq!(config.options.compression, Compression::Gzip);
        assert!(config.options.update_os_release);
        assert!(config.kernels.is_empty());
        assert!(!config.status.is_extracted());
    }
}
