//! Layout discovery: which names a given ISO uses for its live files.
//!
//! Each slot of [`LayoutProfile`] is filled from the first candidate in
//! [`catalog`] that exists on disk. Discovery only reads directory listings,
//! so the same tree always yields the same profile.

pub mod catalog;

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Resolved layout of an extracted (or mounted) disk tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutProfile {
    pub casper_directory: Option<String>,
    pub initrd_name: Option<String>,
    pub vmlinuz_name: Option<String>,
    pub squashfs_directory: Option<String>,
    pub squashfs_name: Option<String>,
    pub manifest_name: Option<String>,
    pub size_name: Option<String>,
    pub minimal_remove_name: Option<String>,
    pub standard_remove_name: Option<String>,
    pub installer_sources_name: Option<String>,
    pub minimal_squashfs_name: Option<String>,
    pub minimal_manifest_name: Option<String>,
    pub minimal_size_name: Option<String>,
    pub standard_squashfs_name: Option<String>,
    pub standard_manifest_name: Option<String>,
    pub standard_size_name: Option<String>,
    pub installer_squashfs_name: Option<String>,
    pub installer_manifest_name: Option<String>,
    pub installer_size_name: Option<String>,
}

impl LayoutProfile {
    /// Search `disk_root` for every slot.
    ///
    /// Directory slots prefer the first candidate that actually holds a
    /// kernel (casper) or an image (squashfs), so Grml's bare `live/`
    /// parent does not shadow `live/grml64-full`.
    pub fn discover(disk_root: &Path) -> Self {
        let squashfs_names: Vec<&str> = catalog::all_squashfs_names().collect();
        let casper_directory =
            first_directory(disk_root, catalog::CASPER_DIRECTORIES, catalog::VMLINUZ_NAMES);
        let squashfs_directory =
            first_directory(disk_root, catalog::SQUASHFS_DIRECTORIES, &squashfs_names);

        let casper_path = casper_directory.as_ref().map(|d| disk_root.join(d));
        let squashfs_path = squashfs_directory.as_ref().map(|d| disk_root.join(d));

        let in_casper = |names: &[&str]| casper_path.as_deref().and_then(|dir| first_file(dir, names));
        let in_squashfs =
            |names: &[&str]| squashfs_path.as_deref().and_then(|dir| first_file(dir, names));

        let installer_sources_name = in_squashfs(catalog::INSTALLER_SOURCES_NAMES)
            .or_else(|| first_file(disk_root, catalog::INSTALLER_SOURCES_NAMES));

        let profile = Self {
            initrd_name: in_casper(catalog::INITRD_NAMES),
            vmlinuz_name: in_casper(catalog::VMLINUZ_NAMES),
            squashfs_name: in_squashfs(catalog::SQUASHFS_NAMES),
            manifest_name: in_squashfs(catalog::MANIFEST_NAMES),
            size_name: in_squashfs(catalog::SIZE_NAMES),
            minimal_remove_name: in_squashfs(catalog::MINIMAL_REMOVE_NAMES),
            standard_remove_name: in_squashfs(catalog::STANDARD_REMOVE_NAMES),
            installer_sources_name,
            minimal_squashfs_name: in_squashfs(catalog::MINIMAL_SQUASHFS_NAMES),
            minimal_manifest_name: in_squashfs(catalog::MINIMAL_MANIFEST_NAMES),
            minimal_size_name: in_squashfs(catalog::MINIMAL_SIZE_NAMES),
            standard_squashfs_name: in_squashfs(catalog::STANDARD_SQUASHFS_NAMES),
            standard_manifest_name: in_squashfs(catalog::STANDARD_MANIFEST_NAMES),
            standard_size_name: in_squashfs(catalog::STANDARD_SIZE_NAMES),
            installer_squashfs_name: in_squashfs(catalog::INSTALLER_SQUASHFS_NAMES),
            installer_manifest_name: in_squashfs(catalog::INSTALLER_MANIFEST_NAMES),
            installer_size_name: in_squashfs(catalog::INSTALLER_SIZE_NAMES),
            casper_directory,
            squashfs_directory,
        };
        log::debug!("Discovered layout under {}: {:?}", disk_root.display(), profile);
        profile
    }

    /// Fail unless the slots needed to rebuild a bootable image resolved.
    pub fn require_bootable(&self) -> Result<(), ValidationError> {
        if self.casper_directory.is_none() {
            return Err(ValidationError::MissingLayout("casper directory"));
        }
        if self.squashfs_directory.is_none() {
            return Err(ValidationError::MissingLayout("squashfs directory"));
        }
        if self.rebuilt_squashfs_name().is_none() {
            return Err(ValidationError::MissingLayout("squashfs file"));
        }
        Ok(())
    }

    /// A subiquity installer is present; boot menus must not gain `boot=`.
    pub fn has_subiquity(&self) -> bool {
        self.installer_sources_name.is_some()
    }

    /// The image ships minimal/standard layers instead of one flat image.
    pub fn has_layered_squashfs(&self) -> bool {
        self.squashfs_name.is_none()
            && (self.minimal_squashfs_name.is_some() || self.standard_squashfs_name.is_some())
    }

    /// Images unpacked, bottom first, into `custom-root`.
    ///
    /// A flat image is the whole root. A layered image stacks the standard
    /// layer over the minimal base; the installer layer is not part of the
    /// installed system and is never unpacked.
    pub fn root_layers(&self) -> Vec<&str> {
        if let Some(name) = self.squashfs_name.as_deref() {
            return vec![name];
        }
        [self.minimal_squashfs_name.as_deref(), self.standard_squashfs_name.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// The image rebuilt from `custom-root`: the flat image, or the topmost
    /// root layer. Layers below it are carried over unchanged; the full
    /// customized root in the top layer shadows them.
    pub fn rebuilt_squashfs_name(&self) -> Option<&str> {
        self.root_layers().last().copied()
    }

    /// Manifest describing the rebuilt image.
    pub fn rebuilt_manifest_name(&self) -> Option<String> {
        if self.squashfs_name.is_some() {
            return Some(
                self.manifest_name
                    .clone()
                    .unwrap_or_else(|| catalog::MANIFEST_NAMES[0].to_string()),
            );
        }
        self.rebuilt_squashfs_name().map(|image| layer_sibling(image, "manifest"))
    }

    /// Size record of the rebuilt image.
    pub fn rebuilt_size_name(&self) -> Option<String> {
        if self.squashfs_name.is_some() {
            return Some(
                self.size_name
                    .clone()
                    .unwrap_or_else(|| catalog::SIZE_NAMES[0].to_string()),
            );
        }
        self.rebuilt_squashfs_name().map(|image| layer_sibling(image, "size"))
    }

    /// The value for the `boot=` kernel argument: only the leading component
    /// of the squashfs directory (Grml boots `live` but stores its files in
    /// `live/grml64-full`).
    pub fn boot_argument(&self) -> Option<&str> {
        self.squashfs_directory
            .as_deref()
            .and_then(|dir| dir.split('/').find(|part| !part.is_empty()))
    }

    /// The rebuilt image under `disk_root`, when its directory resolved.
    pub fn squashfs_file(&self, disk_root: &Path) -> Option<PathBuf> {
        self.in_squashfs_directory(disk_root, self.rebuilt_squashfs_name())
    }

    /// Every root layer under `disk_root`, bottom first.
    pub fn root_layer_files(&self, disk_root: &Path) -> Vec<PathBuf> {
        self.root_layers()
            .into_iter()
            .filter_map(|name| self.in_squashfs_directory(disk_root, Some(name)))
            .collect()
    }

    pub fn in_squashfs_directory(&self, disk_root: &Path, name: Option<&str>) -> Option<PathBuf> {
        let dir = self.squashfs_directory.as_deref()?;
        Some(disk_root.join(dir).join(name?))
    }

    pub fn in_casper_directory(&self, disk_root: &Path, name: Option<&str>) -> Option<PathBuf> {
        let dir = self.casper_directory.as_deref()?;
        Some(disk_root.join(dir).join(name?))
    }
}

/// `minimal.standard.squashfs` -> `minimal.standard.<extension>`.
fn layer_sibling(image: &str, extension: &str) -> String {
    let stem = image.strip_suffix(".squashfs").unwrap_or(image);
    format!("{}.{}", stem, extension)
}

/// First candidate directory holding one of `contents`; failing that, the
/// first candidate directory that exists at all.
fn first_directory(root: &Path, candidates: &[&str], contents: &[&str]) -> Option<String> {
    let existing: Vec<String> = candidates
        .iter()
        .filter_map(|candidate| match candidate.strip_suffix('*') {
            Some(prefix) => glob_directory(root, prefix),
            None => root.join(candidate).is_dir().then(|| candidate.to_string()),
        })
        .collect();
    existing
        .iter()
        .find(|dir| first_file(&root.join(dir), contents).is_some())
        .or_else(|| existing.first())
        .cloned()
}

/// First directory (in sorted order) whose relative path starts with `prefix`.
fn glob_directory(root: &Path, prefix: &str) -> Option<String> {
    let (parent, name_prefix) = match prefix.rsplit_once('/') {
        Some((parent, name)) => (root.join(parent), name),
        None => (root.to_path_buf(), prefix),
    };
    let mut matches: Vec<String> = fs::read_dir(&parent)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name.starts_with(name_prefix))
        .collect();
    matches.sort();
    let name = matches.into_iter().next()?;
    Some(match prefix.rsplit_once('/') {
        Some((parent, _)) => format!("{}/{}", parent, name),
        None => name,
    })
}

fn first_file(dir: &Path, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|name| dir.join(name).is_file())
        .map(|name| name.to_string())
}
