//! Installed kernels inside the customized root filesystem.
//!
//! A kernel is a `vmlinuz-<version>` in `custom-root/boot` with a matching
//! `initrd.img-<version>`. The selected one is copied onto the disk under the
//! names the original layout uses.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

pub const KERNEL_DIRECTORY: &str = "boot";
const VMLINUZ_PREFIX: &str = "vmlinuz-";
const INITRD_PREFIXES: &[&str] = &["initrd.img-", "initrd-"];

pub const DEFAULT_VMLINUZ_TARGET: &str = "vmlinuz";
pub const DEFAULT_INITRD_TARGET: &str = "initrd";

const NOTE_ORIGINAL: &str = "Used by the original disk";
const NOTE_NEWEST: &str = "Newest installed kernel";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelEntry {
    pub version_name: String,
    pub vmlinuz_source_name: String,
    pub vmlinuz_target_name: String,
    pub initrd_source_name: String,
    pub initrd_target_name: String,
    /// Relative to `custom-root`.
    pub directory: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub selected: bool,
}

impl KernelEntry {
    pub fn vmlinuz_source(&self, custom_root: &Path) -> std::path::PathBuf {
        custom_root.join(&self.directory).join(&self.vmlinuz_source_name)
    }

    pub fn initrd_source(&self, custom_root: &Path) -> std::path::PathBuf {
        custom_root.join(&self.directory).join(&self.initrd_source_name)
    }
}

/// Kernels ordered newest first. Exactly one entry is selected whenever the
/// list is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelList(Vec<KernelEntry>);

impl KernelList {
    /// Wrap entries, repairing the selection if it is missing or ambiguous.
    pub fn from_entries(entries: Vec<KernelEntry>) -> Self {
        let mut list = Self(entries);
        let first_selected = list.0.iter().position(|k| k.selected).unwrap_or(0);
        if !list.0.is_empty() {
            list.select_index(first_selected);
        }
        list
    }

    /// Scan `custom_root/boot`. `original_vmlinuz` is the kernel currently on
    /// the disk; a byte-identical installed kernel is selected by default,
    /// otherwise the newest one.
    pub fn discover(
        custom_root: &Path,
        vmlinuz_target: Option<&str>,
        initrd_target: Option<&str>,
        original_vmlinuz: Option<&Path>,
    ) -> Result<Self> {
        let boot = custom_root.join(KERNEL_DIRECTORY);
        if !boot.is_dir() {
            log::warn!("No kernel directory at {}", boot.display());
            return Ok(Self::default());
        }

        let names: Vec<String> = fs::read_dir(&boot)
            .with_context(|| format!("Failed to list {}", boot.display()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();

        let mut entries: Vec<KernelEntry> = names
            .iter()
            .filter_map(|name| name.strip_prefix(VMLINUZ_PREFIX).map(|v| (name, v)))
            .filter_map(|(vmlinuz, version)| {
                let initrd = INITRD_PREFIXES
                    .iter()
                    .map(|prefix| format!("{}{}", prefix, version))
                    .find(|candidate| names.contains(candidate));
                if initrd.is_none() {
                    log::debug!("Skipping {}: no matching initrd", vmlinuz);
                }
                initrd.map(|initrd| KernelEntry {
                    version_name: version.to_string(),
                    vmlinuz_source_name: vmlinuz.clone(),
                    vmlinuz_target_name: vmlinuz_target.unwrap_or(DEFAULT_VMLINUZ_TARGET).to_string(),
                    initrd_source_name: initrd,
                    initrd_target_name: initrd_target.unwrap_or(DEFAULT_INITRD_TARGET).to_string(),
                    directory: KERNEL_DIRECTORY.to_string(),
                    note: String::new(),
                    selected: false,
                })
            })
            .collect();

        entries.sort_by(|a, b| compare_versions(&b.version_name, &a.version_name));

        let original = original_vmlinuz.and_then(|path| file_md5(path).ok());
        let mut selected = 0;
        for (index, entry) in entries.iter_mut().enumerate() {
            // Installed kernels are often mode 0600; unreadable ones are just not matched.
            let matches_original = match &original {
                Some(hash) => file_md5(&entry.vmlinuz_source(custom_root)).ok().as_ref() == Some(hash),
                None => false,
            };
            if matches_original {
                entry.note = NOTE_ORIGINAL.to_string();
                selected = index;
            }
        }
        if let Some(newest) = entries.first_mut() {
            if newest.note.is_empty() {
                newest.note = NOTE_NEWEST.to_string();
            }
        }

        let mut list = Self(entries);
        if !list.is_empty() {
            list.select_index(selected);
        }
        log::info!("Found {} installed kernel(s) in {}", list.len(), boot.display());
        Ok(list)
    }

    pub fn entries(&self) -> &[KernelEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn selected(&self) -> Option<&KernelEntry> {
        self.0.iter().find(|k| k.selected)
    }

    /// Select the kernel with `version`. Returns false if it is not listed.
    pub fn select(&mut self, version: &str) -> bool {
        match self.0.iter().position(|k| k.version_name == version) {
            Some(index) => {
                self.select_index(index);
                true
            }
            None => false,
        }
    }

    fn select_index(&mut self, index: usize) {
        for (i, entry) in self.0.iter_mut().enumerate() {
            entry.selected = i == index;
        }
    }
}

fn file_md5(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Md5::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Compare kernel versions by their numeric and textual runs, so that
/// `6.8.0-45-generic` sorts after `6.8.0-9-generic`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (mut left, mut right) = (segments(a), segments(b));
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let order = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Greater,
                    (Err(_), Ok(_)) => Ordering::Less,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

fn segments(version: &str) -> impl Iterator<Item = &str> {
    let mut rest = version;
    std::iter::from_fn(move || {
        rest = rest.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
        if rest.is_empty() {
            return None;
        }
        let numeric = rest.starts_with(|c: char| c.is_ascii_digit());
        let end = rest
            .find(|c: char| !c.is_ascii_alphanumeric() || c.is_ascii_digit() != numeric)
            .unwrap_or(rest.len());
        let (segment, tail) = rest.split_at(end);
        rest = tail;
        Some(segment)
    })
}
