//! Package manifests written next to the squashfs image.
//!
//! A manifest lists every installed package as `<name>\t<version>`, the
//! format `dpkg-query -W` prints and the installer reads back. The installer
//! layer's manifest keeps its installer-only packages on top of the
//! customized set, and remove lists drop packages that are gone.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DPKG_STATUS_PATH: &str = "var/lib/dpkg/status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// `name` or `name:arch` for `Multi-Arch: same` packages.
    pub package: String,
    pub version: String,
}

impl ManifestEntry {
    fn base_name(&self) -> &str {
        self.package.split(':').next().unwrap_or(&self.package)
    }
}

/// Installed packages from a dpkg status database, sorted by name.
pub fn parse_dpkg_status(content: &str) -> Vec<ManifestEntry> {
    let mut packages = BTreeMap::new();
    for stanza in content.split("\n\n") {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for line in stanza.lines() {
            // Continuation lines belong to multi-line fields we don't need.
            if line.starts_with([' ', '\t']) {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim(), value.trim());
            }
        }

        let (Some(name), Some(version), Some(status)) =
            (fields.get("Package"), fields.get("Version"), fields.get("Status"))
        else {
            continue;
        };
        if status.split_whitespace().last() != Some("installed") {
            continue;
        }
        let package = match (fields.get("Multi-Arch"), fields.get("Architecture")) {
            (Some(&"same"), Some(arch)) => format!("{}:{}", name, arch),
            _ => name.to_string(),
        };
        packages.insert(package, version.to_string());
    }
    packages
        .into_iter()
        .map(|(package, version)| ManifestEntry { package, version })
        .collect()
}

/// Package names from a remove list, one per line. Blank lines and `#`
/// comments are ignored.
pub fn parse_remove_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// `entries` without the packages named in `remove`. A bare name in the
/// list removes every architecture of that package.
pub fn subtract(entries: &[ManifestEntry], remove: &[String]) -> Vec<ManifestEntry> {
    entries
        .iter()
        .filter(|entry| {
            !remove
                .iter()
                .any(|name| *name == entry.package || *name == entry.base_name())
        })
        .cloned()
        .collect()
}

pub fn render(entries: &[ManifestEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}\t{}\n", e.package, e.version))
        .collect()
}

/// Read the installed package set of `custom_root`.
pub fn installed_packages(custom_root: &Path) -> Result<Vec<ManifestEntry>> {
    let path = custom_root.join(DPKG_STATUS_PATH);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading package database {}", path.display()))?;
    Ok(parse_dpkg_status(&content))
}

pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    fs::write(path, render(entries)).with_context(|| format!("writing manifest {}", path.display()))?;
    log::info!("Wrote {} ({} packages)", path.display(), entries.len());
    Ok(())
}

/// Entries of an existing manifest. A missing file is an empty manifest.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
    Ok(parse_manifest(&content))
}

pub fn parse_manifest(content: &str) -> Vec<ManifestEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let package = fields.next()?.to_string();
            let version = fields.next().unwrap_or_default().to_string();
            Some(ManifestEntry { package, version })
        })
        .collect()
}

/// The installer layer's manifest: the customized set plus the packages
/// only the installer layer adds. Those are the entries of `installer`
/// that the previous manifest of the rebuilt image did not list.
pub fn installer_manifest(
    customized: &[ManifestEntry],
    installer: &[ManifestEntry],
    previous: &[ManifestEntry],
) -> Vec<ManifestEntry> {
    let previous_names: Vec<String> = previous.iter().map(|e| e.package.clone()).collect();
    let mut merged: BTreeMap<String, String> = subtract(installer, &previous_names)
        .into_iter()
        .map(|e| (e.package, e.version))
        .collect();
    for entry in customized {
        merged.insert(entry.package.clone(), entry.version.clone());
    }
    merged
        .into_iter()
        .map(|(package, version)| ManifestEntry { package, version })
        .collect()
}

/// `content` without the package lines naming nothing in `installed`.
/// Comments and blank lines are kept.
pub fn prune_remove_list(content: &str, installed: &[ManifestEntry]) -> String {
    let mut pruned = String::new();
    for line in content.lines() {
        let keep = match parse_remove_list(line).first() {
            Some(name) => installed
                .iter()
                .any(|e| e.package == *name || e.base_name() == name.as_str()),
            None => true,
        };
        if keep {
            pruned.push_str(line);
            pruned.push('\n');
        }
    }
    pruned
}

/// Drop uninstalled packages from the remove list at `path`. Returns how
/// many lines were dropped; a missing list is left alone.
pub fn update_remove_list(path: &Path, installed: &[ManifestEntry]) -> Result<usize> {
    if !path.is_file() {
        return Ok(0);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading remove list {}", path.display()))?;
    let pruned = prune_remove_list(&content, installed);
    let dropped = content.lines().count() - pruned.lines().count();
    if dropped > 0 {
        fs::write(path, pruned).with_context(|| format!("writing remove list {}", path.display()))?;
        log::info!("Dropped {} uninstalled package(s) from {}", dropped, path.display());
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATUS: &str = "\
Package: zsh
Status: install ok installed
Architecture: amd64
Version: 5.9-6ubuntu2
Description: shell with lots of features
 Zsh is a UNIX command interpreter.

Package: libc6
Status: install ok installed
Multi-Arch: same
Architecture: amd64
Version: 2.39-0ubuntu8.3

Package: old-thing
Status: deinstall ok config-files
Architecture: all
Version: 1.0

Package: adduser
Status: install ok installed
Architecture: all
Version: 3.137ubuntu1
";

    #[test]
    fn installed_packages_only_sorted() {
        let entries = parse_dpkg_status(STATUS);
        let names: Vec<&str> = entries.iter().map(|e| e.package.as_str()).collect();
        assert_eq!(names, ["adduser", "libc6:amd64", "zsh"]);
        assert_eq!(
            render(&entries[..1]),
            "adduser\t3.137ubuntu1\n"
        );
    }

    #[test]
    fn remove_lists_subtract_by_name() {
        let entries = parse_dpkg_status(STATUS);
        let remove = parse_remove_list("# installer only\nlibc6\n\nzsh extra\n");
        assert_eq!(remove, ["libc6", "zsh"]);
        let kept = subtract(&entries, &remove);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].package, "adduser");
    }

    #[test]
    fn installer_keeps_its_own_packages() {
        let previous = parse_manifest("adduser\t3.137\nnano\t7.2\n");
        let installer = parse_manifest("adduser\t3.137\nnano\t7.2\nsubiquity\t24.04\ncasper\t1.4\n");
        let customized = parse_manifest("adduser\t3.138\nvim\t9.1\n");

        let merged = installer_manifest(&customized, &installer, &previous);
        assert_eq!(
            render(&merged),
            "adduser\t3.138\ncasper\t1.4\nsubiquity\t24.04\nvim\t9.1\n"
        );
        // Assembling again gives the same result.
        assert_eq!(installer_manifest(&customized, &merged, &customized), merged);
    }

    #[test]
    fn remove_list_drops_uninstalled_packages() {
        let temp = TempDir::new().unwrap();
        let entries = parse_dpkg_status(STATUS);
        let list = temp.path().join("filesystem.manifest-remove");
        assert_eq!(update_remove_list(&list, &entries).unwrap(), 0);

        fs::write(&list, "# live session only\nlibc6\nubiquity\nzsh\n").unwrap();
        assert_eq!(update_remove_list(&list, &entries).unwrap(), 1);
        assert_eq!(fs::read_to_string(&list).unwrap(), "# live session only\nlibc6\nzsh\n");
        assert_eq!(update_remove_list(&list, &entries).unwrap(), 0);
    }

    #[test]
    fn missing_manifest_reads_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_manifest(&temp.path().join("minimal.manifest")).unwrap().is_empty());
    }

    #[test]
    fn manifest_from_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("custom-root");
        fs::create_dir_all(root.join("var/lib/dpkg")).unwrap();
        fs::write(root.join(DPKG_STATUS_PATH), STATUS).unwrap();

        let entries = installed_packages(&root).unwrap();
        let manifest = temp.path().join("filesystem.manifest");
        write_manifest(&manifest, &entries).unwrap();
        let text = fs::read_to_string(&manifest).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("libc6:amd64\t2.39-0ubuntu8.3\n"));

        assert!(installed_packages(temp.path()).is_err());
    }
}
