use super::{rewrite_boot_config, Rewrite, RewriteParams};
use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

/// Directories of the disk that hold boot menus.
pub const BOOT_CONFIG_DIRECTORIES: &[&str] = &["boot", "isolinux"];

fn boot_menu_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)linux.*vmlinuz|kernel.*vmlinuz").expect("static boot menu pattern"))
}

/// Text files under `boot/` and `isolinux/` that reference a kernel,
/// relative to `custom_disk` and sorted.
pub fn find_boot_configurations(custom_disk: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for directory in BOOT_CONFIG_DIRECTORIES {
        let root = custom_disk.join(directory);
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            // Binary files (images, EFI executables, fonts) are skipped.
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            if boot_menu_pattern().is_match(&content) {
                if let Ok(relative) = entry.path().strip_prefix(custom_disk) {
                    found.push(relative.to_path_buf());
                }
            }
        }
    }
    found.sort();
    log::debug!("Found {} boot configuration file(s)", found.len());
    Ok(found)
}

/// Rewrite `files` (relative to `custom_disk`) in place. Files that do not
/// exist are skipped with a warning; unchanged files are not written.
pub fn rewrite_boot_config_files(
    custom_disk: &Path,
    files: &[PathBuf],
    params: &RewriteParams,
) -> Result<Vec<(PathBuf, Rewrite)>> {
    let mut results = Vec::with_capacity(files.len());
    for relative in files {
        let path = custom_disk.join(relative);
        if !path.is_file() {
            log::warn!("Boot configuration {} no longer exists", path.display());
            continue;
        }
        let original = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let rewrite = rewrite_boot_config(&original, params);
        if rewrite.is_changed(&original) {
            fs::write(&path, &rewrite.text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        log::info!(
            "Updated {} ({} change(s))",
            relative.display(),
            rewrite.update_count
        );
        results.push((relative.clone(), rewrite));
    }
    Ok(results)
}
