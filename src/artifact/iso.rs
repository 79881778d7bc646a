//! Writing the customized ISO with `xorriso -as mkisofs`.
//!
//! The boot setup (El Torito catalog, MBR/GPT tweaks, EFI partition) is
//! taken from the source ISO: xorriso can describe it as a list of mkisofs
//! options, which are replayed with the volume id swapped, the
//! modification date dropped and appended partitions read from the images
//! extracted into the project.

use crate::process::Cmd;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// The mkisofs options reproducing the boot setup of `source_iso`.
pub fn report_boot_options(source_iso: &Path) -> Result<String> {
    let result = Cmd::new("xorriso")
        .arg("-indev")
        .arg_path(source_iso)
        .args(["-report_el_torito", "as_mkisofs"])
        .error_msg("xorriso could not read the boot setup. Install xorriso.")
        .run()?;
    Ok(result.stdout)
}

/// Split one line of xorriso's report into words. Single quotes group,
/// a backslash escapes the next character outside quotes, and adjacent
/// pieces join (`--interval:...:'/x.iso'` is one word).
pub fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(q) => current.push(q),
                        None => bail!("unterminated quote in: {}", line),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Rewrite the reported options for the customized disk.
///
/// `partitions` maps partition numbers to extracted images; an
/// `-append_partition` without a matching image keeps its original source.
pub fn boot_options(report: &str, volume_id: &str, partitions: &[(usize, PathBuf)]) -> Result<Vec<String>> {
    let mut options = Vec::new();
    let mut has_volume_id = false;

    for line in report.lines() {
        let mut words = split_words(line)?;
        let Some(option) = words.first().cloned() else {
            continue;
        };
        match option.as_str() {
            "-V" => {
                has_volume_id = true;
                words = vec![option, volume_id.to_string()];
            }
            o if o.starts_with("--modification-date") => continue,
            "-append_partition" if words.len() == 4 => {
                let image = words[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| partitions.iter().find(|(i, _)| *i == n));
                match image {
                    Some((_, path)) => words[3] = path.to_string_lossy().into_owned(),
                    None => log::warn!("No extracted image for partition {}, using {}", words[1], words[3]),
                }
            }
            _ => {}
        }
        options.extend(words);
    }

    if !has_volume_id {
        let mut with_id = vec!["-V".to_string(), volume_id.to_string()];
        with_id.append(&mut options);
        return Ok(with_id);
    }
    Ok(options)
}

/// `xorriso -as mkisofs -r <boot options> -o <output> <disk_root>`.
pub fn xorriso_command(disk_root: &Path, output: &Path, boot_options: &[String]) -> Cmd {
    Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-r"])
        .args(boot_options)
        .arg("-o")
        .arg_path(output)
        .arg_path(disk_root)
        .error_msg("xorriso failed to write the ISO")
}
