//! Names of the customized disk, derived from the original's.

use regex::Regex;
use std::sync::OnceLock;
use time::{Date, OffsetDateTime};

/// ISO 9660 limit on the volume identifier.
pub const VOLUME_ID_LIMIT: usize = 32;

fn version_suffix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[- ][0-9]{4}\.[0-9]{2}\.[0-9]{2}$").expect("static version pattern"))
}

fn strip_version(name: &str) -> &str {
    match version_suffix().find(name) {
        Some(m) => &name[..m.start()],
        None => name,
    }
}

/// `YYYY.MM.DD`.
pub fn version_number(date: Date) -> String {
    format!("{:04}.{:02}.{:02}", date.year(), date.month() as u8, date.day())
}

pub fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

/// `ubuntu-24.04-desktop-amd64.iso` becomes `ubuntu-24.04-desktop-amd64-<version>.iso`.
/// A version added by an earlier customization is replaced.
pub fn custom_iso_file_name(original_file_name: &str, version: &str) -> String {
    let stem = original_file_name
        .strip_suffix(".iso")
        .or_else(|| original_file_name.strip_suffix(".ISO"))
        .unwrap_or(original_file_name);
    format!("{}-{}.iso", strip_version(stem), version)
}

/// `<original> <version>`, shortening the original part to fit the ISO 9660 limit.
pub fn custom_volume_id(original_volume_id: &str, version: &str) -> String {
    let base = strip_version(original_volume_id.trim());
    let room = VOLUME_ID_LIMIT.saturating_sub(version.len() + 1);
    let base: String = base.chars().take(room).collect();
    let id = format!("{} {}", base.trim_end(), version);
    id.chars().take(VOLUME_ID_LIMIT).collect()
}

/// Contents of `.disk/info` for the customized disk.
pub fn custom_disk_name(volume_id: &str, release_name: &str, date: Date) -> String {
    let stamp = format!("{:04}{:02}{:02}", date.year(), date.month() as u8, date.day());
    if release_name.is_empty() {
        format!("{} ({})", volume_id, stamp)
    } else {
        format!("{} \"{}\" ({})", volume_id, release_name, stamp)
    }
}

/// The quoted release name in a `.disk/info` line such as
/// `Ubuntu 24.04 LTS "Noble Numbat" - Release amd64 (20240424)`.
pub fn release_name_from_disk_info(info: &str) -> Option<String> {
    let start = info.find('"')? + 1;
    let end = start + info[start..].find('"')?;
    let name = info[start..end].trim();
    (!name.is_empty()).then(|| name.to_string())
}
