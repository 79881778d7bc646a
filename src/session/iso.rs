use crate::error::ValidationError;
use crate::project::naming;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const SECTOR_SIZE: u64 = 2048;
/// The primary volume descriptor sits in sector 16.
const PRIMARY_DESCRIPTOR: u64 = 16 * SECTOR_SIZE;
const STANDARD_ID: &[u8] = b"CD001";
const VOLUME_ID_OFFSET: usize = 40;
const VOLUME_ID_LENGTH: usize = 32;

pub const DISK_INFO_PATH: &str = ".disk/info";

/// Identity of a source ISO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoInfo {
    pub volume_id: String,
}

/// Check that `path` is an ISO 9660 image and read its volume id.
pub fn validate_source_iso(path: &Path) -> Result<IsoInfo, ValidationError> {
    let not_found = || ValidationError::IsoNotFound(path.to_path_buf());
    let not_iso = || ValidationError::NotAnIso(path.to_path_buf());

    let metadata = fs::metadata(path).map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    let mut file = File::open(path).map_err(|_| not_found())?;
    let mut descriptor = [0u8; 2048];
    file.seek(SeekFrom::Start(PRIMARY_DESCRIPTOR))
        .and_then(|_| file.read_exact(&mut descriptor))
        .map_err(|_| not_iso())?;

    if descriptor[0] != 1 || &descriptor[1..6] != STANDARD_ID {
        return Err(not_iso());
    }

    let raw = &descriptor[VOLUME_ID_OFFSET..VOLUME_ID_OFFSET + VOLUME_ID_LENGTH];
    let volume_id = String::from_utf8_lossy(raw)
        .trim_end_matches(['\0', ' '])
        .to_string();
    log::debug!("{} has volume id '{}'", path.display(), volume_id);
    Ok(IsoInfo { volume_id })
}

/// `.disk/info` of a disk tree and the release name quoted in it.
pub fn read_disk_info(disk_root: &Path) -> Option<(String, Option<String>)> {
    let info = fs::read_to_string(disk_root.join(DISK_INFO_PATH)).ok()?;
    let info = info.lines().next().unwrap_or_default().trim().to_string();
    if info.is_empty() {
        return None;
    }
    let release = naming::release_name_from_disk_info(&info);
    Some((info, release))
}

#[cfg(test)]
pub(crate) fn write_fake_iso(path: &Path, volume_id: &str) {
    let mut image = vec![0u8; (PRIMARY_DESCRIPTOR + SECTOR_SIZE) as usize];
    let descriptor = PRIMARY_DESCRIPTOR as usize;
    image[descriptor] = 1;
    image[descriptor + 1..descriptor + 6].copy_from_slice(STANDARD_ID);
    let id = &mut image[descriptor + VOLUME_ID_OFFSET..descriptor + VOLUME_ID_OFFSET + VOLUME_ID_LENGTH];
    id.fill(b' ');
    id[..volume_id.len()].copy_from_slice(volume_id.as_bytes());
    fs::write(path, image).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_volume_id() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path().join("ubuntu.iso");
        write_fake_iso(&iso, "Ubuntu 24.04 LTS amd64");
        assert_eq!(
            validate_source_iso(&iso),
            Ok(IsoInfo {
                volume_id: "Ubuntu 24.04 LTS amd64".to_string()
            })
        );
    }

    #[test]
    fn rejects_missing_and_foreign_files() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.iso");
        assert_eq!(validate_source_iso(&missing), Err(ValidationError::IsoNotFound(missing.clone())));
        assert_eq!(
            validate_source_iso(temp.path()),
            Err(ValidationError::IsoNotFound(temp.path().to_path_buf()))
        );

        let short = temp.path().join("short.iso");
        fs::write(&short, b"not an iso").unwrap();
        assert_eq!(validate_source_iso(&short), Err(ValidationError::NotAnIso(short.clone())));

        let zeros = temp.path().join("zeros.iso");
        fs::write(&zeros, vec![0u8; 40 * 1024]).unwrap();
        assert_eq!(validate_source_iso(&zeros), Err(ValidationError::NotAnIso(zeros.clone())));
    }

    #[test]
    fn disk_info_is_read() {
        let temp = TempDir::new().unwrap();
        assert_eq!(read_disk_info(temp.path()), None);

        fs::create_dir_all(temp.path().join(".disk")).unwrap();
        fs::write(
            temp.path().join(DISK_INFO_PATH),
            "Ubuntu 24.04 LTS \"Noble Numbat\" - Release amd64 (20240424)",
        )
        .unwrap();
        let (info, release) = read_disk_info(temp.path()).unwrap();
        assert!(info.starts_with("Ubuntu 24.04 LTS"));
        assert_eq!(release.as_deref(), Some("Noble Numbat"));
    }
}
