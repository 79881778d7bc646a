//! Partitions appended after the ISO 9660 filesystem.
//!
//! Hybrid images carry an EFI system partition (and sometimes more) after
//! the data area. The rebuilt ISO needs them as standalone files, so they
//! are copied out of the source ISO into `partition-<n>.img`.

use crate::process::Cmd;
use crate::project::{Project, MAX_PARTITIONS};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const DEFAULT_SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: usize,
    pub start: u64,
    pub sectors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub sector_size: u64,
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Read the table with `fdisk -l`.
    pub fn read(iso: &Path) -> Result<Self> {
        let result = Cmd::new("fdisk")
            .args(["-l", "-o", "Device,Start,Sectors"])
            .arg_path(iso)
            .error_msg("fdisk could not read the partition table")
            .run()?;
        Ok(parse_fdisk(result.stdout_trimmed(), &iso.to_string_lossy()))
    }

    /// Partitions after the first, which is the ISO 9660 data itself.
    pub fn appended(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries
            .iter()
            .filter(|e| (2..=MAX_PARTITIONS).contains(&e.index))
    }
}

/// Parse `fdisk -l -o Device,Start,Sectors <iso>` output.
pub fn parse_fdisk(output: &str, device_prefix: &str) -> PartitionTable {
    let sector_size = output
        .lines()
        .find_map(|line| {
            let rest = line.trim().strip_prefix("Units:")?;
            let bytes = rest.rsplit_once('=')?.1.trim();
            bytes.split_whitespace().next()?.parse::<u64>().ok()
        })
        .unwrap_or(DEFAULT_SECTOR_SIZE);

    let entries = output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Device"))
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let device = fields.first()?.strip_prefix(device_prefix)?;
            let index = device.parse::<usize>().ok()?;
            let numbers: Vec<u64> = fields[1..]
                .iter()
                .filter_map(|f| f.parse::<u64>().ok())
                .collect();
            let [start, sectors] = numbers.get(numbers.len().checked_sub(2)?..)? else {
                return None;
            };
            Some(PartitionEntry {
                index,
                start: *start,
                sectors: *sectors,
            })
        })
        .collect();

    PartitionTable {
        sector_size,
        entries,
    }
}

/// Copy every appended partition of `iso` into the project. Returns the
/// written images by partition index.
pub fn extract_partitions(iso: &Path, table: &PartitionTable, project: &Project) -> Result<Vec<(usize, PathBuf)>> {
    let mut written = Vec::new();
    for entry in table.appended() {
        let Some(target) = project.partition_image(entry.index) else {
            continue;
        };
        copy_range(
            iso,
            &target,
            entry.start * table.sector_size,
            entry.sectors * table.sector_size,
        )
        .with_context(|| format!("extracting partition {} of {}", entry.index, iso.display()))?;
        log::info!(
            "Extracted partition {} ({} bytes) to {}",
            entry.index,
            entry.sectors * table.sector_size,
            target.display()
        );
        written.push((entry.index, target));
    }
    Ok(written)
}

fn copy_range(source: &Path, target: &Path, offset: u64, length: u64) -> io::Result<()> {
    let mut input = File::open(source)?;
    input.seek(SeekFrom::Start(offset))?;
    let mut output = File::create(target)?;
    let copied = io::copy(&mut input.take(length), &mut output)?;
    if copied != length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, copied {}", length, copied),
        ));
    }
    output.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const GPT: &str = "\
Disk /isos/ubuntu.iso: 5.69 GiB, 6114656256 bytes, 11942688 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
Disklabel type: gpt

Device               Start  Sectors
/isos/ubuntu.iso1       64 11933328
/isos/ubuntu.iso2 11933392    10164
/isos/ubuntu.iso3 11943556      600
";

    #[test]
    fn parses_gpt_listing() {
        let table = parse_fdisk(GPT, "/isos/ubuntu.iso");
        assert_eq!(table.sector_size, 512);
        assert_eq!(table.entries.len(), 3);
        assert_eq!(
            table.entries[1],
            PartitionEntry {
                index: 2,
                start: 11933392,
                sectors: 10164
            }
        );
        let appended: Vec<usize> = table.appended().map(|e| e.index).collect();
        assert_eq!(appended, [2, 3]);
    }

    #[test]
    fn parses_dos_listing_with_boot_flag() {
        let output = "Units: sectors of 1 * 2048 = 2048 bytes\n\nDevice     Boot Start Sectors\n/x.iso1    *        0  100000\n/x.iso2          1000      20\n";
        let table = parse_fdisk(output, "/x.iso");
        assert_eq!(table.sector_size, 2048);
        assert_eq!(table.entries[0].start, 0);
        assert_eq!(table.entries[1].index, 2);
    }

    #[test]
    fn no_table_means_no_partitions() {
        let table = parse_fdisk("Disk /x.iso: 1 MiB, 1048576 bytes, 2048 sectors\n", "/x.iso");
        assert!(table.entries.is_empty());
        assert_eq!(table.sector_size, DEFAULT_SECTOR_SIZE);
    }

    #[test]
    fn appended_partitions_are_copied() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path().join("source.iso");
        let mut image = vec![0u8; 4096];
        image[2048..2560].fill(0xef);
        fs::write(&iso, &image).unwrap();

        let project = Project::new(temp.path()).unwrap();
        let table = PartitionTable {
            sector_size: 512,
            entries: vec![
                PartitionEntry { index: 1, start: 0, sectors: 4 },
                PartitionEntry { index: 2, start: 4, sectors: 1 },
            ],
        };
        let written = extract_partitions(&iso, &table, &project).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, 2);
        assert_eq!(fs::read(&written[0].1).unwrap(), vec![0xef; 512]);

        let beyond = PartitionTable {
            sector_size: 512,
            entries: vec![PartitionEntry { index: 2, start: 7, sectors: 4 }],
        };
        assert!(extract_partitions(&iso, &beyond, &project).is_err());
    }
}
