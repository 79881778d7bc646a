use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Squashfs compressors, persisted as their `mksquashfs -comp` tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Lz4,
    Lzo,
    #[default]
    Gzip,
    Zstd,
    Xz,
}

impl Compression {
    pub const ALL: [Compression; 5] = [
        Compression::Lz4,
        Compression::Lzo,
        Compression::Gzip,
        Compression::Zstd,
        Compression::Xz,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Lzo => "lzo",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Xz => "xz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Compression::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown compression '{}' (expected one of: lz4, lzo, gzip, zstd, xz)",
                    s
                )
            })
    }
}

/// User choices for generating the custom disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptionsBundle {
    pub update_os_release: bool,
    pub has_minimal_install: bool,
    /// Boot menus to rewrite, relative to `custom-disk`.
    pub boot_configurations: Vec<PathBuf>,
    pub compression: Compression,
}

impl Default for OptionsBundle {
    fn default() -> Self {
        Self {
            update_os_release: true,
            has_minimal_install: false,
            boot_configurations: Vec::new(),
            compression: Compression::default(),
        }
    }
}
