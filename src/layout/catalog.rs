//! Candidate names per layout slot, in priority order.
//!
//! Ubuntu keeps the live kernel and squashfs in `casper/`, Debian in
//! `install/` or `d-i/` and `live/`, Grml under `boot/grml64full` and
//! `live/grml64-full`, Fedora-style images in `LiveOS/`, Pop!_OS in a
//! versioned `casper_pop-os_<ver>` directory.

/// Directories holding the live kernel and initrd. Entries ending in `*`
/// match any directory name with that prefix.
pub const CASPER_DIRECTORIES: &[&str] = &[
    "d-i",
    "d-i/gtk",
    "install",
    "live",
    "boot/grml64full",
    "LiveOS",
    "casper",
    "casper_pop-os*",
];

pub const INITRD_NAMES: &[&str] = &["initrd.img", "initrd.gz", "initrd.lz", "initrd"];

pub const VMLINUZ_NAMES: &[&str] = &["vmlinuz.efi", "vmlinuz"];

pub const SQUASHFS_DIRECTORIES: &[&str] = &["install", "live", "live/grml64-full", "LiveOS", "casper"];

pub const SQUASHFS_NAMES: &[&str] = &["grml64-full.squashfs", "squashfs.img", "filesystem.squashfs"];

pub const MANIFEST_NAMES: &[&str] = &["filesystem.manifest", "squashfs.manifest"];

pub const SIZE_NAMES: &[&str] = &["filesystem.size"];

pub const MINIMAL_REMOVE_NAMES: &[&str] = &["filesystem.manifest-minimal-remove"];

pub const STANDARD_REMOVE_NAMES: &[&str] = &["filesystem.manifest-remove"];

/// Presence identifies a subiquity-style installer.
pub const INSTALLER_SOURCES_NAMES: &[&str] = &["install-sources.yaml"];

/// Layered images: a minimal base, a standard layer, and an installer layer.
pub const MINIMAL_SQUASHFS_NAMES: &[&str] = &["minimal.squashfs"];
pub const MINIMAL_MANIFEST_NAMES: &[&str] = &["minimal.manifest"];
pub const MINIMAL_SIZE_NAMES: &[&str] = &["minimal.size"];

pub const STANDARD_SQUASHFS_NAMES: &[&str] = &["minimal.standard.squashfs"];
pub const STANDARD_MANIFEST_NAMES: &[&str] = &["minimal.standard.manifest"];
pub const STANDARD_SIZE_NAMES: &[&str] = &["minimal.standard.size"];

pub const INSTALLER_SQUASHFS_NAMES: &[&str] = &["minimal.standard.live.squashfs"];
pub const INSTALLER_MANIFEST_NAMES: &[&str] = &["minimal.standard.live.manifest"];
pub const INSTALLER_SIZE_NAMES: &[&str] = &["minimal.standard.live.size"];

/// Every squashfs file name the catalog knows, flat or layered.
pub fn all_squashfs_names() -> impl Iterator<Item = &'static str> {
    SQUASHFS_NAMES
        .iter()
        .chain(MINIMAL_SQUASHFS_NAMES)
        .chain(STANDARD_SQUASHFS_NAMES)
        .chain(INSTALLER_SQUASHFS_NAMES)
        .copied()
}
