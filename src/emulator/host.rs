//! Host capabilities needed to boot the generated ISO.

use super::QEMU_BINARY;
use crate::process::Cmd;
use std::fs;

pub const CPUINFO_PATH: &str = "/proc/cpuinfo";
pub const MEMINFO_PATH: &str = "/proc/meminfo";
pub const GUI_PACKAGE: &str = "qemu-system-gui";
/// Version reported when QEMU is not installed.
pub const MISSING_VERSION: &str = "0.0";

const KIB: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapabilities {
    /// The CPU supports KVM (Intel VT-x or AMD-V).
    pub virtualization: bool,
    /// QEMU's GTK display backend is installed.
    pub gtk_display: bool,
    /// Bytes.
    pub total_memory: u64,
    /// Bytes.
    pub available_memory: u64,
    pub qemu_version: String,
}

impl HostCapabilities {
    pub fn detect() -> Self {
        let (total_memory, available_memory) = fs::read_to_string(MEMINFO_PATH)
            .map(|content| parse_meminfo(&content))
            .unwrap_or_default();
        let capabilities = Self {
            virtualization: fs::read_to_string(CPUINFO_PATH)
                .map(|content| has_virtualization(&content))
                .unwrap_or(false),
            gtk_display: gtk_display_installed(),
            total_memory,
            available_memory,
            qemu_version: qemu_version(),
        };
        log::debug!("Host capabilities: {:?}", capabilities);
        capabilities
    }

    pub fn has_qemu(&self) -> bool {
        self.qemu_version != MISSING_VERSION
    }
}

/// `vmx` (Intel) or `svm` (AMD) anywhere in `/proc/cpuinfo`.
pub fn has_virtualization(cpuinfo: &str) -> bool {
    cpuinfo.contains("vmx") || cpuinfo.contains("svm")
}

/// `(MemTotal, MemAvailable)` in bytes. `MemAvailable` falls back to
/// `MemFree` on kernels that lack it.
pub fn parse_meminfo(content: &str) -> (u64, u64) {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            line.strip_prefix(name)?
                .strip_prefix(':')?
                .split_whitespace()
                .next()?
                .parse::<u64>()
                .ok()
        })
    };
    let total = field("MemTotal").unwrap_or(0);
    let available = field("MemAvailable").or_else(|| field("MemFree")).unwrap_or(0);
    (total * KIB, available * KIB)
}

/// dpkg's status for a fully installed package.
const INSTALLED_STATUS: &str = "install ok installed";

fn gtk_display_installed() -> bool {
    Cmd::new("dpkg-query")
        .args(["--show", "--showformat=${Status}", GUI_PACKAGE])
        .allow_fail()
        .run()
        .map(|result| result.success() && is_installed_status(result.stdout_trimmed()))
        .unwrap_or(false)
}

/// True only for `install ok installed`; a purged package reports
/// `unknown ok not-installed`, a removed one `deinstall ok config-files`.
pub fn is_installed_status(status: &str) -> bool {
    status.trim() == INSTALLED_STATUS
}

fn qemu_version() -> String {
    if which::which(QEMU_BINARY).is_err() {
        return MISSING_VERSION.to_string();
    }
    Cmd::new(QEMU_BINARY)
        .arg("--version")
        .allow_fail()
        .run()
        .ok()
        .and_then(|result| parse_qemu_version(&result.stdout))
        .unwrap_or_else(|| MISSING_VERSION.to_string())
}

/// `QEMU emulator version 8.2.2 (Debian 1:8.2.2+ds-0ubuntu1)` gives `8.2.2`.
pub fn parse_qemu_version(output: &str) -> Option<String> {
    let line = output.lines().next()?;
    let rest = line.split("version").nth(1)?;
    rest.split_whitespace().next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fully_installed_package_counts() {
        assert!(is_installed_status("install ok installed"));
        assert!(is_installed_status("install ok installed\n"));
        assert!(!is_installed_status("unknown ok not-installed"));
        assert!(!is_installed_status("deinstall ok config-files"));
        assert!(!is_installed_status("install ok half-installed"));
        assert!(!is_installed_status(""));
    }

    #[test]
    fn virtualization_flags() {
        assert!(has_virtualization("flags\t: fpu vme de pse tsc msr pae mce cx8 vmx smx"));
        assert!(has_virtualization("flags\t: fpu svm lm"));
        assert!(!has_virtualization("flags\t: fpu vme de pse"));
    }

    #[test]
    fn meminfo_in_bytes() {
        let content = "MemTotal:       16315124 kB\nMemFree:         1234 kB\nMemAvailable:    2097152 kB\n";
        assert_eq!(parse_meminfo(content), (16315124 * 1024, 2097152 * 1024));
        assert_eq!(parse_meminfo("MemTotal: 100 kB\nMemFree: 40 kB\n"), (100 * 1024, 40 * 1024));
        assert_eq!(parse_meminfo(""), (0, 0));
    }

    #[test]
    fn qemu_version_line() {
        assert_eq!(
            parse_qemu_version("QEMU emulator version 8.2.2 (Debian 1:8.2.2+ds-0ubuntu1)\nCopyright"),
            Some("8.2.2".to_string())
        );
        assert_eq!(parse_qemu_version(""), None);
    }
}
