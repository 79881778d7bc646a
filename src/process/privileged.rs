//! Invocations of the elevated helper.
//!
//! Everything under `custom-root` is owned by root, and mounting needs root,
//! so those operations go through `pkexec cubic-helper <verb> ...`. The
//! helper binary lives at [`DEFAULT_HELPER`] unless `CUBIC_HELPER` points
//! elsewhere.

use super::Cmd;
use std::path::{Path, PathBuf};

pub const DEFAULT_HELPER: &str = "/usr/libexec/cubic/cubic-helper";
pub const HELPER_ENV: &str = "CUBIC_HELPER";
pub const PKEXEC: &str = "pkexec";

/// Location of the helper binary.
pub fn helper_path() -> PathBuf {
    std::env::var_os(HELPER_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HELPER))
}

/// True if `arg` names the helper binary.
pub fn is_helper_path(arg: &str) -> bool {
    Path::new(arg) == helper_path() || arg == DEFAULT_HELPER
}

fn helper(verb: &str) -> Cmd {
    Cmd::new(PKEXEC).arg_path(&helper_path()).arg(verb)
}

pub fn copy_path(source: &Path, target: &Path) -> Cmd {
    helper("copy-path").arg_path(source).arg_path(target)
}

pub fn delete_path(path: &Path) -> Cmd {
    helper("delete-path").arg_path(path)
}

pub fn stop_process(pid: u32) -> Cmd {
    helper("stop-process").arg(pid.to_string())
}

pub fn replace_text(pattern: &str, replacement: &str, file: &Path) -> Cmd {
    helper("replace-text")
        .arg(pattern)
        .arg(replacement)
        .arg_path(file)
}

pub fn mount_iso(iso: &Path, mount_point: &Path) -> Cmd {
    helper("mount-iso").arg_path(iso).arg_path(mount_point)
}

pub fn unmount_path(mount_point: &Path) -> Cmd {
    helper("unmount-path").arg_path(mount_point)
}

pub fn extract_squashfs(image: &Path, target: &Path) -> Cmd {
    helper("extract-squashfs").arg_path(image).arg_path(target)
}

pub fn compress_squashfs(source: &Path, image: &Path, compression: &str) -> Cmd {
    helper("compress-squashfs")
        .arg_path(source)
        .arg_path(image)
        .arg(compression)
}

pub fn enter_chroot(root: &Path) -> Cmd {
    helper("enter-chroot").arg_path(root)
}

pub fn unmount_chroot(root: &Path) -> Cmd {
    helper("unmount-chroot").arg_path(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_commands_are_elevated() {
        let cmd = delete_path(Path::new("/work/custom-root"));
        assert!(cmd.is_elevated());
        assert_eq!(cmd.program(), PKEXEC);
        assert_eq!(cmd.get_args()[1], "delete-path");
        assert_eq!(cmd.get_args()[2], "/work/custom-root");
    }

    #[test]
    fn compress_passes_compression_tag() {
        let cmd = compress_squashfs(
            Path::new("/work/custom-root"),
            Path::new("/work/custom-disk/casper/filesystem.squashfs"),
            "zstd",
        );
        assert_eq!(cmd.get_args().last().map(String::as_str), Some("zstd"));
    }

    #[test]
    fn stop_process_formats_pid() {
        let cmd = stop_process(4242);
        assert_eq!(cmd.get_args()[1..], ["stop-process", "4242"]);
    }
}
