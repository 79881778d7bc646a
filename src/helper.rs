//! The verbs of `cubic-helper`, the program `pkexec` runs as root.
//!
//! Each verb does one privileged thing to paths the unprivileged side
//! names. Long-running verbs inherit stdio so their output reaches the
//! caller's pseudo-TTY, where the progress tracker reads it.

use crate::artifact::squashfs::{mksquashfs_command, unsquashfs_command};
use crate::mountinfo;
use crate::process::Cmd;
use crate::project::Compression;
use anyhow::{bail, Context, Result};
use regex::{NoExpand, RegexBuilder};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Host filesystems bound into the chroot, in mount order.
pub const CHROOT_BIND_MOUNTS: &[&str] = &["proc", "sys", "dev", "dev/pts", "run"];

pub const CHROOT_SHELL: &[&str] = &["/bin/bash", "--login"];

const STOP_GRACE: Duration = Duration::from_secs(3);

pub fn usage() -> &'static str {
    "Usage:\n  cubic-helper copy-path <source> <target>\n  cubic-helper delete-path <path>\n  cubic-helper stop-process <pid>\n  cubic-helper replace-text <regex> <replacement> <file>\n  cubic-helper mount-iso <iso> <mount-point>\n  cubic-helper unmount-path <mount-point>\n  cubic-helper extract-squashfs <image> <target>\n  cubic-helper compress-squashfs <source> <image> <lz4|lzo|gzip|zstd|xz>\n  cubic-helper enter-chroot <root>\n  cubic-helper unmount-chroot <root>"
}

/// Dispatch one helper invocation (arguments after the program name).
pub fn run(args: &[String]) -> Result<()> {
    match args {
        [verb, source, target] if verb == "copy-path" => copy_path(&absolute(source)?, &absolute(target)?),
        [verb, path] if verb == "delete-path" => delete_path(&absolute(path)?),
        [verb, pid] if verb == "stop-process" => {
            stop_process(pid.parse().with_context(|| format!("invalid pid '{}'", pid))?)
        }
        [verb, pattern, replacement, file] if verb == "replace-text" => {
            replace_text(pattern, replacement, &absolute(file)?).map(|_| ())
        }
        [verb, iso, mount_point] if verb == "mount-iso" => mount_iso(&absolute(iso)?, &absolute(mount_point)?),
        [verb, mount_point] if verb == "unmount-path" => unmount_path(&absolute(mount_point)?),
        [verb, image, target] if verb == "extract-squashfs" => extract_squashfs(&absolute(image)?, &absolute(target)?),
        [verb, source, image, compression] if verb == "compress-squashfs" => {
            let compression: Compression = compression.parse().map_err(anyhow::Error::msg)?;
            run_inherited(&mksquashfs_command(&absolute(source)?, &absolute(image)?, compression.as_str()))
        }
        [verb, root] if verb == "enter-chroot" => enter_chroot(&absolute(root)?),
        [verb, root] if verb == "unmount-chroot" => unmount_chroot(&absolute(root)?),
        _ => bail!(usage()),
    }
}

/// Helper arguments must be absolute; relative ones would resolve against
/// whatever directory `pkexec` starts in.
fn absolute(arg: &str) -> Result<PathBuf> {
    let path = PathBuf::from(arg);
    if !path.is_absolute() {
        bail!("'{}' is not an absolute path", arg);
    }
    Ok(path)
}

/// Copy a file, or a directory tree preserving symlinks.
pub fn copy_path(source: &Path, target: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(source)
        .with_context(|| format!("Failed to stat {}", source.display()))?;
    if metadata.is_dir() {
        copy_dir_recursive(source, target)
    } else {
        fs::copy(source, target)
            .with_context(|| format!("Failed to copy {} to {}", source.display(), target.display()))?;
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create directory: {}", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }
    Ok(())
}

/// Remove a file or tree. Absent paths are fine; `/` is refused, and so is
/// a tree with anything still mounted inside it.
pub fn delete_path(path: &Path) -> Result<()> {
    if path.parent().is_none() {
        bail!("refusing to delete {}", path.display());
    }
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if metadata.is_dir() {
        let mounted = mountinfo::mounts_under(path, &mountinfo::read_mounts());
        if let Some(mount) = mounted.first() {
            bail!("refusing to delete {}: {} is mounted", path.display(), mount.display());
        }
        fs::remove_dir_all(path).with_context(|| format!("Failed to delete {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("Failed to delete {}", path.display()))
    }
}

/// SIGTERM the process group led by `pid`, then SIGKILL if it lingers.
pub fn stop_process(pid: i32) -> Result<()> {
    if pid <= 1 {
        bail!("refusing to stop pid {}", pid);
    }
    if !signal(pid, libc::SIGTERM) {
        return Ok(());
    }
    let deadline = Instant::now() + STOP_GRACE;
    while Instant::now() < deadline {
        // SAFETY: signal 0 only checks that the process exists.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
    signal(pid, libc::SIGKILL);
    Ok(())
}

/// Signal the group, or the single process if it leads no group. False if
/// neither exists.
fn signal(pid: i32, sig: i32) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pid, sig) == 0 || libc::kill(pid, sig) == 0 }
}

/// Replace every match of `pattern` (multi-line mode) with the literal
/// `replacement`. Returns the number of replacements.
pub fn replace_text(pattern: &str, replacement: &str, file: &Path) -> Result<usize> {
    let regex = RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .with_context(|| format!("invalid pattern '{}'", pattern))?;
    let text = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let count = regex.find_iter(&text).count();
    if count > 0 {
        let updated = regex.replace_all(&text, NoExpand(replacement));
        fs::write(file, updated.as_bytes()).with_context(|| format!("Failed to write {}", file.display()))?;
    }
    Ok(count)
}

/// Unpack `image` over `target`. A layer unpacked over a lower one leaves
/// overlayfs whiteouts where it deletes files; those are removed.
pub fn extract_squashfs(image: &Path, target: &Path) -> Result<()> {
    run_inherited(&unsquashfs_command(image, target))?;
    let removed = remove_whiteouts(target)?;
    if removed > 0 {
        println!("Removed {} whiteout(s) under {}", removed, target.display());
    }
    Ok(())
}

/// An overlayfs whiteout is a character device with device number 0/0.
pub fn is_whiteout(is_char_device: bool, rdev: u64) -> bool {
    is_char_device && rdev == 0
}

/// Delete every whiteout under `root`. Returns how many were removed.
pub fn remove_whiteouts(root: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in WalkDir::new(root).same_file_system(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        if is_whiteout(metadata.file_type().is_char_device(), metadata.rdev()) {
            fs::remove_file(entry.path())
                .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn mount_iso(iso: &Path, mount_point: &Path) -> Result<()> {
    fs::create_dir_all(mount_point)?;
    Cmd::new("mount")
        .args(["-o", "loop,ro"])
        .arg_path(iso)
        .arg_path(mount_point)
        .error_msg(format!("Failed to mount {}", iso.display()))
        .run()?;
    Ok(())
}

/// Unmount, falling back to a lazy unmount when the target is busy.
pub fn unmount_path(mount_point: &Path) -> Result<()> {
    let result = Cmd::new("umount").arg_path(mount_point).allow_fail().run()?;
    if result.success() {
        return Ok(());
    }
    eprintln!(
        "umount {} failed ({}), retrying lazily",
        mount_point.display(),
        result.stderr_trimmed()
    );
    Cmd::new("umount")
        .arg("--lazy")
        .arg_path(mount_point)
        .error_msg(format!("Failed to unmount {}", mount_point.display()))
        .run()?;
    Ok(())
}

/// Bind the host filesystems into `root`, run a login shell chrooted
/// there, and unmount again once it exits.
pub fn enter_chroot(root: &Path) -> Result<()> {
    if !root.join("bin").exists() {
        bail!("{} does not look like a root filesystem", root.display());
    }
    let mut mounted = Vec::new();
    let bound = bind_mounts(root, &mut mounted);
    let shell = bound.and_then(|()| {
        Cmd::new("chroot")
            .arg_path(root)
            .args(CHROOT_SHELL)
            .to_command()
            .status()
            .context("Failed to start the chroot shell")
    });
    for target in mounted.iter().rev() {
        if let Err(e) = unmount_path(target) {
            eprintln!("{:#}", e);
        }
    }
    let status = shell?;
    if !status.success() {
        bail!("chroot shell exited with {}", status);
    }
    Ok(())
}

fn bind_mounts(root: &Path, mounted: &mut Vec<PathBuf>) -> Result<()> {
    for relative in CHROOT_BIND_MOUNTS {
        let source = Path::new("/").join(relative);
        let target = root.join(relative);
        fs::create_dir_all(&target)?;
        Cmd::new("mount")
            .arg("--bind")
            .arg_path(&source)
            .arg_path(&target)
            .error_msg(format!("Failed to bind {}", source.display()))
            .run()?;
        mounted.push(target);
    }
    Ok(())
}

/// Unmount everything still mounted under `root`, deepest first.
pub fn unmount_chroot(root: &Path) -> Result<()> {
    let mut failures = Vec::new();
    for target in mountinfo::mounts_under(root, &mountinfo::read_mounts()) {
        if let Err(e) = unmount_path(&target) {
            failures.push(format!("{:#}", e));
        }
    }
    if !failures.is_empty() {
        bail!("{}", failures.join("\n"));
    }
    Ok(())
}

/// Run with inherited stdio so output streams to the caller's terminal.
fn run_inherited(cmd: &Cmd) -> Result<()> {
    let status = cmd
        .to_command()
        .status()
        .with_context(|| format!("Failed to execute '{}'", cmd.program()))?;
    if !status.success() {
        bail!("'{}' failed with {}", cmd, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn release_field_is_replaced_literally() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("os-release");
        fs::write(&file, "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\nID=ubuntu\n").unwrap();

        let count = replace_text("^PRETTY_NAME=.*$", "PRETTY_NAME=\"Custom $1 (Cubic)\"", &file).unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Custom $1 (Cubic)\"\nID=ubuntu\n"
        );
        assert_eq!(replace_text("^MISSING=.*$", "x", &file).unwrap(), 0);
    }

    #[test]
    fn copies_files_and_trees() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file"), b"data").unwrap();
        std::os::unix::fs::symlink("nested/file", src.join("link")).unwrap();

        let dst = temp.path().join("dst");
        copy_path(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("nested/file")).unwrap(), b"data");
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), PathBuf::from("nested/file"));

        let single = temp.path().join("vmlinuz");
        copy_path(&src.join("nested/file"), &single).unwrap();
        assert_eq!(fs::read(&single).unwrap(), b"data");
    }

    #[test]
    fn delete_tolerates_absence() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("custom-root");
        fs::create_dir_all(tree.join("etc")).unwrap();
        delete_path(&tree).unwrap();
        assert!(!tree.exists());
        delete_path(&tree).unwrap();
        assert!(delete_path(Path::new("/")).is_err());
    }

    #[test]
    fn only_zero_character_devices_are_whiteouts() {
        assert!(is_whiteout(true, 0));
        assert!(!is_whiteout(true, libc::makedev(1, 3) as u64));
        assert!(!is_whiteout(false, 0));
    }

    #[test]
    fn whiteout_sweep_keeps_regular_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/hostname"), b"ubuntu").unwrap();
        std::os::unix::fs::symlink("hostname", temp.path().join("etc/link")).unwrap();

        assert_eq!(remove_whiteouts(temp.path()).unwrap(), 0);
        assert!(temp.path().join("etc/hostname").exists());
        assert!(fs::symlink_metadata(temp.path().join("etc/link")).is_ok());
    }

    #[test]
    fn dispatch_validates_arguments() {
        assert!(run(&args(&["copy-path", "relative", "/abs"])).is_err());
        assert!(run(&args(&["stop-process", "abc"])).is_err());
        assert!(run(&args(&["stop-process", "1"])).is_err());
        assert!(run(&args(&["compress-squashfs", "/a", "/b", "brotli"])).is_err());
        assert!(run(&args(&["frobnicate"])).unwrap_err().to_string().contains("Usage"));
        assert!(run(&[]).is_err());
    }

    #[test]
    fn stopping_a_finished_process_is_fine() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        stop_process(pid).unwrap();
    }

    #[test]
    fn stops_a_running_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        stop_process(child.id() as i32).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
