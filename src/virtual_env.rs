//! The virtual environment: a root shell inside `custom-root`.
//!
//! The shell runs under `pkexec cubic-helper enter-chroot`, which bind-mounts
//! the kernel filesystems, runs a login shell chrooted into the project and
//! unmounts again when the shell ends. It is started outside the runner's
//! current-process slot, so cancelling a long step never kills it; only
//! [`VirtualEnvironment::exit_virtual_environment`] ends it. Leaving the
//! shell stamps the release files with the custom disk's name when the
//! project asks for it.

use crate::mountinfo;
use crate::process::{privileged, signal_group, AsyncProcess, Chunk, Cmd, ProcessRunner};
use crate::helper;
use crate::project::{Project, ProjectConfig};
use crate::session::ProjectLock;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const LOGOUT_COMMAND: &[u8] = b"logout\n";
const EXIT_GRACE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(100);

/// Release files and the field holding their description.
pub const OS_RELEASE_FILES: &[(&str, &str)] = &[
    ("etc/lsb-release", "DISTRIB_DESCRIPTION"),
    ("etc/os-release", "PRETTY_NAME"),
    ("usr/lib/os-release", "PRETTY_NAME"),
];

type StatusCallback = Box<dyn FnMut(bool) + Send>;

pub struct VirtualEnvironment {
    project: Project,
    runner: Arc<ProcessRunner>,
    shell: Option<AsyncProcess>,
    elevated: bool,
    lock: Option<ProjectLock>,
    status_callback: Option<StatusCallback>,
    release_description: Option<String>,
}

impl VirtualEnvironment {
    pub fn new(project: Project, runner: Arc<ProcessRunner>) -> Self {
        Self {
            project,
            runner,
            shell: None,
            elevated: false,
            lock: None,
            status_callback: None,
            release_description: None,
        }
    }

    /// Take the release-file update for the next exit from `config`:
    /// none unless `update_os_release` is set.
    pub fn configure_os_release(&mut self, config: &ProjectConfig) {
        self.release_description = config.options.update_os_release.then(|| {
            os_release_description(&config.custom.iso_volume_id, &config.project.modify_date)
        });
    }

    /// Called with `true` when the shell starts and `false` when it ends.
    /// May be called more than once for the same state.
    pub fn set_status_callback<F>(&mut self, callback: F)
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.status_callback = Some(Box::new(callback));
    }

    pub fn remove_status_callback(&mut self) {
        self.status_callback = None;
    }

    /// Start the chroot shell. Does nothing if it is already running.
    pub fn enter(&mut self) -> Result<()> {
        let cmd = privileged::enter_chroot(&self.project.custom_root());
        self.enter_with(&cmd)
    }

    pub(crate) fn enter_with(&mut self, cmd: &Cmd) -> Result<()> {
        if self.is_running() {
            log::debug!("Virtual environment already running");
            return Ok(());
        }
        let lock = ProjectLock::acquire(&self.project.lock_file())?;
        let shell = self
            .runner
            .run_async_unregistered(cmd)
            .with_context(|| format!("starting virtual environment: {}", cmd))?;
        log::info!("Entered virtual environment (pid {})", shell.pid());

        self.lock = Some(lock);
        self.shell = Some(shell);
        self.elevated = cmd.is_elevated();
        self.notify(true);
        Ok(())
    }

    /// A shell was started and not yet exited through
    /// [`Self::exit_virtual_environment`], whether or not it is still alive.
    pub fn is_entered(&self) -> bool {
        self.shell.is_some()
    }

    pub fn is_running(&mut self) -> bool {
        crate::process::is_alive(self.shell.as_mut())
    }

    /// Terminal output, waiting up to `wait`. `Ok(None)` once the shell has
    /// closed its terminal.
    pub fn read_output(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let Some(shell) = self.shell.as_mut() else {
            return Ok(None);
        };
        match shell.read_chunk(wait)? {
            Chunk::Data(bytes) => Ok(Some(bytes)),
            Chunk::Idle => Ok(Some(Vec::new())),
            Chunk::Eof => {
                self.notify(false);
                Ok(None)
            }
        }
    }

    /// Keystrokes from the terminal view.
    pub fn send_input(&mut self, bytes: &[u8]) -> Result<()> {
        let shell = self
            .shell
            .as_mut()
            .context("virtual environment is not running")?;
        shell.write(bytes).context("writing to virtual environment")
    }

    /// Log out of the shell, undo the bind mounts and release the lock,
    /// then update the release files if configured. Safe to call when
    /// nothing is running.
    pub fn exit_virtual_environment(&mut self) -> Result<()> {
        let left = self.shell.is_some();
        if let Some(mut shell) = self.shell.take() {
            if shell.is_alive() {
                if let Err(e) = shell.write(LOGOUT_COMMAND) {
                    log::debug!("Could not send logout: {}", e);
                }
                wait_for_eof(&mut shell, EXIT_GRACE);
            }
            if shell.is_alive() {
                log::warn!("Virtual environment did not exit, stopping pid {}", shell.pid());
                if self.elevated {
                    let cmd = privileged::stop_process(shell.pid());
                    if let Err(e) = self.runner.run_sync_unregistered(&cmd) {
                        log::warn!("{}: {}", cmd, e);
                    }
                } else {
                    signal_group(shell.pid(), libc::SIGTERM);
                }
            }
            shell.close()?;
            log::info!(
                "Left virtual environment (exit={:?}, signal={:?})",
                shell.exit_status(),
                shell.signal_status()
            );
        }

        let custom_root = self.project.custom_root();
        if !mountinfo::mounts_under(&custom_root, &mountinfo::read_mounts()).is_empty() {
            let cmd = privileged::unmount_chroot(&custom_root);
            self.runner
                .run_sync_unregistered(&cmd)?
                .check(&cmd)
                .context("unmounting virtual environment")?;
        }

        self.lock = None;
        self.notify(false);

        if left {
            if let Some(description) = self.release_description.clone() {
                let updated = self.update_os_release(&description)?;
                log::info!("Updated {} release file(s)", updated.len());
            }
        }
        Ok(())
    }

    /// Rewrite the release descriptions in `custom-root`, with the same
    /// privileges the shell had. Returns the files that were updated.
    fn update_os_release(&self, description: &str) -> Result<Vec<PathBuf>> {
        let mut updated = Vec::new();
        for edit in os_release_edits(&self.project.custom_root(), description) {
            if self.elevated {
                let cmd = edit.command();
                self.runner
                    .run_sync_unregistered(&cmd)?
                    .check(&cmd)
                    .with_context(|| format!("updating {}", edit.path.display()))?;
            } else {
                helper::replace_text(&edit.pattern, &edit.replacement, &edit.path)?;
            }
            updated.push(edit.path);
        }
        Ok(updated)
    }

    fn notify(&mut self, running: bool) {
        if let Some(callback) = self.status_callback.as_mut() {
            callback(running);
        }
    }
}

impl Drop for VirtualEnvironment {
    fn drop(&mut self) {
        if self.shell.is_some() {
            if let Err(e) = self.exit_virtual_environment() {
                log::warn!("Failed to leave virtual environment: {:#}", e);
            }
        }
    }
}

fn wait_for_eof(shell: &mut AsyncProcess, grace: Duration) {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match shell.read_chunk(POLL) {
            Ok(Chunk::Eof) | Err(_) => return,
            Ok(Chunk::Data(_)) | Ok(Chunk::Idle) => {}
        }
    }
}

/// `<volume id> (Cubic <modify date>)`.
pub fn os_release_description(volume_id: &str, modify_date: &str) -> String {
    format!("{} (Cubic {})", volume_id, modify_date)
}

/// One description field to replace in a release file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEdit {
    pub path: PathBuf,
    pub pattern: String,
    pub replacement: String,
}

impl ReleaseEdit {
    /// The elevated `replace-text` invocation for this edit.
    pub fn command(&self) -> Cmd {
        privileged::replace_text(&self.pattern, &self.replacement, &self.path)
    }
}

/// Edits for the release files present in `root`. Missing files and
/// symlinks are skipped.
pub fn os_release_edits(root: &Path, description: &str) -> Vec<ReleaseEdit> {
    let value = description.replace('\\', "\\\\").replace('"', "\\\"");
    OS_RELEASE_FILES
        .iter()
        .filter_map(|(relative, key)| {
            let path = root.join(relative);
            let metadata = fs::symlink_metadata(&path).ok()?;
            if !metadata.file_type().is_file() {
                log::debug!("Skipping {}: not a regular file", path.display());
                return None;
            }
            Some(ReleaseEdit {
                path,
                pattern: format!("^{}=.*$", key),
                replacement: format!("{}=\"{}\"", key, value),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn environment(temp: &TempDir) -> VirtualEnvironment {
        let project = Project::new(temp.path()).unwrap();
        VirtualEnvironment::new(project, Arc::new(ProcessRunner::new()))
    }

    fn read_until(env: &mut VirtualEnvironment, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline && !seen.contains(needle) {
            match env.read_output(POLL).unwrap() {
                Some(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }
        seen
    }

    #[test]
    fn shell_session_lifecycle() {
        let temp = TempDir::new().unwrap();
        let mut env = environment(&temp);
        let states = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&states);
        env.set_status_callback(move |running| recorder.lock().unwrap().push(running));

        let shell = Cmd::shell("echo ready; read line; echo got-$line");
        env.enter_with(&shell).unwrap();
        assert!(env.is_running());
        assert!(temp.path().join(".#custom-root.lck").exists());
        assert!(read_until(&mut env, "ready").contains("ready"));

        // A second enter while running is a no-op.
        env.enter_with(&shell).unwrap();

        env.exit_virtual_environment().unwrap();
        assert!(!env.is_running());
        assert!(!temp.path().join(".#custom-root.lck").exists());

        env.exit_virtual_environment().unwrap();
        let states = states.lock().unwrap();
        assert_eq!(states.first(), Some(&true));
        assert_eq!(states.last(), Some(&false));
        assert_eq!(states.iter().filter(|s| **s).count(), 1);
    }

    #[test]
    fn stubborn_shell_is_stopped() {
        let temp = TempDir::new().unwrap();
        let mut env = environment(&temp);
        env.enter_with(&Cmd::shell("trap '' HUP; while true; do sleep 1; done")).unwrap();

        let started = Instant::now();
        env.exit_virtual_environment().unwrap();
        assert!(!env.is_running());
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[test]
    fn input_requires_running_shell() {
        let temp = TempDir::new().unwrap();
        let mut env = environment(&temp);
        assert!(env.send_input(b"ls\n").is_err());
        assert_eq!(env.read_output(POLL).unwrap(), None);
    }

    #[test]
    fn enter_refuses_locked_project() {
        let temp = TempDir::new().unwrap();
        let mut env = environment(&temp);
        let _held = ProjectLock::acquire(&temp.path().join(".#custom-root.lck")).unwrap();
        assert!(env.enter_with(&Cmd::shell("true")).is_err());
        assert!(!env.is_running());
    }

    #[test]
    fn release_edits_skip_missing_and_symlinks() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib/os-release"), "PRETTY_NAME=\"Ubuntu 24.04 LTS\"\n").unwrap();
        std::os::unix::fs::symlink("../usr/lib/os-release", root.join("etc/os-release")).unwrap();

        let description = os_release_description("Ubuntu 24.04 2026.10.18", "2026-10-18 09:30");
        assert_eq!(description, "Ubuntu 24.04 2026.10.18 (Cubic 2026-10-18 09:30)");

        let edits = os_release_edits(root, &description);
        assert_eq!(edits.len(), 1);
        let args = edits[0].command().get_args().to_vec();
        assert_eq!(args[1], "replace-text");
        assert_eq!(args[2], "^PRETTY_NAME=.*$");
        assert_eq!(args[3], "PRETTY_NAME=\"Ubuntu 24.04 2026.10.18 (Cubic 2026-10-18 09:30)\"");
        assert_eq!(PathBuf::from(&args[4]), root.join("usr/lib/os-release"));
    }

    fn release_config(update: bool) -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.options.update_os_release = update;
        config.custom.iso_volume_id = "Ubuntu 24.04 2026.10.18".to_string();
        config.project.modify_date = "2026-10-18 09:30".to_string();
        config
    }

    fn release_root(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("custom-root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(
            root.join("etc/lsb-release"),
            "DISTRIB_ID=Ubuntu\nDISTRIB_DESCRIPTION=\"Ubuntu 24.04 LTS\"\n",
        )
        .unwrap();
        fs::write(root.join("usr/lib/os-release"), "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n").unwrap();
        std::os::unix::fs::symlink("../usr/lib/os-release", root.join("etc/os-release")).unwrap();
        root
    }

    #[test]
    fn leaving_updates_release_files() {
        let temp = TempDir::new().unwrap();
        let root = release_root(&temp);
        let mut env = environment(&temp);
        env.configure_os_release(&release_config(true));

        env.enter_with(&Cmd::shell("echo ready; read line")).unwrap();
        assert!(read_until(&mut env, "ready").contains("ready"));
        env.exit_virtual_environment().unwrap();

        assert_eq!(
            fs::read_to_string(root.join("etc/lsb-release")).unwrap(),
            "DISTRIB_ID=Ubuntu\nDISTRIB_DESCRIPTION=\"Ubuntu 24.04 2026.10.18 (Cubic 2026-10-18 09:30)\"\n"
        );
        assert_eq!(
            fs::read_to_string(root.join("usr/lib/os-release")).unwrap(),
            "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 24.04 2026.10.18 (Cubic 2026-10-18 09:30)\"\n"
        );
        assert!(fs::symlink_metadata(root.join("etc/os-release"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn release_files_untouched_unless_enabled() {
        let temp = TempDir::new().unwrap();
        let root = release_root(&temp);
        let before = fs::read_to_string(root.join("usr/lib/os-release")).unwrap();

        let mut env = environment(&temp);
        env.configure_os_release(&release_config(false));
        env.enter_with(&Cmd::shell("echo ready; read line")).unwrap();
        env.exit_virtual_environment().unwrap();
        assert_eq!(fs::read_to_string(root.join("usr/lib/os-release")).unwrap(), before);

        // Exiting without having entered changes nothing either.
        env.configure_os_release(&release_config(true));
        env.exit_virtual_environment().unwrap();
        assert_eq!(fs::read_to_string(root.join("usr/lib/os-release")).unwrap(), before);
    }
}
