//! Booting the generated ISO in QEMU for a quick smoke test.

mod host;

pub use host::{has_virtualization, parse_meminfo, parse_qemu_version, HostCapabilities};

use crate::process::Cmd;
use anyhow::{Context, Result};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

const MIB: u64 = 1024 * 1024;
/// Left to the host when sizing the VM.
pub const MIN_RESERVE_MEMORY: u64 = 512 * MIB;
/// Below this much available memory testing is disabled.
pub const MIN_AVAILABLE_MEMORY: u64 = 1536 * MIB;
const MEMORY_STEP: u64 = 256 * MIB;

/// Memory for the VM in bytes: what is available minus the host reserve,
/// rounded down to 256 MiB.
pub fn emulator_memory(available: u64) -> u64 {
    (available.saturating_sub(MIN_RESERVE_MEMORY) / MEMORY_STEP) * MEMORY_STEP
}

/// Testing needs QEMU, the ISO, and enough free memory.
pub fn is_test_enabled(capabilities: &HostCapabilities, iso: &Path) -> bool {
    capabilities.has_qemu() && iso.is_file() && capabilities.available_memory > MIN_AVAILABLE_MEMORY
}

/// Builder for the QEMU command line.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    iso: PathBuf,
    memory_mib: u64,
    kvm: bool,
    gtk_display: bool,
}

impl QemuBuilder {
    pub fn new(iso: &Path, memory_mib: u64) -> Self {
        Self {
            iso: iso.to_path_buf(),
            memory_mib,
            kvm: false,
            gtk_display: false,
        }
    }

    /// Size and accelerate the VM for this host.
    pub fn for_host(iso: &Path, capabilities: &HostCapabilities) -> Self {
        Self::new(iso, emulator_memory(capabilities.available_memory) / MIB)
            .kvm(capabilities.virtualization)
            .gtk_display(capabilities.gtk_display)
    }

    pub fn kvm(mut self, enabled: bool) -> Self {
        self.kvm = enabled;
        self
    }

    pub fn gtk_display(mut self, enabled: bool) -> Self {
        self.gtk_display = enabled;
        self
    }

    pub fn build(&self) -> Cmd {
        let mut cmd = Cmd::new(QEMU_BINARY).args(["--name", "Cubic", "-M", "pc"]);

        if self.kvm {
            cmd = cmd.args(["-enable-kvm", "-cpu", "host"]);
        }
        if self.gtk_display {
            cmd = cmd.args(["-display", "gtk,zoom-to-fit=on"]);
        }

        // QEMU option values use ',' as a separator; a literal comma is doubled.
        let file = self.iso.to_string_lossy().replace(',', ",,");
        cmd.arg("-m")
            .arg(format!("{}M", self.memory_mib))
            .args(["-device", "intel-hda", "-device", "hda-duplex"])
            .arg("-drive")
            .arg(format!("format=raw,file={}", file))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorStatus {
    Running,
    Exited,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorEvent {
    pub status: EmulatorStatus,
    pub exit_code: i32,
    pub signal: i32,
}

/// Interpret a raw `waitpid` status.
pub fn decode_wait_status(status: i32) -> EmulatorEvent {
    let signal = status & 0x7f;
    let exit_code = (status >> 8) & 0xff;
    EmulatorEvent {
        status: if exit_code != 0 {
            EmulatorStatus::Error
        } else {
            EmulatorStatus::Exited
        },
        exit_code,
        signal,
    }
}

type StatusCallback = Box<dyn FnMut(EmulatorEvent) + Send>;

/// A launched VM and the thread watching for its exit.
#[derive(Default)]
pub struct Emulator {
    callback: Arc<Mutex<Option<StatusCallback>>>,
    watcher: Option<JoinHandle<()>>,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status_callback<F>(&mut self, callback: F)
    where
        F: FnMut(EmulatorEvent) + Send + 'static,
    {
        *self.lock_callback() = Some(Box::new(callback));
    }

    /// Stop notifications. The exit is still reaped.
    pub fn remove_status_callback(&mut self) {
        *self.lock_callback() = None;
    }

    /// Start `cmd` and watch it. Returns the child's pid.
    pub fn launch(&mut self, cmd: &Cmd) -> Result<u32> {
        let mut child = cmd
            .to_command()
            .spawn()
            .with_context(|| format!("Failed to start '{}'", cmd))?;
        let pid = child.id();
        log::info!("Started emulator (pid {}): {}", pid, cmd);
        notify(
            &self.callback,
            EmulatorEvent {
                status: EmulatorStatus::Running,
                exit_code: 0,
                signal: 0,
            },
        );

        let callback = Arc::clone(&self.callback);
        self.watcher = Some(std::thread::spawn(move || {
            let event = match child.wait() {
                Ok(status) => decode_wait_status(status.into_raw()),
                Err(e) => {
                    log::warn!("Lost track of emulator pid {}: {}", pid, e);
                    EmulatorEvent {
                        status: EmulatorStatus::Error,
                        exit_code: -1,
                        signal: 0,
                    }
                }
            };
            log::info!(
                "Emulator exited (code={}, signal={})",
                event.exit_code,
                event.signal
            );
            notify(&callback, event);
        }));
        Ok(pid)
    }

    /// Block until the watched child has exited.
    pub fn wait(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }

    fn lock_callback(&self) -> std::sync::MutexGuard<'_, Option<StatusCallback>> {
        self.callback.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn notify(callback: &Mutex<Option<StatusCallback>>, event: EmulatorEvent) {
    let mut guard = callback.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(callback) = guard.as_mut() {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn host(available_mib: u64) -> HostCapabilities {
        HostCapabilities {
            virtualization: true,
            gtk_display: true,
            total_memory: 8192 * MIB,
            available_memory: available_mib * MIB,
            qemu_version: "8.2.2".to_string(),
        }
    }

    #[test]
    fn memory_budget_rounds_down() {
        assert_eq!(emulator_memory(2048 * MIB), 1536 * MIB);
        assert_eq!(emulator_memory(2047 * MIB), 1280 * MIB);
        assert_eq!(emulator_memory(600 * MIB), 0);
        assert_eq!(emulator_memory(0), 0);
    }

    #[test]
    fn command_for_kvm_gtk_host() {
        let cmd = QemuBuilder::for_host(Path::new("/work/custom.iso"), &host(2048)).build();
        let line = cmd.to_string();
        assert!(line.starts_with("qemu-system-x86_64 --name Cubic -M pc "));
        assert!(line.contains("-enable-kvm -cpu host -display gtk,zoom-to-fit=on -m 1536M"));
        assert!(line.ends_with("-device intel-hda -device hda-duplex -drive format=raw,file=/work/custom.iso"));
    }

    #[test]
    fn command_without_optional_features() {
        let cmd = QemuBuilder::new(Path::new("/w/a,b.iso"), 1024).build();
        let line = cmd.to_string();
        assert!(!line.contains("-enable-kvm"));
        assert!(!line.contains("-display"));
        assert!(line.contains("-M pc -m 1024M"));
        assert!(line.ends_with("file=/w/a,,b.iso"));
    }

    #[test]
    fn gate_requires_all_conditions() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path().join("custom.iso");
        assert!(!is_test_enabled(&host(4096), &iso));

        fs::write(&iso, b"iso").unwrap();
        assert!(is_test_enabled(&host(4096), &iso));
        assert!(!is_test_enabled(&host(1536), &iso));
        assert!(is_test_enabled(&host(1537), &iso));

        let mut no_qemu = host(4096);
        no_qemu.qemu_version = "0.0".to_string();
        assert!(!is_test_enabled(&no_qemu, &iso));
    }

    #[test]
    fn wait_status_decoding() {
        assert_eq!(decode_wait_status(0).status, EmulatorStatus::Exited);
        let failed = decode_wait_status(1 << 8);
        assert_eq!((failed.status, failed.exit_code, failed.signal), (EmulatorStatus::Error, 1, 0));
        let killed = decode_wait_status(libc::SIGKILL);
        assert_eq!((killed.status, killed.signal), (EmulatorStatus::Exited, libc::SIGKILL));
    }

    #[test]
    fn watcher_reports_exit() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&events);
        let mut emulator = Emulator::new();
        emulator.set_status_callback(move |event| recorder.lock().unwrap().push(event.status));

        emulator.launch(&Cmd::shell("exit 3")).unwrap();
        emulator.wait();
        assert_eq!(*events.lock().unwrap(), [EmulatorStatus::Running, EmulatorStatus::Error]);

        emulator.remove_status_callback();
        emulator.launch(&Cmd::new("true")).unwrap();
        emulator.wait();
        assert_eq!(events.lock().unwrap().len(), 2);
    }
}
