use super::privileged;
use super::pty::{signal_group, AsyncProcess, DEFAULT_TIMEOUT};
use super::Cmd;
use crate::error::{ProcessError, ProcessResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Shared cancellation flag, observed at every child read boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token before the next operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Combined output and exit information of a finished child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub output: String,
    pub exit_status: Option<i32>,
    pub signal_status: Option<i32>,
}

impl ProcessOutput {
    /// Zero exit and no terminating signal.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0) && self.signal_status.is_none()
    }

    /// Convert a failed run into [`ProcessError::Failed`].
    pub fn check(self, cmd: &Cmd) -> ProcessResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(ProcessError::Failed {
            command: cmd.to_string(),
            exit_status: self.exit_status,
            signal_status: self.signal_status,
            output: self.output.trim().to_string(),
        })
    }
}

#[derive(Debug)]
struct Registration {
    pid: u32,
    elevated: bool,
    display: String,
    finished: Arc<AtomicBool>,
}

impl Registration {
    fn is_alive(&self) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(self.pid as libc::pid_t, 0) == 0 }
    }
}

/// Runs children on pseudo-TTYs and owns the "current process" slot that
/// navigation cancels.
#[derive(Debug)]
pub struct ProcessRunner {
    current: Mutex<Option<Registration>>,
    timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Use `timeout` as the allowed silence on child output.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            timeout,
        }
    }

    /// Run to completion as the current process, then flush filesystem buffers.
    pub fn run_sync(&self, cmd: &Cmd) -> ProcessResult<ProcessOutput> {
        let process = self.run_async(cmd)?;
        let pid = process.pid();
        let result = drain(process);
        self.release(pid);
        // SAFETY: sync(2) takes no arguments and cannot fail.
        unsafe { libc::sync() };
        result
    }

    /// Run to completion without occupying the current-process slot.
    pub fn run_sync_unregistered(&self, cmd: &Cmd) -> ProcessResult<ProcessOutput> {
        let process = AsyncProcess::spawn(cmd, self.timeout)?;
        drain(process)
    }

    /// Start `cmd` as the current process. The caller drains and closes it.
    pub fn run_async(&self, cmd: &Cmd) -> ProcessResult<AsyncProcess> {
        let process = AsyncProcess::spawn(cmd, self.timeout)?;
        let registration = Registration {
            pid: process.pid(),
            elevated: cmd.is_elevated(),
            display: cmd.to_string(),
            finished: process.finished_flag(),
        };

        let mut slot = self.slot();
        if let Some(previous) = slot.as_ref().filter(|r| r.is_alive()) {
            log::warn!(
                "Starting '{}' while pid {} ('{}') is still running",
                registration.display,
                previous.pid,
                previous.display
            );
        }
        *slot = Some(registration);
        Ok(process)
    }

    /// Start `cmd` outside the current-process slot.
    pub fn run_async_unregistered(&self, cmd: &Cmd) -> ProcessResult<AsyncProcess> {
        AsyncProcess::spawn(cmd, self.timeout)
    }

    /// Pid of the registered process while it is alive.
    pub fn current_pid(&self) -> Option<u32> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(r) if r.is_alive() => Some(r.pid),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    /// Terminate the registered process, if any is alive.
    ///
    /// Children started through `pkexec` run as root, so the signal is sent
    /// by the elevated `stop-process` helper, itself unregistered.
    pub fn terminate_process(&self) -> ProcessResult<()> {
        let Some(registration) = self.slot().take() else {
            log::debug!("No current process to terminate");
            return Ok(());
        };
        if !registration.is_alive() {
            log::debug!("Process {} already finished", registration.pid);
            return Ok(());
        }

        log::info!(
            "Terminating pid {}: {}",
            registration.pid,
            registration.display
        );
        if registration.elevated {
            let cmd = privileged::stop_process(registration.pid);
            let output = self.run_sync_unregistered(&cmd)?;
            if !output.success() {
                log::warn!(
                    "'{}' did not stop pid {}: {}",
                    cmd,
                    registration.pid,
                    output.output.trim()
                );
            }
        } else if !signal_group(registration.pid, libc::SIGTERM) {
            log::debug!("Pid {} exited before SIGTERM", registration.pid);
        }
        Ok(())
    }

    fn release(&self, pid: u32) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|r| r.pid == pid) {
            *slot = None;
        }
    }

    pub(crate) fn release_process(&self, process: &AsyncProcess) {
        self.release(process.pid());
    }

    fn slot(&self) -> MutexGuard<'_, Option<Registration>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// False for `None`, for finished children, and for children reaped elsewhere.
pub fn is_alive(process: Option<&mut AsyncProcess>) -> bool {
    process.is_some_and(|p| p.is_alive())
}

fn drain(mut process: AsyncProcess) -> ProcessResult<ProcessOutput> {
    let read = process.read();
    process.close()?;
    let output = read?;
    Ok(ProcessOutput {
        output,
        exit_status: process.exit_status(),
        signal_status: process.signal_status(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn run_sync_captures_status() {
        let runner = ProcessRunner::new();
        let out = runner.run_sync(&Cmd::shell("echo hello")).unwrap();
        assert!(out.success());
        assert!(out.output.contains("hello"));
        assert_eq!(runner.current_pid(), None);

        let out = runner.run_sync(&Cmd::shell("exit 2")).unwrap();
        assert_eq!(out.exit_status, Some(2));
        assert!(!out.success());
        assert!(out.check(&Cmd::shell("exit 2")).is_err());
    }

    #[test]
    fn unregistered_run_leaves_slot_alone() {
        let runner = ProcessRunner::new();
        let mut running = runner.run_async(&Cmd::shell("sleep 5")).unwrap();
        let pid = running.pid();

        let out = runner.run_sync_unregistered(&Cmd::new("true")).unwrap();
        assert!(out.success());
        assert_eq!(runner.current_pid(), Some(pid));

        runner.terminate_process().unwrap();
        running.close().unwrap();
        assert_eq!(running.signal_status(), Some(libc::SIGTERM));
        assert_eq!(runner.current_pid(), None);
    }

    #[test]
    fn terminate_without_process_is_ok() {
        let runner = ProcessRunner::new();
        runner.terminate_process().unwrap();
        runner.terminate_process().unwrap();
    }

    #[test]
    fn terminate_interrupts_read_quickly() {
        let runner = ProcessRunner::new();
        let mut process = runner.run_async(&Cmd::shell("echo started; sleep 30")).unwrap();
        let start = Instant::now();
        runner.terminate_process().unwrap();
        let _ = process.read();
        process.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!process.is_alive());
    }

    #[test]
    fn is_alive_handles_none_and_finished() {
        assert!(!is_alive(None));

        let runner = ProcessRunner::new();
        let mut process = runner.run_async(&Cmd::new("true")).unwrap();
        let _ = process.read();
        process.close().unwrap();
        assert!(!is_alive(Some(&mut process)));
    }

    #[test]
    fn cancel_token_resets() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.clone().is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }
}
