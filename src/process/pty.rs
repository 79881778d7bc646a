//! Children attached to a pseudo-TTY.
//!
//! Tools like `unsquashfs`, `mksquashfs` and `rsync` only print their
//! progress bars when stdout is a terminal, so every child is given the slave
//! side of a fresh pty as stdin/stdout/stderr and becomes the leader of its
//! own session. The parent reads the master side with `poll(2)` so reads can
//! observe a timeout and a cancellation token.

use super::runner::CancelToken;
use super::Cmd;
use crate::error::{ProcessError, ProcessResult};
use regex::bytes::Regex;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Silence allowed on a child's output before a read gives up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_SIZE: usize = 4096;
const TRANSCRIPT_LIMIT: usize = 8 * 1024;
/// Unmatched output `expect` keeps while waiting for a match.
const EXPECT_WINDOW: usize = 16 * 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Outcome of [`AsyncProcess::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Capture groups of the match; index 0 is the whole match.
    Match(Vec<Option<String>>),
    /// The child closed its side of the terminal.
    Eof,
}

impl Expect {
    pub fn group(&self, index: usize) -> Option<&str> {
        match self {
            Expect::Match(groups) => groups.get(index).and_then(|g| g.as_deref()),
            Expect::Eof => None,
        }
    }
}

/// Outcome of [`AsyncProcess::read_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    Idle,
    Eof,
}

enum Fill {
    Data,
    Idle,
    Eof,
}

/// A running child on a pseudo-TTY.
///
/// The caller owns draining the output and must [`close`](Self::close) the
/// process to obtain its exit status.
pub struct AsyncProcess {
    child: Child,
    master: Option<File>,
    display: String,
    buffer: Vec<u8>,
    transcript: Vec<u8>,
    timeout: Duration,
    cancel: Option<CancelToken>,
    eof: bool,
    closed: bool,
    exit_status: Option<i32>,
    signal_status: Option<i32>,
    finished: Arc<AtomicBool>,
}

impl AsyncProcess {
    /// Spawn `cmd` on a new pseudo-TTY.
    pub(crate) fn spawn(cmd: &Cmd, timeout: Duration) -> ProcessResult<Self> {
        let (master, slave) = open_pty()?;

        let mut command = cmd.to_command();
        command
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: cmd.program().to_string(),
            source,
        })?;
        // Dropping the builder closes the parent's copies of the slave, so
        // the master reports EOF once the child's session exits.
        drop(command);

        log::debug!("Spawned pid {}: {}", child.id(), cmd);

        Ok(Self {
            child,
            master: Some(File::from(master)),
            display: cmd.to_string(),
            buffer: Vec::new(),
            transcript: Vec::new(),
            timeout,
            cancel: None,
            eof: false,
            closed: false,
            exit_status: None,
            signal_status: None,
            finished: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Observe `token` at every read boundary.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Exit code once closed; `None` while running or when killed by a signal.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Terminating signal once closed, if any.
    pub fn signal_status(&self) -> Option<i32> {
        self.signal_status
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    /// The most recent output, for error reports.
    pub fn transcript(&self) -> String {
        String::from_utf8_lossy(&self.transcript).into_owned()
    }

    pub(crate) fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }

    /// Read until `pattern` matches the pending output, consuming everything
    /// up to the end of the match.
    pub fn expect(&mut self, pattern: &Regex) -> ProcessResult<Expect> {
        let mut last_output = Instant::now();
        loop {
            if let Some(caps) = pattern.captures(&self.buffer) {
                let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
                if end > 0 {
                    let groups = caps
                        .iter()
                        .map(|g| g.map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned()))
                        .collect();
                    self.buffer.drain(..end);
                    return Ok(Expect::Match(groups));
                }
            }
            if self.eof {
                return Ok(Expect::Eof);
            }
            self.trim_unmatched();
            self.check_cancelled()?;
            match self.fill(POLL_INTERVAL)? {
                Fill::Data => last_output = Instant::now(),
                Fill::Idle => self.check_timeout(last_output)?,
                Fill::Eof => {}
            }
        }
    }

    /// Keep at most [`EXPECT_WINDOW`] bytes of output that did not match,
    /// cut after a line break when there is one, so the pattern is never
    /// run over more than the window.
    fn trim_unmatched(&mut self) {
        if self.buffer.len() <= EXPECT_WINDOW {
            return;
        }
        let excess = self.buffer.len() - EXPECT_WINDOW;
        let cut = self.buffer[excess..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
            .map(|offset| excess + offset + 1)
            .unwrap_or(excess);
        self.buffer.drain(..cut);
    }

    /// Drain the child's output to EOF.
    pub fn read(&mut self) -> ProcessResult<String> {
        let mut last_output = Instant::now();
        while !self.eof {
            self.check_cancelled()?;
            match self.fill(POLL_INTERVAL)? {
                Fill::Data => last_output = Instant::now(),
                Fill::Idle => self.check_timeout(last_output)?,
                Fill::Eof => {}
            }
        }
        let output = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Ok(output)
    }

    /// Return whatever output is pending, waiting up to `wait` for more.
    pub fn read_chunk(&mut self, wait: Duration) -> ProcessResult<Chunk> {
        if !self.buffer.is_empty() {
            return Ok(Chunk::Data(std::mem::take(&mut self.buffer)));
        }
        match self.fill(wait)? {
            Fill::Data => Ok(Chunk::Data(std::mem::take(&mut self.buffer))),
            Fill::Idle => Ok(Chunk::Idle),
            Fill::Eof => Ok(Chunk::Eof),
        }
    }

    /// Send bytes to the child's terminal.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let master = self
            .master
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "process closed"))?;
        master.write_all(data)?;
        master.flush()
    }

    /// Close the terminal and reap the child.
    ///
    /// A child still running after the terminal closes gets a grace period,
    /// then its process group is killed.
    pub fn close(&mut self) -> ProcessResult<()> {
        if self.closed {
            return Ok(());
        }
        self.master = None;

        let deadline = Instant::now() + CLOSE_GRACE;
        let status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Ok(None) => {
                    log::warn!("Killing pid {} after close: {}", self.pid(), self.display);
                    signal_group(self.pid(), libc::SIGKILL);
                    break Some(self.child.wait()?);
                }
                Err(e) if e.raw_os_error() == Some(libc::ECHILD) => break None,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(status) = status {
            self.record(status);
        }
        self.closed = true;
        self.finished.store(true, Ordering::SeqCst);
        log::debug!(
            "Closed pid {} (exit={:?}, signal={:?})",
            self.pid(),
            self.exit_status,
            self.signal_status
        );
        Ok(())
    }

    /// False once the child has exited or was reaped elsewhere.
    pub fn is_alive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record(status);
                self.finished.store(true, Ordering::SeqCst);
                false
            }
            Ok(None) => true,
            Err(_) => {
                self.finished.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Turn a closed, failed run into a [`ProcessError::Failed`].
    pub fn failure(&self) -> Option<ProcessError> {
        let success = self.exit_status == Some(0) && self.signal_status.is_none();
        if success {
            return None;
        }
        Some(ProcessError::Failed {
            command: self.display.clone(),
            exit_status: self.exit_status,
            signal_status: self.signal_status,
            output: self.transcript().trim().to_string(),
        })
    }

    fn record(&mut self, status: ExitStatus) {
        self.exit_status = status.code();
        self.signal_status = status.signal();
    }

    fn check_cancelled(&self) -> ProcessResult<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(ProcessError::Cancelled),
            _ => Ok(()),
        }
    }

    fn check_timeout(&self, last_output: Instant) -> ProcessResult<()> {
        if last_output.elapsed() >= self.timeout {
            return Err(ProcessError::Timeout {
                command: self.display.clone(),
                timeout_secs: self.timeout.as_secs(),
            });
        }
        Ok(())
    }

    fn fill(&mut self, wait: Duration) -> ProcessResult<Fill> {
        if self.eof {
            return Ok(Fill::Eof);
        }
        let Some(master) = self.master.as_mut() else {
            self.eof = true;
            return Ok(Fill::Eof);
        };

        let mut pfd = libc::pollfd {
            fd: master.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Fill::Idle);
            }
            return Err(err.into());
        }
        if ready == 0 {
            return Ok(Fill::Idle);
        }

        let mut buf = [0u8; READ_SIZE];
        match master.read(&mut buf) {
            Ok(0) => {
                self.eof = true;
                Ok(Fill::Eof)
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&buf[..n]);
                self.transcript.extend_from_slice(&buf[..n]);
                if self.transcript.len() > TRANSCRIPT_LIMIT {
                    let excess = self.transcript.len() - TRANSCRIPT_LIMIT;
                    self.transcript.drain(..excess);
                }
                Ok(Fill::Data)
            }
            // Linux reports EIO on the master once every slave fd is closed.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                self.eof = true;
                Ok(Fill::Eof)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Fill::Idle),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for AsyncProcess {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::warn!("Failed to close '{}': {}", self.display, e);
            }
        }
    }
}

/// Send `signal` to the process group led by `pid`, falling back to the pid.
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let size = libc::winsize {
        ws_row: 24,
        ws_col: 120,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: out-pointers are valid; name and termios are optional.
    let ret = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut::<libc::c_char>(),
            std::ptr::null_mut::<libc::termios>(),
            &size as *const libc::winsize as *mut libc::winsize,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: openpty succeeded, so both descriptors are open and owned here.
    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };
    set_cloexec(&master)?;
    set_cloexec(&slave)?;
    Ok((master, slave))
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fd is a valid open descriptor.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
