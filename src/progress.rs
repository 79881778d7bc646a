//! Smooth progress for commands that report percentages irregularly.
//!
//! A producer thread runs the command on a pseudo-TTY and feeds every
//! reported percentage into a shared [`ProgressState`]. The caller's thread
//! is the consumer: it walks `tracker_position` one unit at a time toward
//! `tracker_target`, sleeping an adaptive `delay` between steps, so the bar
//! neither jumps nor stalls between sparse updates.
//!
//! ```text
//!  producer: expect("NN%") ──update()──► ProgressState ◄──step()── consumer
//!                                          (Mutex + Condvar)        on_progress(f)
//! ```

use crate::error::{ProcessError, ProcessResult};
use crate::process::{CancelToken, Cmd, Expect, ProcessRunner};
use regex::bytes::Regex;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Fixed-point resolution: 0.1 %.
pub const SCALE_FACTOR: u32 = 10;
pub const FINAL_POSITION: u32 = 100 * SCALE_FACTOR;

/// Expected duration of a typical tracked command.
pub const TYPICAL_DURATION: Duration = Duration::from_secs(250);
/// Shortest total duration the bar may animate over.
pub const MINIMUM_DURATION: Duration = Duration::from_millis(125);

/// Target shown while waiting for the first real update.
pub const INITIAL_TARGET: u32 = 10 * SCALE_FACTOR;

const PERCENT_PATTERN: &str = r"([0-9]{1,3}(\.[0-9]{2})?)%";

fn percent_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(PERCENT_PATTERN).expect("static percent pattern"))
}

/// Parse a reported percentage ("45", "45.67") into fixed-point units.
pub fn parse_percent(text: &str) -> Option<u32> {
    let value: f64 = text.trim().trim_end_matches('%').parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(((value * SCALE_FACTOR as f64).floor() as u32).min(FINAL_POSITION))
}

/// Per-step delays derived from the calibration durations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Seconds per unit for a typical command.
    pub typical_delay: f64,
    /// Lower bound on seconds per unit.
    pub minimum_delay: f64,
}

impl Calibration {
    /// `quantity` commands run back to back in one phase share the time budget.
    pub fn new(typical: Duration, minimum: Duration, quantity: usize) -> Self {
        let divisor = FINAL_POSITION as f64 * (1 + quantity.saturating_sub(1) / 10) as f64;
        Self {
            typical_delay: typical.as_secs_f64() / divisor,
            minimum_delay: minimum.as_secs_f64() / divisor,
        }
    }

    pub fn for_quantity(quantity: usize) -> Self {
        Self::new(TYPICAL_DURATION, MINIMUM_DURATION, quantity)
    }
}

/// Shared state between producer and consumer. All positions are fixed-point
/// units on `[0, FINAL_POSITION]`; times are seconds since the run started.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub process_position: u32,
    pub tracker_position: u32,
    pub tracker_target: u32,
    /// Seconds per tracker step.
    pub delay: f64,
    pub prior_process_time: f64,
    pub prior_process_position: u32,
    pub prior_process_period: Option<f64>,
    calibration: Calibration,
    finished: bool,
    aborted: bool,
}

impl ProgressState {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            process_position: 0,
            tracker_position: 0,
            tracker_target: INITIAL_TARGET,
            delay: calibration.typical_delay,
            prior_process_time: 0.0,
            prior_process_position: 0,
            prior_process_period: None,
            calibration,
            finished: false,
            aborted: false,
        }
    }

    /// Record a reported position at `now` seconds. Reports that do not
    /// advance past the prior one are ignored, so fluctuating inputs never
    /// pull the target back.
    pub fn update(&mut self, reported: u32, now: f64) {
        let reported = reported.min(FINAL_POSITION);
        if reported <= self.prior_process_position {
            return;
        }

        let units = (reported - self.prior_process_position) as f64;
        let new_period = (now - self.prior_process_time).max(0.0) / units;
        let period = match self.prior_process_period {
            Some(prior) => 0.25 * prior + 0.75 * new_period,
            None => new_period,
        };

        let projected = period * (FINAL_POSITION - reported) as f64;
        let remaining = FINAL_POSITION.saturating_sub(self.tracker_position).max(1) as f64;
        let mut tracker_period = projected / remaining;
        if reported >= FINAL_POSITION {
            tracker_period = tracker_period.min(self.calibration.typical_delay);
        }
        self.delay = tracker_period.max(self.calibration.minimum_delay);

        self.process_position = reported;
        self.prior_process_time = now;
        self.prior_process_position = reported;
        self.prior_process_period = Some(period);
        self.tracker_target = self.tracker_target.max(reported);
    }

    /// The producer saw a clean exit: everything is done.
    pub fn finish(&mut self, now: f64) {
        self.update(FINAL_POSITION, now);
        self.tracker_target = FINAL_POSITION;
        self.delay = self.delay.min(self.calibration.typical_delay);
        self.finished = true;
    }

    /// Advance one unit if the target allows it.
    pub fn step(&mut self) -> Option<u32> {
        if self.tracker_position < self.tracker_target {
            self.tracker_position += 1;
            Some(self.tracker_position)
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.tracker_position >= FINAL_POSITION
    }

    pub fn fraction(&self) -> f64 {
        self.tracker_position as f64 / FINAL_POSITION as f64
    }
}

struct Shared {
    state: Mutex<ProgressState>,
    event: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Runs a command and reports smoothed progress through a callback.
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    calibration: Calibration,
}

impl ProgressTracker {
    /// Tracker for a phase running `quantity` commands back to back.
    pub fn new(quantity: usize) -> Self {
        Self {
            calibration: Calibration::for_quantity(quantity),
        }
    }

    /// Tracker with custom calibration durations.
    pub fn with_durations(typical: Duration, minimum: Duration, quantity: usize) -> Self {
        Self {
            calibration: Calibration::new(typical, minimum, quantity),
        }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Run `cmd` as the runner's current process and block until it exits,
    /// calling `on_progress` with non-decreasing fractions ending at `1.0`.
    ///
    /// Cancel by calling [`CancelToken::cancel`] and
    /// [`ProcessRunner::terminate_process`] from another thread; this then
    /// returns [`ProcessError::Cancelled`].
    pub fn track<F>(
        &self,
        runner: &ProcessRunner,
        cmd: &Cmd,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> ProcessResult<()>
    where
        F: FnMut(f64),
    {
        let shared = Shared {
            state: Mutex::new(ProgressState::new(self.calibration)),
            event: Condvar::new(),
        };
        let started = Instant::now();
        log::info!("Tracking progress of: {}", cmd);

        std::thread::scope(|scope| {
            let producer = scope.spawn(|| {
                let result = produce(runner, cmd, cancel, &shared, started);
                let mut state = shared.lock();
                match &result {
                    Ok(()) => state.finish(started.elapsed().as_secs_f64()),
                    Err(_) => state.aborted = true,
                }
                drop(state);
                shared.event.notify_all();
                result
            });

            let consumed = consume(&shared, cancel, &mut on_progress);
            let produced = producer
                .join()
                .unwrap_or_else(|_| Err(ProcessError::Io(std::io::Error::other("progress producer panicked"))));

            produced?;
            consumed
        })
    }
}

fn produce(
    runner: &ProcessRunner,
    cmd: &Cmd,
    cancel: &CancelToken,
    shared: &Shared,
    started: Instant,
) -> ProcessResult<()> {
    let mut process = runner.run_async(cmd)?.with_cancel(cancel.clone());

    let outcome = loop {
        match process.expect(percent_regex()) {
            Ok(Expect::Match(groups)) => {
                let reported = groups
                    .get(1)
                    .and_then(|g| g.as_deref())
                    .and_then(parse_percent);
                if let Some(reported) = reported {
                    shared.lock().update(reported, started.elapsed().as_secs_f64());
                    shared.event.notify_all();
                }
            }
            Ok(Expect::Eof) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Err(ProcessError::Cancelled) = outcome {
        runner.terminate_process()?;
    }
    let closed = process.close();
    runner.release_process(&process);
    outcome?;
    closed?;

    if let Some(failure) = process.failure() {
        log::warn!("{}", failure);
        return Err(failure);
    }
    Ok(())
}

fn consume<F>(shared: &Shared, cancel: &CancelToken, on_progress: &mut F) -> ProcessResult<()>
where
    F: FnMut(f64),
{
    let mut state = shared.lock();
    loop {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        if state.aborted {
            // The producer's error is reported by the caller.
            return Ok(());
        }
        if let Some(position) = state.step() {
            let delay = Duration::from_secs_f64(state.delay.max(0.0));
            drop(state);
            on_progress(position as f64 / FINAL_POSITION as f64);
            state = shared.lock();
            let deadline = Instant::now() + delay;
            // Sleep for `delay`, waking early only to honour cancellation.
            while !cancel.is_cancelled() && !state.aborted {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = shared
                    .event
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|p| p.into_inner())
                    .0;
            }
            continue;
        }
        if state.is_complete() {
            return Ok(());
        }
        state = shared
            .event
            .wait_timeout(state, Duration::from_millis(100))
            .unwrap_or_else(|p| p.into_inner())
            .0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast() -> ProgressTracker {
        ProgressTracker::with_durations(Duration::from_secs(2), Duration::from_millis(50), 1)
    }

    #[test]
    fn parse_percent_scales_and_clamps() {
        assert_eq!(parse_percent("45"), Some(450));
        assert_eq!(parse_percent("45.67%"), Some(456));
        assert_eq!(parse_percent("100"), Some(1000));
        assert_eq!(parse_percent("250"), Some(1000));
        assert_eq!(parse_percent("abc"), None);
    }

    #[test]
    fn calibration_scales_with_quantity() {
        let one = Calibration::for_quantity(1);
        assert!((one.typical_delay - 0.25).abs() < 1e-9);
        assert!((one.minimum_delay - 0.000125).abs() < 1e-12);

        let ten = Calibration::for_quantity(10);
        assert_eq!(ten, one);

        let eleven = Calibration::for_quantity(11);
        assert!((eleven.typical_delay - 0.125).abs() < 1e-9);
    }

    #[test]
    fn initial_state_shows_warm_up_target() {
        let state = ProgressState::new(Calibration::for_quantity(1));
        assert_eq!(state.tracker_target, INITIAL_TARGET);
        assert_eq!(state.tracker_position, 0);
        assert!((state.delay - 0.25).abs() < 1e-9);
    }

    #[test]
    fn update_computes_adaptive_delay() {
        let mut state = ProgressState::new(Calibration::for_quantity(1));

        // 50 units in 10 s: 0.2 s per unit, 950 units left => 190 s projected.
        state.update(50, 10.0);
        assert_eq!(state.prior_process_period, Some(0.2));
        assert!((state.delay - 190.0 / 1000.0).abs() < 1e-9);
        assert_eq!(state.tracker_target, INITIAL_TARGET);

        // 350 more units in 7 s: 0.02 s/unit, smoothed 0.25*0.2 + 0.75*0.02 = 0.065.
        state.tracker_position = 100;
        state.update(400, 17.0);
        let period = state.prior_process_period.unwrap();
        assert!((period - 0.065).abs() < 1e-9);
        assert!((state.delay - 0.065 * 600.0 / 900.0).abs() < 1e-9);
        assert_eq!(state.tracker_target, 400);
    }

    #[test]
    fn update_ignores_regressions() {
        let mut state = ProgressState::new(Calibration::for_quantity(1));
        state.update(500, 5.0);
        let before = state.clone();
        state.update(300, 6.0);
        state.update(500, 7.0);
        assert_eq!(state, before);
    }

    #[test]
    fn final_update_clamps_delay() {
        let calibration = Calibration::for_quantity(1);
        let mut state = ProgressState::new(calibration);
        state.finish(3.0);
        assert_eq!(state.tracker_target, FINAL_POSITION);
        assert!(state.delay <= calibration.typical_delay);
        assert!(state.delay >= calibration.minimum_delay);
    }

    #[test]
    fn step_never_overtakes_target() {
        let mut state = ProgressState::new(Calibration::for_quantity(1));
        let mut last = 0;
        while let Some(position) = state.step() {
            assert!(position > last);
            last = position;
        }
        assert_eq!(last, INITIAL_TARGET);
        assert_eq!(state.step(), None);
    }

    #[test]
    fn tracked_run_is_monotone_and_completes() {
        let runner = ProcessRunner::new();
        let cancel = CancelToken::new();
        let cmd = Cmd::shell("echo 5%; sleep 0.2; echo 5%; sleep 0.2; echo 40%; sleep 0.2; echo 100%");

        let mut values = Vec::new();
        fast()
            .track(&runner, &cmd, &cancel, |f| values.push(f))
            .unwrap();

        assert!(!values.is_empty());
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(values.last().copied(), Some(1.0));
        assert_eq!(runner.current_pid(), None);
    }

    #[test]
    fn delay_bounds_near_final_position() {
        let calibration = Calibration::for_quantity(1);
        let mut state = ProgressState::new(calibration);
        state.tracker_position = 998;

        // One unit in 100 s with one unit left: far slower than typical.
        state.update(998, 0.0);
        state.update(999, 100.0);
        assert!(state.delay > calibration.typical_delay);

        // Reaching the end clamps to the typical delay.
        state.update(FINAL_POSITION, 400.0);
        assert!(state.delay <= calibration.typical_delay);
        assert!(state.delay >= calibration.minimum_delay);

        // A burst never drives the delay below the minimum, even with the
        // tracker already at the end.
        let mut state = ProgressState::new(calibration);
        state.tracker_position = FINAL_POSITION;
        state.update(FINAL_POSITION, 0.0);
        assert_eq!(state.delay, calibration.minimum_delay);
    }

    /// Seconds the consumer needs when `updates` (time, position) arrive
    /// and the command exits at `exit_at`, replaying the tracker in virtual
    /// time.
    fn replayed_duration(calibration: Calibration, updates: &[(f64, u32)], exit_at: f64) -> f64 {
        let mut state = ProgressState::new(calibration);
        let mut pending = updates.iter().peekable();
        let mut clock = 0.0;
        loop {
            while let Some(&&(at, reported)) = pending.peek() {
                if at > clock {
                    break;
                }
                state.update(reported, at);
                pending.next();
            }
            if clock >= exit_at && !state.finished {
                state.finish(exit_at);
            }
            if state.step().is_some() {
                clock += state.delay;
                continue;
            }
            if state.is_complete() {
                return clock;
            }
            let next = pending.peek().map(|(at, _)| *at).unwrap_or(exit_at);
            clock = f64::max(clock, next);
        }
    }

    #[test]
    fn tracked_run_takes_the_projected_time() {
        let runner = ProcessRunner::new();
        let cancel = CancelToken::new();
        let cmd = Cmd::shell("echo 5%; sleep 1; echo 5%; sleep 1; echo 40%; sleep 1; echo 100%");
        let tracker = ProgressTracker::new(1);

        let expected = replayed_duration(
            tracker.calibration(),
            &[(0.0, 50), (1.0, 50), (2.0, 400), (3.0, FINAL_POSITION)],
            3.0,
        );
        assert!(expected > 3.0 && expected < 3.2, "replayed {}", expected);

        let mut values = Vec::new();
        let started = Instant::now();
        tracker.track(&runner, &cmd, &cancel, |f| values.push(f)).unwrap();
        let elapsed = started.elapsed().as_secs_f64();

        assert!(
            (elapsed - expected).abs() <= 0.2 * expected,
            "took {:.3} s, expected {:.3} s",
            elapsed,
            expected
        );
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.last().copied(), Some(1.0));
        assert_eq!(values.len(), FINAL_POSITION as usize);
    }

    #[test]
    fn failed_command_raises_on_caller() {
        let runner = ProcessRunner::new();
        let cancel = CancelToken::new();
        let cmd = Cmd::shell("echo 20%; echo 'write error: No space left on device'; exit 1");

        let err = fast().track(&runner, &cmd, &cancel, |_| {}).unwrap_err();
        match &err {
            ProcessError::Failed { exit_status, .. } => assert_eq!(*exit_status, Some(1)),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(err.is_disk_full());
    }

    #[test]
    fn cancellation_stops_child_and_clears_slot() {
        let runner = Arc::new(ProcessRunner::new());
        let cancel = CancelToken::new();
        let cmd = Cmd::shell("echo 45%; sleep 30; echo 100%");

        let canceller = {
            let runner = Arc::clone(&runner);
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(500));
                cancel.cancel();
                runner.terminate_process().unwrap();
            })
        };

        let started = Instant::now();
        let result = fast().track(&runner, &cmd, &cancel, |_| {});
        canceller.join().unwrap();

        assert!(matches!(result, Err(ProcessError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(runner.current_pid(), None);
    }
}
