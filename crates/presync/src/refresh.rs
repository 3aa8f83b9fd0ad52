//! Refresh phase tracker: measures the display's real cadence from scanline
//! samples.
//!
//! Many display stacks expose a "current scanline" query but no dependable
//! wait-for-vblank primitive with a known phase. The tracker runs a
//! background thread that, each cycle, timestamps the raster at three
//! checkpoints spaced across roughly half the frame and fits a per-scanline
//! duration from the intervals. Two half-intervals that disagree by more
//! than 30% mean the measurement straddled something odd (a wrap, a
//! scheduler stall) and the cycle is discarded; the previous smoothed
//! estimate stays authoritative.
//!
//! Accepted measurements land in a bounded window; the smoothed refresh
//! period is the window mean, adopted through the critically-damped
//! [`Moderator`] whenever it moves by more than 1% so a bad run of samples
//! cannot step the estimate discontinuously. Estimates are not trusted until
//! [`VALID_MEASUREMENTS`] cycles have accumulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::frame::{HostClock, PresentationBackend, PresentError};
use crate::moderate::Moderator;
use crate::ring::RingBuffer;

/// Measurements kept in the smoothing window.
const MEASUREMENT_WINDOW: usize = 20;
/// Accepted measurements before the estimate is trusted.
const VALID_MEASUREMENTS: u32 = 20;
/// Lower bound on the first checkpoint, past the vblank region.
const MIN_START_LINE: u32 = 5;
/// Tolerated disagreement between the two half-interval line rates.
const HALF_INTERVAL_TOLERANCE: f64 = 0.3;
/// Relative change that routes adoption through the moderator.
const SMOOTH_JUMP_THRESHOLD: f64 = 0.01;
/// Pause between measurement cycles.
const CYCLE_GAP: Duration = Duration::from_millis(5);
/// Scanline polling interval while waiting for a checkpoint.
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Snapshot of the tracker's current belief about the display.
#[derive(Debug, Clone, Copy)]
pub struct VSyncEstimate {
    /// Smoothed full refresh period (including the blanking interval).
    pub refresh_period: Duration,
    /// Smoothed duration of one scanline.
    pub line_duration: Duration,
    /// Estimated total scanlines per refresh (visible + blanking).
    pub total_lines: u32,
    /// True once enough measurements have accumulated to trust the above.
    pub valid: bool,
}

/// One accepted measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Measurement {
    period_secs: f64,
    line_secs: f64,
    total_lines: u32,
}

struct VSyncState {
    measurements: RingBuffer<(f64, f64)>,
    period: Moderator,
    line: Moderator,
    total_lines: u32,
    valid_count: u32,
    have_smoothed: bool,
}

impl VSyncState {
    fn adopt(&mut self, m: Measurement) {
        self.measurements.push((m.period_secs, m.line_secs));

        let n = self.measurements.len() as f64;
        let mean_period = self.measurements.iter().map(|(p, _)| p).sum::<f64>() / n;
        let mean_line = self.measurements.iter().map(|(_, l)| l).sum::<f64>() / n;

        if !self.have_smoothed {
            self.period.reset(mean_period);
            self.line.reset(mean_line);
            self.have_smoothed = true;
        } else {
            adopt_smoothed(&mut self.period, mean_period);
            adopt_smoothed(&mut self.line, mean_line);
        }
        self.total_lines = m.total_lines;
        self.valid_count += 1;
    }
}

/// Routes a new window mean into a moderator: direct for small moves,
/// damped when the jump exceeds 1%.
fn adopt_smoothed(moderator: &mut Moderator, mean: f64) {
    let current = moderator.value();
    if current > 0.0 && ((mean - current) / current).abs() > SMOOTH_JUMP_THRESHOLD {
        moderator.step(mean, 0.1);
    } else {
        moderator.reset(mean);
    }
}

struct Shared {
    state: Mutex<VSyncState>,
    quit: AtomicBool,
}

/// Background estimator of refresh period and vertical-blank phase.
pub struct RefreshTracker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshTracker {
    /// Spawns the measurement thread against the given backend.
    pub fn spawn<B>(backend: Arc<B>, host: Arc<dyn HostClock>) -> Self
    where
        B: PresentationBackend + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(VSyncState {
                measurements: RingBuffer::new(MEASUREMENT_WINDOW),
                period: Moderator::new(0.0),
                line: Moderator::new(0.0),
                total_lines: 0,
                valid_count: 0,
                have_smoothed: false,
            }),
            quit: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("presync-refresh".into())
            .spawn(move || measurement_loop(backend, host, worker_shared))
            .expect("failed to spawn refresh tracker thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Current smoothed estimate.
    pub fn estimate(&self) -> VSyncEstimate {
        let state = self.shared.state.lock();
        VSyncEstimate {
            refresh_period: Duration::from_secs_f64(state.period.value().max(0.0)),
            line_duration: Duration::from_secs_f64(state.line.value().max(0.0)),
            total_lines: state.total_lines,
            valid: state.valid_count >= VALID_MEASUREMENTS,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.shared.state.lock().valid_count >= VALID_MEASUREMENTS
    }

    /// Time until the raster next enters the blanking interval, given the
    /// current scanline. `None` until the estimate is valid.
    pub fn time_to_next_vblank(&self, scanline_now: u32, visible_height: u32) -> Option<Duration> {
        let state = self.shared.state.lock();
        if state.valid_count < VALID_MEASUREMENTS {
            return None;
        }
        if scanline_now >= visible_height {
            // Already inside the blanking interval.
            return Some(Duration::ZERO);
        }
        let remaining = (visible_height - scanline_now) as f64;
        Some(Duration::from_secs_f64(remaining * state.line.value()))
    }

    /// Signals the thread to exit and waits up to `timeout` for it.
    ///
    /// A thread that fails to exit is detached and the anomaly logged; it
    /// indicates a stuck scanline query in the backend.
    pub fn shutdown(&self, timeout: Duration) {
        self.shared.quit.store(true, Ordering::Release);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            tracing::error!(
                "refresh tracker thread failed to exit within {:?}; detaching",
                timeout
            );
        }
    }
}

impl Drop for RefreshTracker {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(100));
    }
}

fn measurement_loop<B>(backend: Arc<B>, host: Arc<dyn HostClock>, shared: Arc<Shared>)
where
    B: PresentationBackend,
{
    tracing::debug!("refresh tracker started");
    while !shared.quit.load(Ordering::Acquire) {
        match measure_cycle(&*backend, &*host, &shared.quit) {
            Ok(Some(m)) => {
                let mut state = shared.state.lock();
                state.adopt(m);
                if state.valid_count == VALID_MEASUREMENTS {
                    tracing::info!(
                        "refresh estimate valid: period={:.3}ms ({:.3} Hz)",
                        state.period.value() * 1e3,
                        1.0 / state.period.value()
                    );
                }
            }
            Ok(None) => {
                // Discarded cycle (torn measurement or quit); nothing to do.
            }
            Err(e) => {
                tracing::warn!("scanline query failed: {}", e);
                quit_aware_sleep(&shared.quit, Duration::from_millis(10));
            }
        }
        quit_aware_sleep(&shared.quit, CYCLE_GAP);
    }
    tracing::debug!("refresh tracker exiting");
}

/// Runs one three-checkpoint measurement. `Ok(None)` means the cycle was
/// abandoned (quit, wrap, or inconsistent intervals) and should simply be
/// retried.
fn measure_cycle<B>(
    backend: &B,
    host: &dyn HostClock,
    quit: &AtomicBool,
) -> Result<Option<Measurement>, PresentError>
where
    B: PresentationBackend,
{
    let height = backend.screen_height();
    let nominal_hz = backend.nominal_refresh_hz();
    if height == 0 || nominal_hz <= 0.0 {
        return Err(PresentError::ScanlineQuery(
            "backend reports no display geometry".into(),
        ));
    }

    // First checkpoint sits slightly past the vblank region, bounded below
    // by a few lines and above by a quarter of the visible height so the
    // later checkpoints cannot wrap.
    let start = (height / 20).clamp(MIN_START_LINE, height / 4);
    let mid = start + height / 4;
    let end = start + height / 2;

    let nominal_period = Duration::from_secs_f64(1.0 / nominal_hz);
    let deadline = Instant::now() + 4 * nominal_period;

    let Some((t0, s0)) = wait_for_line(backend, host, quit, start, true, deadline)? else {
        return Ok(None);
    };
    let Some((t1, s1)) = wait_for_line(backend, host, quit, mid, false, deadline)? else {
        return Ok(None);
    };
    let Some((t2, s2)) = wait_for_line(backend, host, quit, end, false, deadline)? else {
        return Ok(None);
    };

    // The raster must have moved strictly forward through all three
    // checkpoints; anything else means we caught a wrap.
    if s1 <= s0 || s2 <= s1 {
        return Ok(None);
    }

    Ok(derive_measurement(t0, s0, t1, s1, t2, s2, nominal_hz, height).ok())
}

/// Fits line duration and refresh period from three (time, scanline)
/// checkpoints. Returns `Err(())` when the half-intervals disagree.
#[allow(clippy::too_many_arguments)]
fn derive_measurement(
    t0: i64,
    s0: u32,
    t1: i64,
    s1: u32,
    t2: i64,
    s2: u32,
    nominal_hz: f64,
    height: u32,
) -> Result<Measurement, ()> {
    let rate01 = (t1 - t0) as f64 / (s1 - s0) as f64;
    let rate12 = (t2 - t1) as f64 / (s2 - s1) as f64;
    if rate01 <= 0.0 || rate12 <= 0.0 {
        return Err(());
    }
    let ratio = rate01 / rate12;
    if !(1.0 - HALF_INTERVAL_TOLERANCE..=1.0 + HALF_INTERVAL_TOLERANCE).contains(&ratio) {
        return Err(());
    }

    let line_ns = (t2 - t0) as f64 / (s2 - s0) as f64;
    let line_secs = line_ns / 1e9;

    // The per-line duration is measured; the blanking size is not. Rounding
    // the nominal period to a whole number of measured lines recovers the
    // true total without inheriting the nominal rate's error.
    let total_lines = ((1.0 / nominal_hz) / line_secs).round().max(height as f64) as u32;
    let period_secs = line_secs * total_lines as f64;

    Ok(Measurement {
        period_secs,
        line_secs,
        total_lines,
    })
}

/// Polls until the scanline reaches `target`. When `allow_wrap` is set, a
/// position already past the target first waits for the raster to wrap.
/// Returns the host time (ns) and the actual scanline observed.
fn wait_for_line<B>(
    backend: &B,
    host: &dyn HostClock,
    quit: &AtomicBool,
    target: u32,
    allow_wrap: bool,
    deadline: Instant,
) -> Result<Option<(i64, u32)>, PresentError>
where
    B: PresentationBackend,
{
    let mut waiting_for_wrap = allow_wrap && backend.scanline()? >= target;
    loop {
        if quit.load(Ordering::Acquire) || Instant::now() > deadline {
            return Ok(None);
        }
        let s = backend.scanline()?;
        if waiting_for_wrap {
            if s < target {
                waiting_for_wrap = false;
            }
        } else if s >= target {
            let freq = host.frequency() as f64;
            let t_ns = (host.counter() as f64 / freq * 1e9) as i64;
            return Ok(Some((t_ns, s)));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn quit_aware_sleep(quit: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if quit.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_measurement_consistent_intervals() {
        // 1080 visible lines, 1125 total, 60 Hz: one line ~14.8us.
        let line_ns = 1_000_000_000.0 / 60.0 / 1125.0;
        let t = |lines: u32| (lines as f64 * line_ns) as i64;

        let m = derive_measurement(t(60), 60, t(330), 330, t(600), 600, 60.0, 1080).unwrap();
        assert_eq!(m.total_lines, 1125);
        assert!((m.period_secs - 1.0 / 60.0).abs() / (1.0 / 60.0) < 0.001);
    }

    #[test]
    fn test_derive_measurement_rejects_torn_intervals() {
        let line_ns = 1_000_000_000.0 / 60.0 / 1125.0;
        let t = |lines: u32| (lines as f64 * line_ns) as i64;

        // Second half takes twice as long per line (e.g. the thread was
        // preempted mid-measurement).
        let torn_t2 = t(330) + ((600 - 330) as f64 * line_ns * 2.0) as i64;
        let r = derive_measurement(t(60), 60, t(330), 330, torn_t2, 600, 60.0, 1080);
        assert!(r.is_err());
    }

    #[test]
    fn test_adopt_reaches_validity() {
        let mut state = VSyncState {
            measurements: RingBuffer::new(MEASUREMENT_WINDOW),
            period: Moderator::new(0.0),
            line: Moderator::new(0.0),
            total_lines: 0,
            valid_count: 0,
            have_smoothed: false,
        };

        let m = Measurement {
            period_secs: 1.0 / 60.0,
            line_secs: 1.0 / 60.0 / 1125.0,
            total_lines: 1125,
        };
        for _ in 0..VALID_MEASUREMENTS {
            state.adopt(m);
        }
        assert_eq!(state.valid_count, VALID_MEASUREMENTS);
        assert!((state.period.value() - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_adopt_moderates_large_jump() {
        let mut state = VSyncState {
            measurements: RingBuffer::new(MEASUREMENT_WINDOW),
            period: Moderator::new(0.0),
            line: Moderator::new(0.0),
            total_lines: 0,
            valid_count: 0,
            have_smoothed: false,
        };
        let near_60 = Measurement {
            period_secs: 1.0 / 60.0,
            line_secs: 1.0 / 60.0 / 1125.0,
            total_lines: 1125,
        };
        for _ in 0..MEASUREMENT_WINDOW {
            state.adopt(near_60);
        }

        // A measurement 33% off drags the window mean well past 1%; the
        // smoothed value must not jump straight to the new mean.
        let outlier = Measurement {
            period_secs: 1.0 / 45.0,
            line_secs: 1.0 / 45.0 / 1125.0,
            total_lines: 1125,
        };
        let before = state.period.value();
        state.adopt(outlier);
        let n = state.measurements.len() as f64;
        let mean = state.measurements.iter().map(|(p, _)| p).sum::<f64>() / n;
        let after = state.period.value();
        assert!((after - before).abs() < (mean - before).abs());
    }

    #[test]
    fn test_smoothed_small_move_is_direct() {
        let mut m = Moderator::new(100.0);
        adopt_smoothed(&mut m, 100.5); // 0.5% move
        assert_eq!(m.value(), 100.5);
    }
}
