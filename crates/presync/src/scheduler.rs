//! Presentation scheduler: decides, frame by frame, when to present.
//!
//! The scheduler runs as a dedicated consumer thread. Each tick it pops the
//! next scheduled frame, asks the clock moderator what the reference clock
//! reads right now, derives the frame period from the rate detector (falling
//! back to the frame's declared duration), and lands in one of three
//! branches:
//!
//! - **Drop** - the frame is more than a period-plus-margin behind and
//!   another frame is queued behind it; showing it would only push everything
//!   later. The last queued frame is never dropped.
//! - **Present** - the frame's offset falls inside a jitter-scaled margin
//!   band around "now"; if the refresh estimate is valid, presentation is
//!   additionally aligned to the next vertical-blank boundary.
//! - **Delay** - the frame is early; it goes back to the front of the
//!   scheduled list and the thread sleeps a bounded slice before retrying.
//!
//! A cadence tracker watches where in the refresh cycle presents actually
//! land. When the source rate does not divide the display rate, offsets
//! drift toward one edge of the frame period; biasing the present window
//! toward that edge avoids a periodic double-step in frame timing.
//!
//! Commands (state changes, flush, frame step) arrive over a channel and are
//! processed between ticks. Flush is a synchronous barrier: the caller
//! blocks until the scheduler thread has cleared the queue and acknowledged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::clock::ClockModerator;
use crate::config::PresentConfig;
use crate::context::PresentationContext;
use crate::frame::{Frame, Generation, PresentError, PresentationBackend};
use crate::frame_queue::FrameQueue;
use crate::metrics::{PresentMetrics, PresentMetricsSnapshot};
use crate::rate_detect::FrameRateDetector;
use crate::refresh::RefreshTracker;
use crate::ring::RingBuffer;

/// Render state of the scheduler. Starvation is a separate condition
/// orthogonal to this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Stopped,
    Paused,
    Started,
}

/// Callbacks raised from the scheduler thread.
///
/// Implementations must not call back into the scheduler (deadlock) and
/// should return quickly.
pub trait PresentEvents: Send + Sync {
    /// The scheduled queue underran while playback was judged behind.
    fn on_starvation(&self) {}

    /// A requested single-frame advance has completed.
    fn on_frame_step_complete(&self) {}
}

/// No-op [`PresentEvents`] implementation.
pub struct NoEvents;

impl PresentEvents for NoEvents {}

enum Command {
    SetState(RenderState),
    Flush { done: Sender<()> },
    StepFrame,
    Stop,
}

/// Per-frame scheduling decision; see the module docs for the branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Present,
    Drop,
    /// Sleep this many nanoseconds, then retry the same frame.
    Delay(i64),
}

/// Cadence-shift mode: where the present-now window is biased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CadenceMode {
    Neutral,
    ShiftEarly,
    ShiftLate,
}

/// Tracks where in the refresh cycle presents land and shifts the present
/// window when they cluster at an edge.
struct CadenceTracker {
    offsets: RingBuffer<f64>,
    mode: CadenceMode,
    edge_fraction: f64,
    shift_threshold: u32,
    return_threshold: u32,
}

impl CadenceTracker {
    fn new(config: &PresentConfig) -> Self {
        Self {
            offsets: RingBuffer::new(config.cadence_history.max(1)),
            mode: CadenceMode::Neutral,
            edge_fraction: config.cadence_edge_fraction,
            shift_threshold: config.cadence_shift_threshold,
            return_threshold: config.cadence_return_threshold,
        }
    }

    fn mode(&self) -> CadenceMode {
        self.mode
    }

    /// Records a present position as a fraction of the refresh cycle [0, 1).
    fn record(&mut self, fraction: f64) {
        self.offsets.push(fraction);

        let early = self
            .offsets
            .iter()
            .filter(|&&f| f < self.edge_fraction)
            .count() as u32;
        let late = self
            .offsets
            .iter()
            .filter(|&&f| f > 1.0 - self.edge_fraction)
            .count() as u32;
        let centered = self.offsets.len() as u32 - early - late;

        match self.mode {
            CadenceMode::Neutral => {
                if early >= self.shift_threshold {
                    tracing::debug!("cadence shift: early edge ({} of {})", early, self.offsets.len());
                    self.mode = CadenceMode::ShiftEarly;
                } else if late >= self.shift_threshold {
                    tracing::debug!("cadence shift: late edge ({} of {})", late, self.offsets.len());
                    self.mode = CadenceMode::ShiftLate;
                }
            }
            CadenceMode::ShiftEarly | CadenceMode::ShiftLate => {
                if centered >= self.return_threshold {
                    tracing::debug!("cadence shift: back to neutral");
                    self.mode = CadenceMode::Neutral;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.offsets.clear();
        self.mode = CadenceMode::Neutral;
    }
}

/// Margin band around the frame period, scaled by measured jitter but
/// bounded to a fraction band of the period.
fn compute_margin(period_ns: i64, jitter: Duration, config: &PresentConfig) -> i64 {
    let jitter_ns = (jitter.as_nanos() as i64).min(config.margin_jitter_cap.as_nanos() as i64);
    let raw = config.margin_floor.as_nanos() as i64 + jitter_ns;
    let min = (period_ns as f64 * config.margin_min_fraction) as i64;
    let max = (period_ns as f64 * config.margin_max_fraction) as i64;
    raw.clamp(min, max.max(min))
}

/// The drop/present/delay decision. Pure so the decision table is testable
/// without threads.
fn decide(
    sync_offset_ns: i64,
    period_ns: i64,
    margin_ns: i64,
    remaining: usize,
    mode: CadenceMode,
    max_wait_ns: i64,
) -> Decision {
    // A frame this far behind only delays everything queued after it - but
    // the last queued frame is never dropped, or there would be nothing on
    // screen at all.
    if sync_offset_ns < -(period_ns + margin_ns) && remaining > 0 {
        return Decision::Drop;
    }

    // The early bound of the present-now window widens when the cadence
    // tracker has seen presents cluster at an edge.
    let early_bound = match mode {
        CadenceMode::Neutral => margin_ns,
        CadenceMode::ShiftEarly => margin_ns * 2,
        CadenceMode::ShiftLate => margin_ns / 2,
    };

    if sync_offset_ns <= early_bound {
        return Decision::Present;
    }

    Decision::Delay((sync_offset_ns - early_bound).min(max_wait_ns))
}

/// The orchestrating presentation scheduler.
///
/// Owns the frame queue, the estimators, and the consumer thread. Producers
/// talk to it through [`acquire_free`](Self::acquire_free) /
/// [`enqueue`](Self::enqueue); lifecycle control goes through
/// [`set_render_state`](Self::set_render_state), [`flush`](Self::flush) and
/// [`step_frame`](Self::step_frame).
pub struct PresentScheduler<B: PresentationBackend> {
    queue: Arc<FrameQueue<B::Image>>,
    detector: Arc<FrameRateDetector>,
    refresh: Arc<RefreshTracker>,
    metrics: PresentMetrics,
    command_tx: Sender<Command>,
    quit: Arc<AtomicBool>,
    /// Mirror of the worker's state, for observers.
    shared_state: Arc<Mutex<RenderState>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl<B: PresentationBackend> PresentScheduler<B> {
    /// Spawns the scheduler and refresh tracker threads.
    pub fn spawn(context: PresentationContext<B>, events: Arc<dyn PresentEvents>) -> Self
    where
        B: 'static,
    {
        let config = context.config.clone();
        let queue = Arc::new(FrameQueue::new());
        let detector = Arc::new(FrameRateDetector::new(config.correction_enabled));
        let metrics = PresentMetrics::new();
        let clock = Arc::new(ClockModerator::new(
            Arc::clone(&context.reference),
            Arc::clone(&context.host),
        ));
        let refresh = Arc::new(RefreshTracker::spawn(
            Arc::clone(&context.backend),
            Arc::clone(&context.host),
        ));

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let quit = Arc::new(AtomicBool::new(false));
        let shared_state = Arc::new(Mutex::new(RenderState::Stopped));

        let worker = Worker {
            backend: Arc::clone(&context.backend),
            queue: Arc::clone(&queue),
            clock,
            refresh: Arc::clone(&refresh),
            detector: Arc::clone(&detector),
            metrics: metrics.clone(),
            events,
            cadence: CadenceTracker::new(&config),
            config: config.clone(),
            command_rx,
            quit: Arc::clone(&quit),
            state: RenderState::Stopped,
            shared_state: Arc::clone(&shared_state),
            starved: false,
        };

        let handle = thread::Builder::new()
            .name("presync-scheduler".into())
            .spawn(move || worker.run())
            .expect("failed to spawn scheduler thread");

        Self {
            queue,
            detector,
            refresh,
            metrics,
            command_tx,
            quit,
            shared_state,
            handle: Mutex::new(Some(handle)),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// The state the scheduler thread is currently operating in.
    ///
    /// [`set_render_state`](Self::set_render_state) is asynchronous; this
    /// reflects the transition only once the thread has processed it.
    pub fn render_state(&self) -> RenderState {
        *self.shared_state.lock()
    }

    /// Takes a recycled frame slot from the free list, if one is spare.
    pub fn acquire_free(&self) -> Option<Frame<B::Image>> {
        self.queue.acquire_free()
    }

    /// Current device/stream generation for tagging new frames.
    pub fn current_generation(&self) -> Generation {
        self.queue.current_generation()
    }

    /// Invalidates all in-flight frames after a device or stream reset.
    pub fn bump_generation(&self) -> Generation {
        self.queue.bump_generation()
    }

    /// Queues a frame for presentation, running it through the rate detector
    /// (and timestamp correction, when locked and enabled) first.
    pub fn enqueue(&self, mut frame: Frame<B::Image>) {
        let observation = self.detector.observe(frame.pts, frame.duration);
        if let Some((pts, duration)) = observation.corrected {
            tracing::trace!(
                "jitter correction: {:?} -> {:?}",
                frame.pts,
                pts
            );
            frame.pts = Some(pts);
            frame.duration = duration;
            frame.corrected = true;
            self.metrics.record_corrected();
        }
        self.queue.schedule_back(frame);
    }

    /// Changes the render state.
    pub fn set_render_state(&self, state: RenderState) {
        let _ = self.command_tx.send(Command::SetState(state));
    }

    /// Requests a single-frame advance while paused; completion is reported
    /// via [`PresentEvents::on_frame_step_complete`].
    pub fn step_frame(&self) {
        let _ = self.command_tx.send(Command::StepFrame);
    }

    /// Flushes the scheduled queue and waits for the scheduler thread to
    /// acknowledge. On return the scheduled list is empty, the last-presented
    /// timestamp is invalid, and no flushed frame is mid-present.
    pub fn flush(&self) -> Result<(), PresentError> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.command_tx
            .send(Command::Flush { done: done_tx })
            .map_err(|_| PresentError::Shutdown)?;
        done_rx.recv().map_err(|_| PresentError::Shutdown)
    }

    /// Marks that no further frames will be enqueued.
    pub fn set_eos(&self) {
        self.queue.set_eos();
    }

    pub fn metrics(&self) -> PresentMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn queue(&self) -> &Arc<FrameQueue<B::Image>> {
        &self.queue
    }

    /// Locked source frame rate, once the detector has one.
    pub fn locked_rate(&self) -> Option<f64> {
        self.detector.locked_rate()
    }

    /// Stops both background threads, waiting up to the configured timeout
    /// for each. A thread that fails to exit is detached and logged.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::Release);
        let _ = self.command_tx.send(Command::Stop);

        if let Some(handle) = self.handle.lock().take() {
            let deadline = Instant::now() + self.shutdown_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::error!(
                    "scheduler thread failed to exit within {:?}; detaching",
                    self.shutdown_timeout
                );
            }
        }
        self.refresh.shutdown(self.shutdown_timeout);
    }
}

impl<B: PresentationBackend> Drop for PresentScheduler<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<B: PresentationBackend> {
    backend: Arc<B>,
    queue: Arc<FrameQueue<B::Image>>,
    clock: Arc<ClockModerator>,
    refresh: Arc<RefreshTracker>,
    detector: Arc<FrameRateDetector>,
    metrics: PresentMetrics,
    events: Arc<dyn PresentEvents>,
    cadence: CadenceTracker,
    config: PresentConfig,
    command_rx: Receiver<Command>,
    quit: Arc<AtomicBool>,
    state: RenderState,
    shared_state: Arc<Mutex<RenderState>>,
    starved: bool,
}

impl<B: PresentationBackend> Worker<B> {
    fn run(mut self) {
        tracing::debug!("scheduler thread started");
        loop {
            if self.quit.load(Ordering::Acquire) {
                break;
            }

            // Drain pending commands without blocking.
            let mut stop = false;
            while let Ok(cmd) = self.command_rx.try_recv() {
                if !self.handle_command(cmd) {
                    stop = true;
                    break;
                }
            }
            if stop {
                break;
            }

            match self.state {
                RenderState::Started => self.tick(),
                RenderState::Stopped | RenderState::Paused => {
                    // Idle: wait for the next command with a bounded timeout
                    // so the quit flag is observed promptly.
                    match self.command_rx.recv_timeout(self.config.max_tick_wait) {
                        Ok(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        Err(_) => {}
                    }
                }
            }
        }
        tracing::debug!("scheduler thread exiting");
    }

    /// Returns false when the thread should exit.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Stop => return false,
            Command::SetState(state) => {
                if state != self.state {
                    tracing::debug!("render state {:?} -> {:?}", self.state, state);
                    self.state = state;
                    *self.shared_state.lock() = state;
                    if state != RenderState::Started {
                        self.clear_starvation();
                    }
                }
            }
            Command::Flush { done } => {
                self.queue.flush();
                self.detector.reset();
                self.metrics.invalidate_last_pts();
                self.cadence.reset();
                self.clear_starvation();
                // The requester is blocked until this acknowledgment; no
                // flushed frame can be mid-present past this point.
                let _ = done.send(());
            }
            Command::StepFrame => {
                if self.state == RenderState::Paused {
                    self.step_one_frame();
                } else {
                    tracing::debug!("frame step ignored outside Paused state");
                }
                self.events.on_frame_step_complete();
            }
        }
        true
    }

    /// One pass of the Started consumer loop.
    fn tick(&mut self) {
        let Some((frame, remaining)) = self
            .queue
            .take_next_scheduled_timeout(self.config.max_tick_wait)
        else {
            self.check_starvation();
            return;
        };

        if self.starved && remaining + 1 >= self.config.starvation_recover_depth {
            self.clear_starvation();
        }

        if self.queue.is_stale(&frame) {
            // Frame from a previous device/stream epoch; presenting it would
            // show stale or invalid content.
            tracing::debug!("discarding stale-generation frame");
            self.metrics.record_stale_discard();
            return;
        }

        let Some(pts) = frame.pts else {
            // No timestamp, no pacing: show it as soon as possible.
            self.present_frame(frame);
            return;
        };
        let Some(now) = self.clock.sample() else {
            self.present_frame(frame);
            return;
        };

        let period_ns = self.frame_period_ns(&frame);
        let margin_ns = compute_margin(period_ns, self.detector.jitter_stddev(), &self.config);
        let sync_offset_ns = pts.as_nanos() as i64 - now.as_nanos() as i64;

        let decision = decide(
            sync_offset_ns,
            period_ns,
            margin_ns,
            remaining,
            self.cadence.mode(),
            self.config.max_tick_wait.as_nanos() as i64,
        );

        match decision {
            Decision::Drop => {
                tracing::trace!(
                    "drop: offset={}us period={}us remaining={}",
                    sync_offset_ns / 1000,
                    period_ns / 1000,
                    remaining
                );
                self.metrics.record_dropped();
                self.queue.release_to_free(frame, true);
            }
            Decision::Present => {
                self.align_to_vblank(period_ns);
                self.present_frame(frame);
            }
            Decision::Delay(wait_ns) => {
                self.queue.schedule_front(frame);
                self.bounded_sleep(Duration::from_nanos(wait_ns.max(0) as u64));
            }
        }
    }

    /// Frame period from the locked rate, else the frame's declared duration.
    fn frame_period_ns(&self, frame: &Frame<B::Image>) -> i64 {
        if let Some(period) = self.detector.frame_period() {
            return period.as_nanos() as i64;
        }
        let declared = frame.duration.as_nanos() as i64;
        if declared > 0 {
            declared
        } else {
            (1e9 / self.backend.nominal_refresh_hz().max(1.0)) as i64
        }
    }

    /// Sleeps until the raster is about to enter vblank, so the present lands
    /// on the boundary instead of mid-scan.
    fn align_to_vblank(&mut self, period_ns: i64) {
        let estimate = self.refresh.estimate();
        if !estimate.valid {
            return;
        }
        let Ok(scanline) = self.backend.scanline() else {
            return;
        };
        let Some(to_vblank) = self
            .refresh
            .time_to_next_vblank(scanline, self.backend.screen_height())
        else {
            return;
        };

        let line_offset = estimate
            .line_duration
            .mul_f64(self.config.vblank_offset_lines.unsigned_abs() as f64);
        let wait = if self.config.vblank_offset_lines >= 0 {
            to_vblank.saturating_sub(line_offset)
        } else {
            to_vblank.saturating_add(line_offset)
        };

        // Waiting longer than a frame period means the estimate is off;
        // presenting now is better than stalling.
        if wait.as_nanos() as i64 >= period_ns {
            return;
        }
        self.bounded_sleep(wait);

        // Record where in the refresh cycle this present lands, for the
        // cadence tracker.
        if estimate.total_lines > 0 {
            if let Ok(s) = self.backend.scanline() {
                self.cadence
                    .record(s as f64 / estimate.total_lines as f64);
            }
        }
    }

    fn present_frame(&mut self, frame: Frame<B::Image>) {
        match self.backend.present(&frame) {
            Ok(()) => {
                self.metrics.record_drawn(frame.pts);
            }
            Err(e) => {
                tracing::error!("present failed: {}", e);
                self.metrics.record_present_failure();
            }
        }
        self.update_gauges();
        self.queue.release_to_free(frame, true);
    }

    /// Presents the next scheduled frame immediately (frame stepping).
    fn step_one_frame(&mut self) {
        let Some((frame, _)) = self.queue.take_next_scheduled() else {
            tracing::debug!("frame step requested with empty queue");
            return;
        };
        if self.queue.is_stale(&frame) {
            self.metrics.record_stale_discard();
            return;
        }
        self.present_frame(frame);
    }

    fn check_starvation(&mut self) {
        if self.starved || self.queue.is_eos() {
            return;
        }
        let (Some(now), Some(last)) = (self.clock.sample(), self.metrics.last_presented_pts())
        else {
            return;
        };
        if now.saturating_sub(last) > self.config.starvation_behind {
            tracing::warn!(
                "starvation: queue empty, playback behind by {:?}",
                now - last
            );
            self.starved = true;
            self.metrics.set_starved(true);
            self.events.on_starvation();
        }
    }

    fn clear_starvation(&mut self) {
        if self.starved {
            tracing::debug!("starvation cleared");
        }
        self.starved = false;
        self.metrics.set_starved(false);
    }

    fn update_gauges(&self) {
        self.metrics.set_jitter_stddev(self.detector.jitter_stddev());
        self.metrics.set_locked_rate(self.detector.locked_rate());
        self.metrics.set_clock_speed(self.clock.speed());
        let estimate = self.refresh.estimate();
        self.metrics
            .set_refresh_period(estimate.valid.then_some(estimate.refresh_period));
    }

    /// Sleeps in short slices so the quit flag is observed within the
    /// polling bound even during vblank alignment.
    fn bounded_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        loop {
            if self.quit.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(2)));
        }
    }
}
