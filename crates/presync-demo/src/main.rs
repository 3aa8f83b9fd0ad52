//! presync demo.
//!
//! Drives the full presentation pipeline against a simulated 60 Hz display
//! and a 23.976 fps synthetic source with timestamp jitter, logging a
//! metrics snapshot once a second. Useful for eyeballing the refresh
//! estimate, the rate lock, and the drop/present balance without real
//! hardware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use presync::{
    ClockSample, Frame, HostClock, NoEvents, PresentError, PresentScheduler, PresentationBackend,
    PresentationContext, ReferenceClock, RunState, SystemClock,
};

/// Simulated display: fixed refresh derived from the host clock.
const REFRESH_HZ: f64 = 60.0;
const VISIBLE_LINES: u32 = 1080;
const TOTAL_LINES: u32 = 1125;

/// Simulated source.
const SOURCE_FPS: f64 = 23.976;
const RUN_SECONDS: u64 = 5;

struct SimulatedDisplay {
    origin: Instant,
    presented: AtomicU64,
}

impl SimulatedDisplay {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            presented: AtomicU64::new(0),
        }
    }

    fn presented(&self) -> u64 {
        self.presented.load(Ordering::Acquire)
    }
}

impl PresentationBackend for SimulatedDisplay {
    type Image = u64;

    fn present(&self, frame: &Frame<u64>) -> Result<(), PresentError> {
        self.presented.fetch_add(1, Ordering::AcqRel);
        tracing::trace!("present image #{} pts={:?}", frame.image, frame.pts);
        Ok(())
    }

    fn scanline(&self) -> Result<u32, PresentError> {
        let secs = self.origin.elapsed().as_secs_f64();
        let frame_pos = (secs * REFRESH_HZ).fract();
        Ok((frame_pos * TOTAL_LINES as f64) as u32)
    }

    fn nominal_refresh_hz(&self) -> f64 {
        REFRESH_HZ
    }

    fn screen_height(&self) -> u32 {
        VISIBLE_LINES
    }
}

/// Reference clock that simply follows the host counter once started.
struct WallReferenceClock {
    host: Arc<SystemClock>,
}

impl ReferenceClock for WallReferenceClock {
    fn query(&self) -> Option<ClockSample> {
        let counter = self.host.counter();
        Some(ClockSample {
            time: Duration::from_nanos(counter as u64),
            host_counter: counter,
            state: RunState::Running,
        })
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("presync=debug".parse().unwrap())
                .add_directive("presync_demo=info".parse().unwrap()),
        )
        .init();

    let host = Arc::new(SystemClock::new());
    let display = Arc::new(SimulatedDisplay::new());
    let reference = Arc::new(WallReferenceClock {
        host: Arc::clone(&host),
    });

    let context = PresentationContext::new(Arc::clone(&display), reference).with_host(host);
    let scheduler = PresentScheduler::spawn(context, Arc::new(NoEvents));
    scheduler.set_render_state(presync::RenderState::Started);

    tracing::info!(
        "feeding {:.3} fps source to a {:.0} Hz display for {}s",
        SOURCE_FPS,
        REFRESH_HZ,
        RUN_SECONDS
    );

    let period = Duration::from_secs_f64(1.0 / SOURCE_FPS);
    let start = Instant::now();
    let mut frame_index = 0u64;
    let mut last_report = Instant::now();

    while start.elapsed() < Duration::from_secs(RUN_SECONDS) {
        // Produce in real time, with a little timestamp jitter for the
        // detector to chew on.
        let pts = period.mul_f64(frame_index as f64);
        let jitter = Duration::from_micros((frame_index % 5) * 300);
        let frame = Frame::new(
            frame_index,
            Some(pts + jitter),
            period,
            scheduler.current_generation(),
        );
        scheduler.enqueue(frame);
        frame_index += 1;

        if last_report.elapsed() >= Duration::from_secs(1) {
            let snap = scheduler.metrics();
            tracing::info!(
                "drawn={} dropped={} corrected={} locked={:?} refresh={:?} jitter={:?}",
                snap.frames_drawn,
                snap.frames_dropped,
                snap.frames_corrected,
                snap.locked_rate_hz,
                snap.refresh_period,
                snap.jitter_stddev,
            );
            last_report = Instant::now();
        }

        // Pace the producer to the source rate.
        let next_due = period.mul_f64(frame_index as f64);
        if let Some(sleep) = next_due.checked_sub(start.elapsed()) {
            std::thread::sleep(sleep);
        }
    }

    scheduler.set_eos();
    std::thread::sleep(Duration::from_millis(200));

    let snap = scheduler.metrics();
    let presented = display.presented();
    tracing::info!(
        "done: produced={} presented={} dropped={} stale={} starvation_events={}",
        frame_index,
        presented,
        snap.frames_dropped,
        snap.stale_discards,
        snap.starvation_events,
    );

    scheduler.shutdown();
}
