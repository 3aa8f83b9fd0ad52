//! Core frame types and collaborator traits.
//!
//! presync does not decode, composite, or allocate images. It receives
//! decoded frames from an upstream producer and hands them to a
//! [`PresentationBackend`] at the right instant. The types here define that
//! boundary:
//!
//! - [`Frame`] - an opaque image handle plus presentation timing
//! - [`PresentationBackend`] - the display-side primitive (present + scanline)
//! - [`ReferenceClock`] - the external playback clock being followed
//! - [`HostClock`] - the local high-resolution monotonic counter

use std::time::{Duration, Instant};

/// Monotonically increasing tag identifying a device/stream epoch.
///
/// After a flush or device reset the queue's generation is bumped; a frame
/// carrying an older generation that resurfaces from an in-flight path is
/// discarded instead of presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// A decoded video frame awaiting presentation.
///
/// The image handle is owned by whichever queue currently holds the frame;
/// it is moved on enqueue/dequeue, never copied.
#[derive(Debug)]
pub struct Frame<I> {
    /// Opaque image handle, presented via [`PresentationBackend::present`].
    pub image: I,
    /// Presentation timestamp; `None` means the decoder produced no usable
    /// timestamp and the frame is shown as soon as possible.
    pub pts: Option<Duration>,
    /// Declared frame duration from the decoder.
    pub duration: Duration,
    /// Epoch tag; stale frames are discarded, not presented.
    pub generation: Generation,
    /// True if the rate detector rewrote this frame's timestamp to absorb
    /// upstream jitter.
    pub corrected: bool,
}

impl<I> Frame<I> {
    pub fn new(image: I, pts: Option<Duration>, duration: Duration, generation: Generation) -> Self {
        Self {
            image,
            pts,
            duration,
            generation,
            corrected: false,
        }
    }
}

/// Run state reported by the reference clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// One query of the reference clock: the reference time together with the
/// host counter captured at the moment of the query, so the caller can
/// extrapolate across query latency.
#[derive(Debug, Clone, Copy)]
pub struct ClockSample {
    /// Reference playback time at the instant of the query.
    pub time: Duration,
    /// Host counter value captured inside the query.
    pub host_counter: i64,
    /// Reference clock run state; a change triggers a moderator reset.
    pub state: RunState,
}

/// Display-side presentation primitive.
///
/// One implementation per display/output stack. The scheduler depends only on
/// this trait; the refresh tracker uses the scanline query to measure the
/// display's real cadence, so `scanline()` must be cheap enough to poll.
pub trait PresentationBackend: Send + Sync {
    /// Opaque image handle type carried by [`Frame`].
    type Image: Send + 'static;

    /// Presents the frame's image now. Synchronous from the scheduler's view.
    fn present(&self, frame: &Frame<Self::Image>) -> Result<(), PresentError>;

    /// Current row-scan position of the display.
    fn scanline(&self) -> Result<u32, PresentError>;

    /// Nominal refresh rate reported by the display stack, in Hz.
    fn nominal_refresh_hz(&self) -> f64;

    /// Visible height of the output in scanlines.
    fn screen_height(&self) -> u32;
}

/// External playback clock (e.g. the audio renderer's clock).
pub trait ReferenceClock: Send + Sync {
    /// Samples the clock, or `None` when no clock is available.
    fn query(&self) -> Option<ClockSample>;
}

/// Local high-resolution monotonic counter.
pub trait HostClock: Send + Sync {
    /// Current counter value.
    fn counter(&self) -> i64;

    /// Counter ticks per second.
    fn frequency(&self) -> i64;
}

/// [`HostClock`] backed by [`std::time::Instant`], at nanosecond resolution.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for SystemClock {
    fn counter(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn frequency(&self) -> i64 {
        1_000_000_000
    }
}

/// Errors surfaced by the presentation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PresentError {
    /// The backend failed to present an image.
    PresentFailed(String),
    /// The backend could not report a scanline position.
    ScanlineQuery(String),
    /// The pipeline has been shut down.
    Shutdown,
    /// Generic error.
    Generic(String),
}

impl std::fmt::Display for PresentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresentError::PresentFailed(msg) => write!(f, "Present failed: {msg}"),
            PresentError::ScanlineQuery(msg) => write!(f, "Scanline query failed: {msg}"),
            PresentError::Shutdown => write!(f, "Presentation pipeline is shut down"),
            PresentError::Generic(msg) => write!(f, "Presentation error: {msg}"),
        }
    }
}

impl std::error::Error for PresentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_next() {
        let g = Generation(7);
        assert_eq!(g.next(), Generation(8));
        assert_eq!(Generation(u64::MAX).next(), Generation(0));
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.counter();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.counter();
        assert!(b > a);
        assert_eq!(clock.frequency(), 1_000_000_000);
    }

    #[test]
    fn test_error_display() {
        let e = PresentError::PresentFailed("device lost".into());
        assert_eq!(e.to_string(), "Present failed: device lost");
    }
}
