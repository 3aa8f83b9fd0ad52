//! presync: presentation scheduling and display timing for video playback.
//!
//! This crate adapts decoded video frames, produced by an external
//! decoder/mixer, to a display's physical refresh cycle, so frames are shown
//! with minimal judder, tearing, or drift relative to an external playback
//! clock. It contains:
//!
//! - [`FrameQueue`] - thread-safe free/scheduled double queue of frames
//! - [`ClockModerator`] - drift-smoothed reconciliation of a reference clock
//!   against the host monotonic counter
//! - [`RefreshTracker`] - background estimator of the display's real refresh
//!   period and vertical-blank phase, from scanline samples alone
//! - [`FrameRateDetector`] - source frame-rate lock and timestamp jitter
//!   correction from noisy decoder timestamps
//! - [`PresentScheduler`] - the consumer state machine deciding, frame by
//!   frame, whether to present, delay, or drop
//!
//! Decoding, GPU resources, and the actual present primitive live behind the
//! [`PresentationBackend`] trait; this crate decides only *when*
//! presentation happens.
//!
//! # Usage
//!
//! ```ignore
//! use presync::{Frame, PresentationContext, PresentScheduler, NoEvents, RenderState};
//! use std::sync::Arc;
//!
//! let context = PresentationContext::new(backend, reference_clock);
//! let scheduler = PresentScheduler::spawn(context, Arc::new(NoEvents));
//! scheduler.set_render_state(RenderState::Started);
//!
//! // Producer loop: recycle a slot when one is spare, fill it, enqueue.
//! let generation = scheduler.current_generation();
//! scheduler.enqueue(Frame::new(image, Some(pts), duration, generation));
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod frame;
pub mod frame_queue;
pub mod metrics;
pub mod moderate;
pub mod rate_detect;
pub mod refresh;
pub mod ring;
pub mod scheduler;

pub use clock::ClockModerator;
pub use config::PresentConfig;
pub use context::PresentationContext;
pub use frame::{
    ClockSample, Frame, Generation, HostClock, PresentError, PresentationBackend, ReferenceClock,
    RunState, SystemClock,
};
pub use frame_queue::FrameQueue;
pub use metrics::{PresentMetrics, PresentMetricsSnapshot};
pub use rate_detect::FrameRateDetector;
pub use refresh::{RefreshTracker, VSyncEstimate};
pub use scheduler::{NoEvents, PresentEvents, PresentScheduler, RenderState};
