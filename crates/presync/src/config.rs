//! Tunable configuration for the presentation pipeline.

use std::time::Duration;

/// Configuration for [`PresentScheduler`](crate::scheduler::PresentScheduler).
///
/// Defaults match the hand-tuned behavior of the original timing code; none
/// of the cadence constants have a derivation, so they are all plain fields
/// for embedders to retune.
#[derive(Debug, Clone)]
pub struct PresentConfig {
    /// Rewrite jittery timestamps to the locked cadence (§jitter correction).
    pub correction_enabled: bool,
    /// Present this many lines before (+) or after (-) the vblank boundary.
    pub vblank_offset_lines: i32,
    /// Absolute floor of the present-now margin.
    pub margin_floor: Duration,
    /// Cap on the jitter contribution to the margin.
    pub margin_jitter_cap: Duration,
    /// Margin lower bound as a fraction of the frame period.
    pub margin_min_fraction: f64,
    /// Margin upper bound as a fraction of the frame period.
    pub margin_max_fraction: f64,
    /// Playback-behind threshold that marks the scheduler starved.
    pub starvation_behind: Duration,
    /// Scheduled depth at which a starvation condition clears.
    pub starvation_recover_depth: usize,
    /// Vsync-relative offsets tracked for cadence-shift detection.
    pub cadence_history: usize,
    /// Fraction of the period counted as "near an edge".
    pub cadence_edge_fraction: f64,
    /// Consecutive edge offsets before shifting the window.
    pub cadence_shift_threshold: u32,
    /// Consecutive centered offsets before returning to neutral.
    pub cadence_return_threshold: u32,
    /// Upper bound on any single scheduler wait.
    pub max_tick_wait: Duration,
    /// How long shutdown waits for background threads before detaching.
    pub shutdown_timeout: Duration,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            correction_enabled: true,
            vblank_offset_lines: 0,
            margin_floor: Duration::from_micros(1500),
            margin_jitter_cap: Duration::from_millis(2),
            margin_min_fraction: 0.02,
            margin_max_fraction: 0.11,
            starvation_behind: Duration::from_secs(1),
            starvation_recover_depth: 2,
            cadence_history: 5,
            cadence_edge_fraction: 0.25,
            cadence_shift_threshold: 3,
            cadence_return_threshold: 2,
            max_tick_wait: Duration::from_millis(10),
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}

impl PresentConfig {
    /// Disables per-frame timestamp correction.
    pub fn without_correction(mut self) -> Self {
        self.correction_enabled = false;
        self
    }

    /// Sets the vblank line offset for presentation.
    pub fn with_vblank_offset_lines(mut self, lines: i32) -> Self {
        self.vblank_offset_lines = lines;
        self
    }

    /// Sets the starvation threshold.
    pub fn with_starvation_behind(mut self, behind: Duration) -> Self {
        self.starvation_behind = behind;
        self
    }
}
