//! Source frame-rate detection and timestamp jitter correction.
//!
//! Decoder timestamps are noisy: container timebases round, demuxers batch,
//! and upstream filters add jitter. This module watches the stream of
//! incoming timestamps, estimates the true source rate from a window of
//! inter-frame deltas, snaps the estimate to the nearest standard
//! broadcast/cinema rate, and declares a lock once one rate dominates the
//! vote history. While locked it can optionally rewrite timestamps that
//! stray from the predicted cadence, so the scheduler paces against clean
//! timestamps instead of chasing jitter.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::ring::RingBuffer;

/// Inter-frame deltas kept for the mean/stddev estimate.
const DELTA_WINDOW: usize = 60;
/// Deltas required before a rate is derived at all.
const MIN_DELTA_SAMPLES: usize = 10;
/// Per-sample rate votes kept for the mode.
const VOTE_WINDOW: usize = 500;
/// Occurrences of one rate required to declare a lock.
const LOCK_VOTES: usize = 5;
/// A delta beyond this many nominal periods is treated as a seek.
const SEEK_RESET_FACTOR: f64 = 8.0;
/// Relative error within which an estimate snaps to a standard rate.
const SNAP_TOLERANCE: f64 = 0.0003;
/// Deviation from the predicted timestamp that triggers correction.
const CORRECTION_THRESHOLD_SECS: f64 = 0.0015;

/// Standard broadcast and cinema rates, in Hz.
const STANDARD_RATES: [f64; 10] = [
    60.0, 59.94, 50.0, 48.0, 47.952, 30.0, 29.97, 25.0, 24.0, 23.976,
];

/// Outcome of observing one frame timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateObservation {
    /// Replacement (pts, duration) when the sample was rewritten to the
    /// predicted cadence; the caller applies it and marks the frame.
    pub corrected: Option<(Duration, Duration)>,
}

struct DetectorState {
    deltas: RingBuffer<f64>,
    votes: RingBuffer<f64>,
    last_pts: Option<f64>,
    last_corrected_pts: Option<f64>,
    detected_rate: Option<f64>,
    locked: bool,
    locked_rate: f64,
}

impl DetectorState {
    fn reset(&mut self) {
        self.deltas.clear();
        self.votes.clear();
        self.last_corrected_pts = None;
        self.detected_rate = None;
        self.locked = false;
        self.locked_rate = 0.0;
    }

    /// Best current guess at the frame period, in seconds.
    fn nominal_period(&self, declared_duration: Duration) -> f64 {
        if self.locked {
            return 1.0 / self.locked_rate;
        }
        if self.deltas.len() >= MIN_DELTA_SAMPLES {
            return self.deltas.mean();
        }
        let declared = declared_duration.as_secs_f64();
        if declared > 0.0 {
            declared
        } else {
            1.0 / 60.0
        }
    }
}

/// Frame-rate lock detector; shared between the producer path (observing
/// timestamps on enqueue) and the scheduler (reading the locked rate).
pub struct FrameRateDetector {
    state: Mutex<DetectorState>,
    correction_enabled: bool,
}

impl FrameRateDetector {
    pub fn new(correction_enabled: bool) -> Self {
        Self {
            state: Mutex::new(DetectorState {
                deltas: RingBuffer::new(DELTA_WINDOW),
                votes: RingBuffer::new(VOTE_WINDOW),
                last_pts: None,
                last_corrected_pts: None,
                detected_rate: None,
                locked: false,
                locked_rate: 0.0,
            }),
            correction_enabled,
        }
    }

    /// Feeds one frame timestamp through the detector.
    ///
    /// `declared_duration` is the decoder's own frame duration, used as the
    /// nominal period until enough deltas have accumulated.
    pub fn observe(&self, pts: Option<Duration>, declared_duration: Duration) -> RateObservation {
        let Some(pts) = pts else {
            // Timestampless frames carry no rate information.
            return RateObservation::default();
        };
        let t = pts.as_secs_f64();
        let mut state = self.state.lock();

        let Some(last) = state.last_pts else {
            state.last_pts = Some(t);
            return RateObservation::default();
        };

        let delta = t - last;
        let nominal = state.nominal_period(declared_duration);
        if delta.abs() > SEEK_RESET_FACTOR * nominal {
            tracing::debug!(
                "FrameRateDetector: discontinuity of {:.1} periods, resetting",
                delta.abs() / nominal
            );
            state.reset();
            state.last_pts = Some(t);
            return RateObservation::default();
        }
        state.last_pts = Some(t);
        if delta <= 0.0 {
            // Out-of-order or duplicate timestamp; not a usable sample.
            return RateObservation::default();
        }

        state.deltas.push(delta);
        if state.deltas.len() >= MIN_DELTA_SAMPLES {
            let mean = state.deltas.mean();
            let detected = 1.0 / mean;
            state.detected_rate = Some(detected);

            let vote = snap_to_standard(detected).unwrap_or(detected);
            state.votes.push(vote);

            if let Some((mode, count)) = vote_mode(&state.votes) {
                if count >= LOCK_VOTES && snap_to_standard(mode).is_some() {
                    if !state.locked {
                        tracing::info!("FrameRateDetector: locked at {:.3} Hz", mode);
                    }
                    state.locked = true;
                    state.locked_rate = mode;
                }
            }
        }

        if state.locked && self.correction_enabled {
            let frame_secs = 1.0 / state.locked_rate;
            match state.last_corrected_pts {
                None => {
                    state.last_corrected_pts = Some(t);
                }
                Some(prev) => {
                    let predicted = prev + frame_secs;
                    if (t - predicted).abs() > CORRECTION_THRESHOLD_SECS {
                        state.last_corrected_pts = Some(predicted);
                        return RateObservation {
                            corrected: Some((
                                Duration::from_secs_f64(predicted.max(0.0)),
                                Duration::from_secs_f64(frame_secs),
                            )),
                        };
                    }
                    state.last_corrected_pts = Some(t);
                }
            }
        }

        RateObservation::default()
    }

    /// The locked rate in Hz, once the vote threshold has been met.
    pub fn locked_rate(&self) -> Option<f64> {
        let state = self.state.lock();
        state.locked.then_some(state.locked_rate)
    }

    /// Frame period derived from the locked rate.
    pub fn frame_period(&self) -> Option<Duration> {
        self.locked_rate()
            .map(|rate| Duration::from_secs_f64(1.0 / rate))
    }

    /// Latest raw rate estimate (before snapping), if enough samples exist.
    pub fn detected_rate(&self) -> Option<f64> {
        self.state.lock().detected_rate
    }

    /// Standard deviation of the recent inter-frame deltas.
    pub fn jitter_stddev(&self) -> Duration {
        Duration::from_secs_f64(self.state.lock().deltas.stddev())
    }

    /// Clears all history and the lock (used by flush).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.reset();
        state.last_pts = None;
    }
}

/// Snaps a rate to the nearest standard rate within tolerance.
fn snap_to_standard(rate: f64) -> Option<f64> {
    STANDARD_RATES
        .iter()
        .copied()
        .find(|standard| ((rate - standard) / standard).abs() < SNAP_TOLERANCE)
}

/// Most frequent vote (bucketed to millihertz) and its count.
fn vote_mode(votes: &RingBuffer<f64>) -> Option<(f64, usize)> {
    let mut counts: HashMap<i64, (f64, usize)> = HashMap::new();
    for &vote in votes.iter() {
        let bucket = (vote * 1000.0).round() as i64;
        let entry = counts.entry(bucket).or_insert((vote, 0));
        entry.1 += 1;
    }
    counts.into_values().max_by_key(|&(_, count)| count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILM_RATE: f64 = 23.976;

    fn feed_periodic(detector: &FrameRateDetector, rate: f64, frames: usize, start: f64) -> f64 {
        let period = 1.0 / rate;
        let mut t = start;
        for _ in 0..frames {
            detector.observe(
                Some(Duration::from_secs_f64(t)),
                Duration::from_secs_f64(period),
            );
            t += period;
        }
        t
    }

    #[test]
    fn test_locks_on_film_rate() {
        let detector = FrameRateDetector::new(false);
        feed_periodic(&detector, FILM_RATE, 80, 0.0);

        let locked = detector.locked_rate().expect("should lock after 80 frames");
        assert!((locked - FILM_RATE).abs() < 1e-9);
    }

    #[test]
    fn test_no_rate_before_min_samples() {
        let detector = FrameRateDetector::new(false);
        feed_periodic(&detector, 25.0, 5, 0.0);
        assert!(detector.detected_rate().is_none());
        assert!(detector.locked_rate().is_none());
    }

    #[test]
    fn test_snaps_slightly_off_estimate() {
        // 24.001 Hz is within 0.03% of 24; the votes should all be 24.0.
        let detector = FrameRateDetector::new(false);
        feed_periodic(&detector, 24.001, 80, 0.0);
        assert_eq!(detector.locked_rate(), Some(24.0));
    }

    #[test]
    fn test_five_period_outlier_keeps_lock() {
        let detector = FrameRateDetector::new(false);
        let t = feed_periodic(&detector, FILM_RATE, 70, 0.0);
        assert!(detector.locked_rate().is_some());

        // One gap of 5x the period: below the seek threshold, so the lock
        // must survive.
        let period = 1.0 / FILM_RATE;
        let after_gap = t + 5.0 * period;
        detector.observe(
            Some(Duration::from_secs_f64(after_gap)),
            Duration::from_secs_f64(period),
        );
        feed_periodic(&detector, FILM_RATE, 20, after_gap + period);

        assert_eq!(detector.locked_rate(), Some(FILM_RATE));
    }

    #[test]
    fn test_seek_sized_jump_resets() {
        let detector = FrameRateDetector::new(false);
        let t = feed_periodic(&detector, FILM_RATE, 70, 0.0);
        assert!(detector.locked_rate().is_some());

        let period = 1.0 / FILM_RATE;
        detector.observe(
            Some(Duration::from_secs_f64(t + 20.0 * period)),
            Duration::from_secs_f64(period),
        );
        assert!(detector.locked_rate().is_none());
        assert!(detector.detected_rate().is_none());
    }

    #[test]
    fn test_correction_rewrites_jittered_timestamp() {
        let detector = FrameRateDetector::new(true);
        let t = feed_periodic(&detector, 25.0, 80, 0.0);
        assert_eq!(detector.locked_rate(), Some(25.0));

        // 5ms of jitter on the next timestamp; prediction should win. The
        // predicted timestamp continues the cadence from the last frame, so
        // the next slot is exactly `t`.
        let jittered = t + 0.005;
        let obs = detector.observe(
            Some(Duration::from_secs_f64(jittered)),
            Duration::from_millis(40),
        );
        let (pts, duration) = obs.corrected.expect("sample should be corrected");
        assert!((pts.as_secs_f64() - t).abs() < 1e-6);
        assert!((duration.as_secs_f64() - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_small_jitter_passes_through() {
        let detector = FrameRateDetector::new(true);
        let t = feed_periodic(&detector, 25.0, 80, 0.0);

        // 1ms of jitter is inside the correction threshold.
        let obs = detector.observe(
            Some(Duration::from_secs_f64(t + 0.001)),
            Duration::from_millis(40),
        );
        assert!(obs.corrected.is_none());
    }

    #[test]
    fn test_jitter_stddev_reflects_noise() {
        let detector = FrameRateDetector::new(false);
        let mut t = 0.0;
        for i in 0..60 {
            let jitter = if i % 2 == 0 { 0.002 } else { -0.002 };
            detector.observe(
                Some(Duration::from_secs_f64(t)),
                Duration::from_millis(40),
            );
            t += 0.04 + jitter;
        }
        assert!(detector.jitter_stddev() > Duration::from_micros(500));
    }
}
