//! Presentation metrics and diagnostics.
//!
//! Lock-free counters updated from the scheduler and producer threads, with
//! a consistent-enough `snapshot()` for UIs, logs, and tests. None of this
//! feeds back into scheduling decisions.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Thread-safe presentation metrics tracker.
#[derive(Clone, Default)]
pub struct PresentMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    /// Frames handed to the backend.
    frames_drawn: AtomicU64,
    /// Frames discarded because playback had fallen too far behind.
    frames_dropped: AtomicU64,
    /// Frames whose timestamps were rewritten by the rate detector.
    frames_corrected: AtomicU64,
    /// Frames discarded for carrying a stale generation.
    stale_discards: AtomicU64,
    /// Times the starvation condition was entered.
    starvation_events: AtomicU64,
    /// Present calls that returned an error.
    present_failures: AtomicU64,
    /// Whether the scheduler currently judges itself starved.
    starved: AtomicBool,
    /// Jitter standard deviation from the rate detector, microseconds.
    jitter_stddev_us: AtomicU64,
    /// Locked source rate in millihertz; 0 when unlocked.
    locked_rate_mhz: AtomicU64,
    /// Smoothed refresh period in nanoseconds; 0 until valid.
    refresh_period_ns: AtomicU64,
    /// Clock speed estimate in parts-per-million relative to 1.0.
    clock_speed_ppm: AtomicI64,
    /// Last presented timestamp in microseconds; -1 when invalid.
    last_pts_us: AtomicI64,
}

impl PresentMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        metrics.inner.last_pts_us.store(-1, Ordering::Release);
        metrics
    }

    pub fn record_drawn(&self, pts: Option<Duration>) {
        self.inner.frames_drawn.fetch_add(1, Ordering::AcqRel);
        let us = pts.map(|p| p.as_micros() as i64).unwrap_or(-1);
        self.inner.last_pts_us.store(us, Ordering::Release);
    }

    pub fn record_dropped(&self) {
        self.inner.frames_dropped.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_corrected(&self) {
        self.inner.frames_corrected.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_stale_discard(&self) {
        self.inner.stale_discards.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_present_failure(&self) {
        self.inner.present_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_starved(&self, starved: bool) {
        let was = self.inner.starved.swap(starved, Ordering::AcqRel);
        if starved && !was {
            self.inner.starvation_events.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn set_jitter_stddev(&self, stddev: Duration) {
        self.inner
            .jitter_stddev_us
            .store(stddev.as_micros() as u64, Ordering::Release);
    }

    pub fn set_locked_rate(&self, rate_hz: Option<f64>) {
        let mhz = rate_hz.map(|r| (r * 1000.0).round() as u64).unwrap_or(0);
        self.inner.locked_rate_mhz.store(mhz, Ordering::Release);
    }

    pub fn set_refresh_period(&self, period: Option<Duration>) {
        let ns = period.map(|p| p.as_nanos() as u64).unwrap_or(0);
        self.inner.refresh_period_ns.store(ns, Ordering::Release);
    }

    pub fn set_clock_speed(&self, speed: f64) {
        let ppm = ((speed - 1.0) * 1e6).round() as i64;
        self.inner.clock_speed_ppm.store(ppm, Ordering::Release);
    }

    /// Clears the last-presented timestamp (flush).
    pub fn invalidate_last_pts(&self) {
        self.inner.last_pts_us.store(-1, Ordering::Release);
    }

    pub fn last_presented_pts(&self) -> Option<Duration> {
        let us = self.inner.last_pts_us.load(Ordering::Acquire);
        (us >= 0).then(|| Duration::from_micros(us as u64))
    }

    /// Takes a point-in-time copy of all counters.
    pub fn snapshot(&self) -> PresentMetricsSnapshot {
        let inner = &self.inner;
        let locked_mhz = inner.locked_rate_mhz.load(Ordering::Acquire);
        let refresh_ns = inner.refresh_period_ns.load(Ordering::Acquire);
        PresentMetricsSnapshot {
            frames_drawn: inner.frames_drawn.load(Ordering::Acquire),
            frames_dropped: inner.frames_dropped.load(Ordering::Acquire),
            frames_corrected: inner.frames_corrected.load(Ordering::Acquire),
            stale_discards: inner.stale_discards.load(Ordering::Acquire),
            starvation_events: inner.starvation_events.load(Ordering::Acquire),
            present_failures: inner.present_failures.load(Ordering::Acquire),
            starved: inner.starved.load(Ordering::Acquire),
            jitter_stddev: Duration::from_micros(inner.jitter_stddev_us.load(Ordering::Acquire)),
            locked_rate_hz: (locked_mhz > 0).then(|| locked_mhz as f64 / 1000.0),
            refresh_period: (refresh_ns > 0).then(|| Duration::from_nanos(refresh_ns)),
            clock_speed: 1.0 + inner.clock_speed_ppm.load(Ordering::Acquire) as f64 / 1e6,
            last_presented_pts: self.last_presented_pts(),
        }
    }
}

/// Point-in-time copy of [`PresentMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct PresentMetricsSnapshot {
    pub frames_drawn: u64,
    pub frames_dropped: u64,
    pub frames_corrected: u64,
    pub stale_discards: u64,
    pub starvation_events: u64,
    pub present_failures: u64,
    pub starved: bool,
    pub jitter_stddev: Duration,
    pub locked_rate_hz: Option<f64>,
    pub refresh_period: Option<Duration>,
    pub clock_speed: f64,
    pub last_presented_pts: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PresentMetrics::new();
        metrics.record_drawn(Some(Duration::from_millis(40)));
        metrics.record_drawn(Some(Duration::from_millis(80)));
        metrics.record_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_drawn, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.last_presented_pts, Some(Duration::from_millis(80)));
    }

    #[test]
    fn test_starvation_is_edge_counted() {
        let metrics = PresentMetrics::new();
        metrics.set_starved(true);
        metrics.set_starved(true); // still the same episode
        metrics.set_starved(false);
        metrics.set_starved(true); // second episode

        let snap = metrics.snapshot();
        assert_eq!(snap.starvation_events, 2);
        assert!(snap.starved);
    }

    #[test]
    fn test_last_pts_invalidation() {
        let metrics = PresentMetrics::new();
        assert_eq!(metrics.last_presented_pts(), None);

        metrics.record_drawn(Some(Duration::from_millis(40)));
        assert!(metrics.last_presented_pts().is_some());

        metrics.invalidate_last_pts();
        assert_eq!(metrics.last_presented_pts(), None);
    }

    #[test]
    fn test_gauges_round_trip() {
        let metrics = PresentMetrics::new();
        metrics.set_locked_rate(Some(23.976));
        metrics.set_refresh_period(Some(Duration::from_nanos(16_666_667)));
        metrics.set_clock_speed(1.0003);

        let snap = metrics.snapshot();
        assert_eq!(snap.locked_rate_hz, Some(23.976));
        assert_eq!(snap.refresh_period, Some(Duration::from_nanos(16_666_667)));
        assert!((snap.clock_speed - 1.0003).abs() < 1e-9);
    }
}
