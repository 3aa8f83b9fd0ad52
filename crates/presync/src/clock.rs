//! Clock moderator: drift-corrected extrapolation of the reference clock.
//!
//! The reference playback clock is authoritative but may be expensive to
//! query and only ticks at its own cadence; the host counter is cheap and
//! fine-grained but runs at a slightly different rate on real hardware. The
//! moderator reconciles the two: every sample extrapolates the last reference
//! reading along the host counter, scaled by a smoothed estimate of the
//! reference/host speed ratio (nominal 1.0).
//!
//! The speed estimate is only re-derived every [`OBSERVATION_WINDOW`] samples
//! from elapsed reference time vs. elapsed host time over a lagged window, so
//! a single noisy reference reading cannot jerk the extrapolation. Adoption
//! of a new target goes through the critically-damped [`Moderator`] with an
//! adaptive change rate: stiff while far from the target (fast recovery after
//! a discontinuity), soft once close (no oscillation in steady state).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::frame::{HostClock, ReferenceClock, RunState};
use crate::moderate::Moderator;
use crate::ring::RingBuffer;

/// Samples between speed re-derivations.
const OBSERVATION_WINDOW: u64 = 100;
/// Window boundaries kept for the lagged elapsed-time comparison.
const HISTORY_WINDOWS: usize = 8;
/// Change rate while the estimate is far from the target.
const CHANGE_RATE_FAR: f64 = 0.1;
/// Change rate once the estimate is close.
const CHANGE_RATE_NEAR: f64 = 0.01;
/// Distance from target at which the change rate switches.
const FAR_THRESHOLD: f64 = 0.01;

struct ClockState {
    initialized: bool,
    last_run_state: RunState,
    speed: Moderator,
    observations: u64,
    /// (reference ns, host ns) pairs captured at window boundaries.
    history: RingBuffer<(i64, i64)>,
}

/// Produces a smoothed "what does the reference clock read right now".
pub struct ClockModerator {
    reference: Arc<dyn ReferenceClock>,
    host: Arc<dyn HostClock>,
    state: Mutex<ClockState>,
}

impl ClockModerator {
    pub fn new(reference: Arc<dyn ReferenceClock>, host: Arc<dyn HostClock>) -> Self {
        Self {
            reference,
            host,
            state: Mutex::new(ClockState {
                initialized: false,
                last_run_state: RunState::Stopped,
                speed: Moderator::new(1.0),
                observations: 0,
                history: RingBuffer::new(HISTORY_WINDOWS),
            }),
        }
    }

    /// Samples the moderated time at the current host counter.
    pub fn sample(&self) -> Option<Duration> {
        self.sample_at(self.host.counter())
    }

    /// Samples the moderated time at an explicit host counter value.
    ///
    /// Returns `None` when the reference clock is unavailable.
    pub fn sample_at(&self, host_counter_now: i64) -> Option<Duration> {
        let sample = self.reference.query()?;

        let freq = self.host.frequency() as f64;
        let to_ns = |counter: i64| (counter as f64 / freq * 1e9) as i64;
        let ref_ns = sample.time.as_nanos() as i64;
        let host_ns_at_query = to_ns(sample.host_counter);
        let host_ns_now = to_ns(host_counter_now);

        let mut state = self.state.lock();

        if !state.initialized || state.last_run_state != sample.state {
            // Discontinuity (first sample, seek, pause/resume): drop the
            // accumulated speed estimate and start over from nominal.
            state.speed.reset(1.0);
            state.history.clear();
            state.observations = 0;
            state.initialized = true;
            state.last_run_state = sample.state;
            state.history.push((ref_ns, host_ns_at_query));
            tracing::debug!("ClockModerator: discontinuity reset ({:?})", sample.state);
        } else {
            state.observations += 1;
            if state.observations % OBSERVATION_WINDOW == 0 {
                if let Some(&(old_ref, old_host)) = state.history.oldest() {
                    let elapsed_ref = (ref_ns - old_ref) as f64;
                    let elapsed_host = (host_ns_at_query - old_host) as f64;
                    if elapsed_ref > 0.0 && elapsed_host > 0.0 {
                        let target = elapsed_ref / elapsed_host;
                        // A wildly implausible ratio means the reference
                        // jumped without a state change; skip the sample.
                        if (0.5..=2.0).contains(&target) {
                            let rate = if (state.speed.value() - target).abs() > FAR_THRESHOLD {
                                CHANGE_RATE_FAR
                            } else {
                                CHANGE_RATE_NEAR
                            };
                            let speed = state.speed.step(target, rate);
                            tracing::trace!(
                                "ClockModerator: speed={:.6} target={:.6}",
                                speed,
                                target
                            );
                        }
                    }
                }
                state.history.push((ref_ns, host_ns_at_query));
            }
        }

        let target_ns =
            ref_ns as f64 + (host_ns_now - host_ns_at_query) as f64 * state.speed.value();
        Some(Duration::from_nanos(target_ns.max(0.0) as u64))
    }

    /// Current smoothed reference/host speed ratio.
    pub fn speed(&self) -> f64 {
        self.state.lock().speed.value()
    }

    /// Forces a discontinuity reset before the next sample.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.initialized = false;
        state.speed.reset(1.0);
        state.history.clear();
        state.observations = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ClockSample;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Host counter driven manually by the test.
    struct ManualHost {
        counter: AtomicI64,
    }

    impl HostClock for ManualHost {
        fn counter(&self) -> i64 {
            self.counter.load(Ordering::Acquire)
        }
        fn frequency(&self) -> i64 {
            1_000_000_000
        }
    }

    /// Reference clock running at a fixed ratio of the host counter.
    struct ScaledReference {
        host: Arc<ManualHost>,
        ratio: f64,
        state: RunState,
    }

    impl ReferenceClock for ScaledReference {
        fn query(&self) -> Option<ClockSample> {
            let counter = self.host.counter();
            Some(ClockSample {
                time: Duration::from_nanos((counter as f64 * self.ratio) as u64),
                host_counter: counter,
                state: self.state,
            })
        }
    }

    struct NoReference;

    impl ReferenceClock for NoReference {
        fn query(&self) -> Option<ClockSample> {
            None
        }
    }

    fn run_ratio(ratio: f64, iterations: usize) -> (ClockModerator, Arc<ManualHost>) {
        let host = Arc::new(ManualHost {
            counter: AtomicI64::new(0),
        });
        let reference = Arc::new(ScaledReference {
            host: Arc::clone(&host),
            ratio,
            state: RunState::Running,
        });
        let moderator = ClockModerator::new(reference, Arc::clone(&host) as Arc<dyn HostClock>);

        for _ in 0..iterations {
            host.counter.fetch_add(1_000_000, Ordering::AcqRel); // 1ms of host time
            let now = host.counter.load(Ordering::Acquire);
            moderator.sample_at(now);
        }
        (moderator, host)
    }

    #[test]
    fn test_unavailable_reference_returns_none() {
        let host = Arc::new(ManualHost {
            counter: AtomicI64::new(0),
        });
        let moderator = ClockModerator::new(Arc::new(NoReference), host);
        assert!(moderator.sample_at(123).is_none());
    }

    #[test]
    fn test_nominal_ratio_stays_at_unity() {
        let (moderator, _) = run_ratio(1.0, 5_000);
        assert!((moderator.speed() - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_speed_converges_to_fast_reference() {
        // Reference runs 3% fast relative to the host counter.
        let (moderator, _) = run_ratio(1.03, 40_000);
        assert!(
            (moderator.speed() - 1.03).abs() < 0.01,
            "speed={}",
            moderator.speed()
        );
    }

    #[test]
    fn test_speed_converges_to_slow_reference() {
        let (moderator, _) = run_ratio(0.97, 40_000);
        assert!(
            (moderator.speed() - 0.97).abs() < 0.01,
            "speed={}",
            moderator.speed()
        );
    }

    #[test]
    fn test_no_overshoot_past_ten_percent() {
        let host = Arc::new(ManualHost {
            counter: AtomicI64::new(0),
        });
        let reference = Arc::new(ScaledReference {
            host: Arc::clone(&host),
            ratio: 1.05,
            state: RunState::Running,
        });
        let moderator = ClockModerator::new(reference, Arc::clone(&host) as Arc<dyn HostClock>);

        let mut max_speed = 1.0f64;
        for _ in 0..60_000 {
            host.counter.fetch_add(1_000_000, Ordering::AcqRel);
            let now = host.counter.load(Ordering::Acquire);
            moderator.sample_at(now);
            max_speed = max_speed.max(moderator.speed());
        }
        // Target excess is 0.05; an extra 10% of that would be 1.055.
        assert!(max_speed < 1.055, "max speed {max_speed}");
    }

    #[test]
    fn test_moderated_time_tracks_reference() {
        let (moderator, host) = run_ratio(1.0, 1_000);
        let now = host.counter.load(Ordering::Acquire);
        let sampled = moderator.sample_at(now).unwrap();
        let expected = Duration::from_nanos(now as u64);
        let diff = if sampled > expected {
            sampled - expected
        } else {
            expected - sampled
        };
        assert!(diff < Duration::from_micros(10), "diff={diff:?}");
    }

    #[test]
    fn test_reset_restores_nominal_speed() {
        let (moderator, _) = run_ratio(1.03, 40_000);
        assert!((moderator.speed() - 1.03).abs() < 0.01);
        moderator.reset();
        assert_eq!(moderator.speed(), 1.0);
    }
}
