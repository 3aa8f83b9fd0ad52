//! Free/scheduled frame queue shared by producer and scheduler.
//!
//! Decoded frames circulate between two lists: a free list of reusable frame
//! slots and a scheduled list of frames awaiting presentation. The producer
//! acquires a free frame, fills it, and schedules it; the scheduler consumes
//! scheduled frames and returns them to the free list after presenting or
//! dropping them. A frame is a member of at most one list at any time.
//!
//! Both lists sit behind a single lock, held only for the list mutation
//! itself - never across a present call or any other blocking operation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::frame::{Frame, Generation};

struct QueueInner<I> {
    free: VecDeque<Frame<I>>,
    scheduled: VecDeque<Frame<I>>,
}

/// Thread-safe double queue of [`Frame`]s.
pub struct FrameQueue<I> {
    inner: Mutex<QueueInner<I>>,
    /// Signaled when a frame lands on the scheduled list.
    frame_available: Condvar,
    /// Current device/stream epoch; frames tagged with an older generation
    /// are discarded by their owner when they resurface.
    generation: AtomicU64,
    /// Frames handed out by `acquire_free` and not yet released back.
    in_flight: AtomicUsize,
    /// End of stream: the producer will schedule no further frames.
    eos: AtomicBool,
}

impl<I> FrameQueue<I> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                free: VecDeque::new(),
                scheduled: VecDeque::new(),
            }),
            frame_available: Condvar::new(),
            generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            eos: AtomicBool::new(false),
        }
    }

    /// Takes the oldest frame from the free list for reuse.
    ///
    /// Returns `None` unless at least two free frames remain: the most
    /// recently released frame may still be on-screen and must not be handed
    /// out while it is the only spare.
    pub fn acquire_free(&self) -> Option<Frame<I>> {
        let mut inner = self.inner.lock();
        if inner.free.len() < 2 {
            return None;
        }
        let frame = inner.free.pop_front();
        if frame.is_some() {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        frame
    }

    /// Returns a frame to the free list.
    ///
    /// `at_tail` is the normal path after a present or drop; `false` inserts
    /// at the front and is used during flush recovery so the slot is reused
    /// before frames that may still be referenced by the display.
    pub fn release_to_free(&self, frame: Frame<I>, at_tail: bool) {
        let mut inner = self.inner.lock();
        if at_tail {
            inner.free.push_back(frame);
        } else {
            inner.free.push_front(frame);
        }
        // Saturating: frames created by the producer (rather than acquired
        // here) also come home through this path.
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    /// Appends a frame to the scheduled list, preserving arrival order.
    pub fn schedule_back(&self, frame: Frame<I>) {
        let mut inner = self.inner.lock();
        inner.scheduled.push_back(frame);
        self.frame_available.notify_one();
    }

    /// Re-inserts a frame at the front of the scheduled list.
    ///
    /// Only used when a present attempt is retried (delay decision) so FIFO
    /// order is preserved for everything behind it.
    pub fn schedule_front(&self, frame: Frame<I>) {
        let mut inner = self.inner.lock();
        inner.scheduled.push_front(frame);
        self.frame_available.notify_one();
    }

    /// Removes and returns the next scheduled frame plus the number of frames
    /// still queued behind it.
    pub fn take_next_scheduled(&self) -> Option<(Frame<I>, usize)> {
        let mut inner = self.inner.lock();
        let frame = inner.scheduled.pop_front()?;
        Some((frame, inner.scheduled.len()))
    }

    /// Like [`take_next_scheduled`](Self::take_next_scheduled) but waits up
    /// to `timeout` for a frame to arrive.
    pub fn take_next_scheduled_timeout(&self, timeout: Duration) -> Option<(Frame<I>, usize)> {
        let mut inner = self.inner.lock();
        if inner.scheduled.is_empty() {
            let result = self.frame_available.wait_for(&mut inner, timeout);
            if result.timed_out() && inner.scheduled.is_empty() {
                return None;
            }
        }
        let frame = inner.scheduled.pop_front()?;
        Some((frame, inner.scheduled.len()))
    }

    /// Clears both lists under one lock and resets position bookkeeping.
    ///
    /// Frame payloads are dropped here; handles the embedder still references
    /// elsewhere (e.g. an image mid-present) survive through their own
    /// ownership and are not torn down by the queue.
    pub fn flush(&self) {
        let (free_n, sched_n) = {
            let mut inner = self.inner.lock();
            let counts = (inner.free.len(), inner.scheduled.len());
            inner.free.clear();
            inner.scheduled.clear();
            counts
        };
        self.eos.store(false, Ordering::Release);
        tracing::debug!(
            "FrameQueue::flush: dropped {} free, {} scheduled",
            free_n,
            sched_n
        );
        // Wake the consumer so it re-evaluates instead of sleeping out its
        // wait on a queue that just changed under it.
        self.frame_available.notify_all();
    }

    /// Starts a new device/stream epoch and returns it.
    pub fn bump_generation(&self) -> Generation {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("FrameQueue: generation bumped to {}", next);
        Generation(next)
    }

    pub fn current_generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::Acquire))
    }

    /// True if the frame belongs to an earlier epoch and must be discarded.
    pub fn is_stale(&self, frame: &Frame<I>) -> bool {
        frame.generation != self.current_generation()
    }

    pub fn scheduled_len(&self) -> usize {
        self.inner.lock().scheduled.len()
    }

    pub fn free_len(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Marks that the producer will schedule no further frames.
    pub fn set_eos(&self) {
        self.eos.store(true, Ordering::Release);
        self.frame_available.notify_all();
    }

    pub fn clear_eos(&self) {
        self.eos.store(false, Ordering::Release);
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }
}

impl<I> Default for FrameQueue<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(pts_ms: u64, generation: Generation) -> Frame<u32> {
        Frame::new(
            pts_ms as u32,
            Some(Duration::from_millis(pts_ms)),
            Duration::from_millis(40),
            generation,
        )
    }

    #[test]
    fn test_scheduled_order_is_fifo() {
        let queue = FrameQueue::new();
        let gen = queue.current_generation();
        for pts in [0, 40, 80, 120] {
            queue.schedule_back(make_frame(pts, gen));
        }

        let mut out = Vec::new();
        while let Some((frame, _)) = queue.take_next_scheduled() {
            out.push(frame.pts.unwrap());
        }
        let expected: Vec<Duration> = [0u64, 40, 80, 120]
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_schedule_front_goes_first() {
        let queue = FrameQueue::new();
        let gen = queue.current_generation();
        queue.schedule_back(make_frame(40, gen));
        queue.schedule_front(make_frame(0, gen));

        let (frame, remaining) = queue.take_next_scheduled().unwrap();
        assert_eq!(frame.pts, Some(Duration::from_millis(0)));
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_acquire_free_requires_two_spares() {
        let queue = FrameQueue::new();
        let gen = queue.current_generation();

        queue.release_to_free(make_frame(0, gen), true);
        assert!(queue.acquire_free().is_none(), "single spare must be held");

        queue.release_to_free(make_frame(40, gen), true);
        let frame = queue.acquire_free().expect("two spares available");
        // Oldest released slot comes back first; the newest (possibly still
        // on-screen) stays.
        assert_eq!(frame.pts, Some(Duration::from_millis(0)));
        assert!(queue.acquire_free().is_none());
        assert_eq!(queue.in_flight(), 1);
    }

    #[test]
    fn test_release_at_front() {
        let queue = FrameQueue::new();
        let gen = queue.current_generation();
        queue.release_to_free(make_frame(0, gen), true);
        queue.release_to_free(make_frame(40, gen), true);
        queue.release_to_free(make_frame(80, gen), false);

        let frame = queue.acquire_free().unwrap();
        assert_eq!(frame.pts, Some(Duration::from_millis(80)));
    }

    #[test]
    fn test_flush_clears_both_lists() {
        let queue = FrameQueue::new();
        let gen = queue.current_generation();
        queue.release_to_free(make_frame(0, gen), true);
        queue.schedule_back(make_frame(40, gen));
        queue.set_eos();

        queue.flush();

        assert_eq!(queue.free_len(), 0);
        assert_eq!(queue.scheduled_len(), 0);
        assert!(!queue.is_eos());
        assert!(queue.take_next_scheduled().is_none());
    }

    #[test]
    fn test_generation_staleness() {
        let queue = FrameQueue::new();
        let old = queue.current_generation();
        let frame = make_frame(0, old);

        let new = queue.bump_generation();
        assert_ne!(old, new);
        assert!(queue.is_stale(&frame));
        assert!(!queue.is_stale(&make_frame(0, new)));
    }

    #[test]
    fn test_take_timeout_wakes_on_schedule() {
        use std::sync::Arc;

        let queue = Arc::new(FrameQueue::new());
        let gen = queue.current_generation();
        let producer = Arc::clone(&queue);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.schedule_back(make_frame(0, gen));
        });

        let got = queue.take_next_scheduled_timeout(Duration::from_secs(2));
        assert!(got.is_some());
        handle.join().unwrap();
    }

    #[test]
    fn test_take_timeout_expires_empty() {
        let queue: FrameQueue<u32> = FrameQueue::new();
        let got = queue.take_next_scheduled_timeout(Duration::from_millis(10));
        assert!(got.is_none());
    }
}
