//! Gapless playback scheduling with barge-in.
//!
//! Segments arrive asynchronously from the transport and are laid end to end on one
//! output timeline. The timeline cursor and the set of scheduled segments live behind a
//! single mutex owned by [`PlaybackScheduler`]; callers only ever go through
//! `enqueue`, `flush` and `reset`.
//!
//! ```text
//!   enqueue(s1)  enqueue(s2)  enqueue(s3)          flush()   enqueue(s4)
//!   |---- s1 ----|---- s2 ----|-- s3 --|             X       |---- s4 ----|
//!   ^ now        ^ next_start                        now ---> ^ starts at now
//! ```

use crate::error::{VoiceError, VoiceResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

/// Decoded speech ready for the output device. Owned by the scheduler from enqueue
/// until it finishes or is flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSegment {
    /// One buffer per channel, all of equal length.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl PlaybackSegment {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds. Not finite when `sample_rate` is zero.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Samples interleaved frame by frame, as most output APIs want them.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for i in 0..frames {
            for ch in &self.channels {
                out.push(ch.get(i).copied().unwrap_or(0.0));
            }
        }
        out
    }
}

/// Called exactly once when a segment plays to its end. Never called after the
/// segment's handle has been stopped.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// The audio output side: a monotonic clock and the ability to start a segment at a
/// point on that clock.
pub trait OutputDevice: Send + Sync {
    /// Current device time in seconds.
    fn now(&self) -> f64;

    /// Play `segment` beginning at `start_at` (device seconds).
    ///
    /// `on_complete` must not be invoked from inside this call; the scheduler holds its
    /// lock while scheduling.
    fn schedule(
        &self,
        segment: &PlaybackSegment,
        start_at: f64,
        on_complete: CompletionCallback,
    ) -> VoiceResult<Box<dyn ScheduledPlayback>>;
}

/// Handle to one scheduled segment.
pub trait ScheduledPlayback: Send {
    /// Stop immediately. Stopping a finished segment is a no-op.
    fn stop(&mut self);
}

struct Timeline {
    /// Earliest time the next segment may start.
    next_start_time: f64,
    /// Segments queued or playing, keyed by id.
    scheduled: HashMap<u64, Box<dyn ScheduledPlayback>>,
    next_id: u64,
    /// Bumped by every flush/reset so late completions from old segments are ignored.
    epoch: u64,
}

impl Timeline {
    fn new() -> Self {
        Self {
            next_start_time: 0.0,
            scheduled: HashMap::new(),
            next_id: 0,
            epoch: 0,
        }
    }

    fn stop_all(&mut self) -> usize {
        let stopped = self.scheduled.len();
        for (_, mut handle) in self.scheduled.drain() {
            handle.stop();
        }
        self.epoch = self.epoch.wrapping_add(1);
        stopped
    }
}

struct Inner {
    device: Arc<dyn OutputDevice>,
    timeline: Mutex<Timeline>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Timeline> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.timeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Schedules segments back to back on one output device.
///
/// Cheap to clone; clones share the same timeline.
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<Inner>,
}

impl PlaybackScheduler {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self {
            inner: Arc::new(Inner {
                device,
                timeline: Mutex::new(Timeline::new()),
            }),
        }
    }

    /// Schedule `segment` right after everything already scheduled, or now if the
    /// timeline has gone stale. Returns the start time.
    ///
    /// A segment with a negative or non-finite duration breaks the timeline: the
    /// scheduler resets and returns `SchedulingViolation`.
    pub fn enqueue(&self, segment: PlaybackSegment) -> VoiceResult<f64> {
        let duration = segment.duration();
        if !duration.is_finite() || duration < 0.0 {
            warn!(
                target: "parley::voice",
                duration,
                sample_rate = segment.sample_rate,
                "invalid segment duration, resetting playback timeline"
            );
            self.reset();
            return Err(VoiceError::SchedulingViolation(format!(
                "segment duration {} is not a non-negative finite number",
                duration
            )));
        }

        let mut timeline = self.inner.lock();
        let now = self.inner.device.now();
        let start_at = now.max(timeline.next_start_time);

        let id = timeline.next_id;
        timeline.next_id = timeline.next_id.wrapping_add(1);
        let epoch = timeline.epoch;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let on_complete: CompletionCallback = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut timeline = inner.lock();
                if timeline.epoch == epoch {
                    timeline.scheduled.remove(&id);
                }
            }
        });

        let handle = self.inner.device.schedule(&segment, start_at, on_complete)?;
        timeline.scheduled.insert(id, handle);
        timeline.next_start_time = start_at + duration;

        debug!(
            target: "parley::voice",
            start_at,
            duration,
            queued = timeline.scheduled.len(),
            "segment scheduled"
        );
        Ok(start_at)
    }

    /// Barge-in: stop everything scheduled and restart the timeline at the current
    /// device time.
    pub fn flush(&self) {
        let mut timeline = self.inner.lock();
        let stopped = timeline.stop_all();
        timeline.next_start_time = self.inner.device.now();
        info!(target: "parley::voice", stopped, "playback flushed");
    }

    /// Session teardown: like [`flush`](Self::flush) but the cursor returns to the
    /// origin so the next session starts a fresh timeline.
    pub fn reset(&self) {
        let mut timeline = self.inner.lock();
        let stopped = timeline.stop_all();
        timeline.next_start_time = 0.0;
        if stopped > 0 {
            info!(target: "parley::voice", stopped, "playback reset");
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.inner.lock().next_start_time
    }

    /// Segments currently queued or playing.
    pub fn scheduled_len(&self) -> usize {
        self.inner.lock().scheduled.len()
    }

    pub fn is_idle(&self) -> bool {
        self.scheduled_len() == 0
    }

    /// Current time on the output device clock.
    pub fn now(&self) -> f64 {
        self.inner.device.now()
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timeline = self.inner.lock();
        f.debug_struct("PlaybackScheduler")
            .field("next_start_time", &timeline.next_start_time)
            .field("scheduled", &timeline.scheduled.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Output device with a hand-driven clock.
    #[derive(Default)]
    struct ManualDevice {
        now: Mutex<f64>,
        starts: Mutex<Vec<f64>>,
        pending: Mutex<Vec<(Arc<AtomicBool>, CompletionCallback)>>,
    }

    struct ManualHandle(Arc<AtomicBool>);

    impl ScheduledPlayback for ManualHandle {
        fn stop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl ManualDevice {
        fn set_now(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }

        /// Finish every segment that was not stopped, oldest first.
        fn finish_all(&self) {
            let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
            for (stopped, cb) in pending {
                if !stopped.load(Ordering::SeqCst) {
                    cb();
                }
            }
        }
    }

    impl OutputDevice for ManualDevice {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn schedule(
            &self,
            _segment: &PlaybackSegment,
            start_at: f64,
            on_complete: CompletionCallback,
        ) -> VoiceResult<Box<dyn ScheduledPlayback>> {
            self.starts.lock().unwrap().push(start_at);
            let stopped = Arc::new(AtomicBool::new(false));
            self.pending.lock().unwrap().push((stopped.clone(), on_complete));
            Ok(Box::new(ManualHandle(stopped)))
        }
    }

    fn secs(duration: f64) -> PlaybackSegment {
        PlaybackSegment::mono(vec![0.0; (duration * 1000.0).round() as usize], 1000)
    }

    fn setup() -> (Arc<ManualDevice>, PlaybackScheduler) {
        let device = Arc::new(ManualDevice::default());
        let scheduler = PlaybackScheduler::new(device.clone());
        (device, scheduler)
    }

    #[test]
    fn back_to_back_segments_have_no_gaps() {
        let (device, scheduler) = setup();
        assert_eq!(scheduler.enqueue(secs(0.5)).unwrap(), 0.0);
        assert_eq!(scheduler.enqueue(secs(0.3)).unwrap(), 0.5);
        assert_eq!(scheduler.enqueue(secs(0.2)).unwrap(), 0.8);
        assert!((scheduler.next_start_time() - 1.0).abs() < 1e-9);
        assert_eq!(scheduler.scheduled_len(), 3);
        assert_eq!(*device.starts.lock().unwrap(), vec![0.0, 0.5, 0.8]);
    }

    #[test]
    fn stale_cursor_resumes_at_now() {
        let (device, scheduler) = setup();
        scheduler.enqueue(secs(0.5)).unwrap();
        device.set_now(3.0);
        assert_eq!(scheduler.enqueue(secs(0.5)).unwrap(), 3.0);
        assert_eq!(scheduler.next_start_time(), 3.5);
    }

    #[test]
    fn flush_restarts_timeline_at_now() {
        let (device, scheduler) = setup();
        scheduler.enqueue(secs(0.5)).unwrap();
        scheduler.enqueue(secs(0.3)).unwrap();
        scheduler.enqueue(secs(0.2)).unwrap();

        device.set_now(0.6);
        scheduler.flush();
        assert_eq!(scheduler.scheduled_len(), 0);
        assert_eq!(scheduler.next_start_time(), 0.6);
        assert_eq!(scheduler.enqueue(secs(0.4)).unwrap(), 0.6);
    }

    #[test]
    fn natural_completion_removes_segment() {
        let (device, scheduler) = setup();
        scheduler.enqueue(secs(0.5)).unwrap();
        scheduler.enqueue(secs(0.5)).unwrap();
        device.finish_all();
        assert!(scheduler.is_idle());
        // Cursor is untouched by completion.
        assert_eq!(scheduler.next_start_time(), 1.0);
    }

    #[test]
    fn late_completion_from_flushed_epoch_is_ignored() {
        let device = Arc::new(ManualDevice::default());
        let scheduler = PlaybackScheduler::new(device.clone());
        scheduler.enqueue(secs(0.5)).unwrap();

        // Grab the callback before the flush so it can fire "late".
        let (_, stale_cb) = device.pending.lock().unwrap().remove(0);
        scheduler.flush();
        scheduler.enqueue(secs(0.5)).unwrap();
        stale_cb();
        assert_eq!(scheduler.scheduled_len(), 1);
    }

    #[test]
    fn reset_zeroes_cursor_and_is_idempotent() {
        let (device, scheduler) = setup();
        device.set_now(2.0);
        scheduler.enqueue(secs(0.5)).unwrap();
        scheduler.reset();
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(scheduler.scheduled_len(), 0);
        scheduler.reset();
        assert_eq!(scheduler.scheduled_len(), 0);
    }

    #[test]
    fn zero_rate_segment_is_a_violation() {
        let (_device, scheduler) = setup();
        scheduler.enqueue(secs(0.5)).unwrap();
        let err = scheduler
            .enqueue(PlaybackSegment::mono(vec![0.0; 10], 0))
            .unwrap_err();
        assert!(matches!(err, VoiceError::SchedulingViolation(_)));
        assert_eq!(scheduler.scheduled_len(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
    }

    #[test]
    fn interleaves_channels() {
        let seg = PlaybackSegment::new(vec![vec![1.0, 2.0], vec![-1.0, -2.0]], 24_000);
        assert_eq!(seg.channel_count(), 2);
        assert_eq!(seg.interleaved(), vec![1.0, -1.0, 2.0, -2.0]);
    }
}
