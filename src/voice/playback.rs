//! Gapless playback scheduling
//!
//! Inbound speech arrives in bursts of arbitrary length. Every frame is
//! appended to a running cursor on the output device's timeline instead of
//! being started on arrival, so consecutive frames play back contiguously.
//! When the timeline runs dry the next frame is pushed out by a fixed safety
//! margin, which absorbs delivery jitter at the cost of a little latency.
//!
//! Frames at a rate other than the device's go through one streaming
//! resampler per inbound rate, so frame edges do not click.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::codec::{AudioFrame, StreamResampler, samples_to_duration};
use super::device::{OutputDevice, PlaybackId};
use crate::{Error, Result};

/// Delay applied to the first frame after the timeline runs dry
pub const SAFETY_MARGIN: Duration = Duration::from_millis(150);

/// Tolerance when deciding whether buffered playback has caught up
pub const SPEAKING_EPSILON: Duration = Duration::from_millis(20);

/// Where a frame landed on the output timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledFrame {
    /// Handle for the scheduled buffer
    pub id: PlaybackId,
    /// Absolute device time the frame starts at
    pub start: Duration,
    /// Playback length of the frame
    pub duration: Duration,
}

impl ScheduledFrame {
    #[must_use]
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Owns the output device's future timeline
pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    safety_margin: Duration,
    cursor: Option<Duration>,
    active: BTreeSet<PlaybackId>,
    resamplers: HashMap<u32, StreamResampler>,
    next_id: u64,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(output: Box<dyn OutputDevice>, safety_margin: Duration) -> Self {
        Self {
            output,
            safety_margin,
            cursor: None,
            active: BTreeSet::new(),
            resamplers: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule a decoded frame right after everything already queued
    ///
    /// Returns `None` when the frame is shorter than one resampler chunk and
    /// is held until more audio at its rate arrives or the turn finishes.
    ///
    /// # Errors
    ///
    /// Returns `AudioDecode` for an empty or unresampleable frame (nothing is
    /// scheduled and the cursor is untouched), or `Audio` if the device rejects
    /// the buffer
    pub fn enqueue(&mut self, frame: &AudioFrame) -> Result<Option<ScheduledFrame>> {
        if frame.is_empty() {
            return Err(Error::AudioDecode("empty frame".to_string()));
        }

        let device_rate = self.output.sample_rate();
        if frame.sample_rate() == device_rate {
            return self.schedule(frame.shared_samples()).map(Some);
        }

        let resampler = match self.resamplers.entry(frame.sample_rate()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(StreamResampler::new(frame.sample_rate(), device_rate)?)
            }
        };
        let samples = resampler.process(frame.samples())?;
        if samples.is_empty() {
            tracing::trace!(rate = frame.sample_rate(), len = frame.len(), "frame held by resampler");
            return Ok(None);
        }
        self.schedule(samples.into()).map(Some)
    }

    /// Schedule audio still held by the resamplers
    ///
    /// Called when the remote finishes a turn, so the last few milliseconds
    /// of speech are not left behind.
    ///
    /// # Errors
    ///
    /// Returns `AudioDecode` if a resampler fails, or `Audio` if the device
    /// rejects the buffer
    pub fn finish_turn(&mut self) -> Result<Option<ScheduledFrame>> {
        let mut tail = Vec::new();
        for resampler in self.resamplers.values_mut() {
            tail.extend(resampler.finish()?);
        }
        if tail.is_empty() {
            return Ok(None);
        }
        self.schedule(tail.into()).map(Some)
    }

    fn schedule(&mut self, samples: Arc<[f32]>) -> Result<ScheduledFrame> {
        let duration = samples_to_duration(samples.len(), self.output.sample_rate());

        let now = self.output.current_time();
        let start = match self.cursor {
            Some(cursor) if cursor >= now => cursor,
            _ => {
                tracing::trace!(?now, margin = ?self.safety_margin, "playback underrun, restarting timeline");
                now + self.safety_margin
            }
        };

        let id = PlaybackId(self.next_id);
        self.next_id += 1;

        self.output.schedule(id, samples, start)?;
        self.cursor = Some(start + duration);
        self.active.insert(id);

        tracing::trace!(%id, ?start, ?duration, active = self.active.len(), "frame scheduled");

        Ok(ScheduledFrame {
            id,
            start,
            duration,
        })
    }

    /// Stop everything queued or playing and forget the cursor
    ///
    /// Returns the number of buffers that were stopped.
    pub fn flush(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active) {
            self.output.stop(id);
        }
        for resampler in self.resamplers.values_mut() {
            resampler.reset();
        }
        self.cursor = None;

        if stopped > 0 {
            tracing::debug!(stopped, "playback flushed");
        }
        stopped
    }

    /// Record that a buffer played out naturally
    ///
    /// Returns false for handles that were already stopped or never existed.
    pub fn complete(&mut self, id: PlaybackId) -> bool {
        self.active.remove(&id)
    }

    /// Whether the device clock has caught up with everything scheduled
    #[must_use]
    pub fn is_caught_up(&self, epsilon: Duration) -> bool {
        match self.cursor {
            None => self.active.is_empty(),
            Some(cursor) => self.output.current_time() + epsilon >= cursor,
        }
    }

    /// Next start time, or `None` if the timeline has not started
    #[must_use]
    pub const fn cursor(&self) -> Option<Duration> {
        self.cursor
    }

    /// Handles not yet finished or stopped
    pub fn active_handles(&self) -> impl Iterator<Item = PlaybackId> + '_ {
        self.active.iter().copied()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn current_time(&self) -> Duration {
        self.output.current_time()
    }

    /// Stop all playback and release the output device
    pub fn close(&mut self) {
        self.flush();
        self.output.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct DeviceLog {
        now: Duration,
        scheduled: Vec<(PlaybackId, Duration, usize)>,
        stopped: Vec<PlaybackId>,
        closed: bool,
    }

    struct ManualOutput {
        rate: u32,
        log: Arc<Mutex<DeviceLog>>,
    }

    impl OutputDevice for ManualOutput {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn current_time(&self) -> Duration {
            self.log.lock().unwrap().now
        }

        fn schedule(&mut self, id: PlaybackId, samples: Arc<[f32]>, start: Duration) -> Result<()> {
            self.log.lock().unwrap().scheduled.push((id, start, samples.len()));
            Ok(())
        }

        fn stop(&mut self, id: PlaybackId) {
            self.log.lock().unwrap().stopped.push(id);
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed = true;
        }
    }

    fn scheduler(rate: u32) -> (PlaybackScheduler, Arc<Mutex<DeviceLog>>) {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let output = ManualOutput {
            rate,
            log: Arc::clone(&log),
        };
        (PlaybackScheduler::new(Box::new(output), SAFETY_MARGIN), log)
    }

    fn frame_ms(ms: usize, rate: u32) -> AudioFrame {
        AudioFrame::new(vec![0.1f32; ms * rate as usize / 1000], rate)
    }

    fn set_now(log: &Arc<Mutex<DeviceLog>>, ms: u64) {
        log.lock().unwrap().now = Duration::from_millis(ms);
    }

    #[test]
    fn test_first_frame_waits_safety_margin() {
        let (mut scheduler, log) = scheduler(24_000);
        set_now(&log, 1_000);

        let scheduled = scheduler.enqueue(&frame_ms(200, 24_000)).unwrap().unwrap();
        assert_eq!(scheduled.start, Duration::from_millis(1_150));
        assert_eq!(scheduler.cursor(), Some(Duration::from_millis(1_350)));
    }

    #[test]
    fn test_frames_are_contiguous() {
        let (mut scheduler, log) = scheduler(24_000);
        set_now(&log, 0);

        let durations = [40, 200, 120, 7];
        let mut previous: Option<ScheduledFrame> = None;
        for (i, ms) in durations.iter().enumerate() {
            set_now(&log, i as u64 * 10);
            let scheduled = scheduler.enqueue(&frame_ms(*ms, 24_000)).unwrap().unwrap();
            if let Some(prev) = previous {
                assert_eq!(scheduled.start, prev.end());
            }
            previous = Some(scheduled);
        }
        assert_eq!(scheduler.active_count(), durations.len());
    }

    #[test]
    fn test_underrun_restarts_from_now() {
        let (mut scheduler, log) = scheduler(24_000);
        set_now(&log, 0);
        scheduler.enqueue(&frame_ms(100, 24_000)).unwrap().unwrap();

        // cursor is at 250 ms; the device has moved past it
        set_now(&log, 400);
        let scheduled = scheduler.enqueue(&frame_ms(100, 24_000)).unwrap().unwrap();
        assert_eq!(scheduled.start, Duration::from_millis(550));
    }

    #[test]
    fn test_flush_stops_everything_and_unsets_cursor() {
        let (mut scheduler, log) = scheduler(24_000);
        set_now(&log, 0);
        let a = scheduler.enqueue(&frame_ms(200, 24_000)).unwrap().unwrap();
        let b = scheduler.enqueue(&frame_ms(200, 24_000)).unwrap().unwrap();

        assert_eq!(scheduler.flush(), 2);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.cursor(), None);
        assert_eq!(log.lock().unwrap().stopped, vec![a.id, b.id]);

        set_now(&log, 100);
        let next = scheduler.enqueue(&frame_ms(200, 24_000)).unwrap().unwrap();
        assert_eq!(next.start, Duration::from_millis(250));
    }

    #[test]
    fn test_complete_removes_handle_once() {
        let (mut scheduler, _log) = scheduler(24_000);
        let scheduled = scheduler.enqueue(&frame_ms(50, 24_000)).unwrap().unwrap();

        assert!(scheduler.complete(scheduled.id));
        assert!(!scheduler.complete(scheduled.id));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_completion_after_flush_is_ignored() {
        let (mut scheduler, _log) = scheduler(24_000);
        let scheduled = scheduler.enqueue(&frame_ms(50, 24_000)).unwrap().unwrap();
        scheduler.flush();
        assert!(!scheduler.complete(scheduled.id));
    }

    #[test]
    fn test_empty_frame_is_rejected_without_moving_cursor() {
        let (mut scheduler, _log) = scheduler(24_000);
        let err = scheduler.enqueue(&AudioFrame::new(Vec::new(), 24_000)).unwrap_err();
        assert!(matches!(err, Error::AudioDecode(_)));
        assert_eq!(scheduler.cursor(), None);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_caught_up() {
        let (mut scheduler, log) = scheduler(24_000);
        assert!(scheduler.is_caught_up(SPEAKING_EPSILON));

        set_now(&log, 0);
        scheduler.enqueue(&frame_ms(200, 24_000)).unwrap().unwrap();
        assert!(!scheduler.is_caught_up(SPEAKING_EPSILON));

        set_now(&log, 340);
        assert!(scheduler.is_caught_up(SPEAKING_EPSILON));
    }

    #[test]
    fn test_resamples_to_device_rate() {
        let (mut scheduler, log) = scheduler(48_000);
        set_now(&log, 0);
        let scheduled = scheduler.enqueue(&frame_ms(100, 24_000)).unwrap().unwrap();

        let (_, _, len) = log.lock().unwrap().scheduled[0];
        assert!(len > 4_000, "expected ~4800 samples, got {len}");
        assert_eq!(scheduled.duration, samples_to_duration(len, 48_000));
    }

    #[test]
    fn test_resampled_frames_stay_contiguous() {
        let (mut scheduler, log) = scheduler(48_000);
        set_now(&log, 0);

        let first = scheduler.enqueue(&frame_ms(100, 24_000)).unwrap().unwrap();
        let second = scheduler.enqueue(&frame_ms(100, 24_000)).unwrap().unwrap();
        assert_eq!(second.start, first.end());
    }

    #[test]
    fn test_short_resampled_frame_is_held_until_turn_ends() {
        let (mut scheduler, log) = scheduler(48_000);
        set_now(&log, 0);

        // 2 ms is below one resampler chunk
        assert!(scheduler.enqueue(&frame_ms(2, 24_000)).unwrap().is_none());
        assert_eq!(scheduler.cursor(), None);
        assert!(log.lock().unwrap().scheduled.is_empty());

        let tail = scheduler.finish_turn().unwrap().unwrap();
        assert_eq!(tail.start, Duration::from_millis(150));
        assert!(scheduler.finish_turn().unwrap().is_none());
    }

    #[test]
    fn test_flush_drops_held_audio() {
        let (mut scheduler, _log) = scheduler(48_000);
        assert!(scheduler.enqueue(&frame_ms(2, 24_000)).unwrap().is_none());

        scheduler.flush();
        assert!(scheduler.finish_turn().unwrap().is_none());
    }

    #[test]
    fn test_close_releases_device() {
        let (mut scheduler, log) = scheduler(24_000);
        scheduler.enqueue(&frame_ms(50, 24_000)).unwrap().unwrap();
        scheduler.close();

        let log = log.lock().unwrap();
        assert!(log.closed);
        assert_eq!(log.stopped.len(), 1);
    }
}
