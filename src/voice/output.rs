//! Audio output to speakers
//!
//! Buffers are mixed into the cpal callback at an absolute start sample, so
//! the caller decides exactly when each one begins. The device clock is the
//! number of frames rendered so far.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::codec::samples_to_duration;
use super::device::{OutputDevice, PlaybackId, PlaybackNotifier};
use crate::{Error, Result};

struct Scheduled {
    id: PlaybackId,
    start: u64,
    samples: Arc<[f32]>,
}

impl Scheduled {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Buffers waiting for or in the middle of playback
#[derive(Default)]
struct Timeline {
    buffers: Vec<Scheduled>,
}

impl Timeline {
    /// Mix one callback block starting at absolute sample `base`
    ///
    /// Returns the ids of buffers that finished inside this block.
    fn render(&mut self, base: u64, out: &mut [f32], channels: usize) -> Vec<PlaybackId> {
        for (offset, frame) in out.chunks_mut(channels).enumerate() {
            let pos = base + offset as u64;
            let mut mixed = 0.0f32;
            for buffer in &self.buffers {
                if pos >= buffer.start && pos < buffer.end() {
                    #[allow(clippy::cast_possible_truncation)]
                    let index = (pos - buffer.start) as usize;
                    mixed += buffer.samples[index];
                }
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
        }

        let end = base + (out.len() / channels) as u64;
        let mut finished = Vec::new();
        self.buffers.retain(|buffer| {
            if buffer.end() <= end {
                finished.push(buffer.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Speaker opened through cpal
pub struct CpalOutput {
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    timeline: Arc<Mutex<Timeline>>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns `Audio` if no output device can be opened
    pub fn open(sample_rate: u32, finished: PlaybackNotifier) -> Result<Self> {
        let clock = Arc::new(AtomicU64::new(0));
        let timeline = Arc::new(Mutex::new(Timeline::default()));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let stream_clock = Arc::clone(&clock);
        let stream_timeline = Arc::clone(&timeline);
        let thread = std::thread::Builder::new()
            .name("beacon-live-playback".to_string())
            .spawn(move || {
                let stream =
                    match build_output_stream(sample_rate, stream_clock, stream_timeline, finished) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(()));

                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio playback stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                sample_rate,
                clock,
                timeline,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("playback thread exited during open".to_string()))
            }
        }
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[allow(clippy::cast_possible_truncation)]
    fn current_time(&self) -> Duration {
        samples_to_duration(self.clock.load(Ordering::Acquire) as usize, self.sample_rate)
    }

    fn schedule(&mut self, id: PlaybackId, samples: Arc<[f32]>, start: Duration) -> Result<()> {
        if self.stop_tx.is_none() {
            return Err(Error::Audio("output device is closed".to_string()));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let start = (start.as_secs_f64() * f64::from(self.sample_rate)).round() as u64;

        self.timeline
            .lock()
            .map_err(|_| Error::Audio("playback timeline poisoned".to_string()))?
            .buffers
            .push(Scheduled { id, start, samples });
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.buffers.retain(|buffer| buffer.id != id);
        }
    }

    fn close(&mut self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.buffers.clear();
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("playback thread panicked");
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    timeline: Arc<Mutex<Timeline>>,
    finished: PlaybackNotifier,
) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.sample_format() == cpal::SampleFormat::F32
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let base = clock.load(Ordering::Acquire);
                let done = match timeline.lock() {
                    Ok(mut timeline) => timeline.render(base, data, channels),
                    Err(_) => {
                        data.fill(0.0);
                        Vec::new()
                    }
                };
                clock.store(base + (data.len() / channels) as u64, Ordering::Release);
                for id in done {
                    finished(id);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    Ok(stream)
}
