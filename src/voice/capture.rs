//! Audio capture from microphone
//!
//! The cpal input callback feeds a [`CaptureLoop`], which cuts the stream into
//! fixed-size frames in capture order and publishes the most recent samples
//! for the visualizer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::watch;

use super::codec::AudioFrame;
use super::device::{InputDevice, InputSink};
use crate::{Error, Result};

/// Number of trailing samples kept for spectral analysis
pub const ANALYSIS_WINDOW: usize = 2048;

/// Receives each completed frame; must not block
pub type FrameEmitter = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Shared switch and counters for a running [`CaptureLoop`]
#[derive(Clone)]
pub struct CaptureControl {
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    analysis: watch::Receiver<Vec<f32>>,
}

impl CaptureControl {
    /// Start emitting frames
    pub fn begin(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::debug!("capture loop started");
        }
    }

    /// Stop emitting frames; partial frames are discarded
    pub fn pause(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("capture loop paused");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Total frames emitted since creation
    #[must_use]
    pub fn frames_emitted(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Latest-value slot holding the most recent captured samples
    #[must_use]
    pub fn analysis(&self) -> watch::Receiver<Vec<f32>> {
        self.analysis.clone()
    }
}

/// Cuts captured audio into fixed-size frames
pub struct CaptureLoop {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    emit: FrameEmitter,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    analysis: watch::Sender<Vec<f32>>,
}

impl CaptureLoop {
    /// Create a capture loop; frames are only emitted after [`CaptureControl::begin`]
    #[must_use]
    pub fn new(frame_size: usize, sample_rate: u32, emit: FrameEmitter) -> (Self, CaptureControl) {
        let running = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let (analysis, analysis_rx) = watch::channel(Vec::with_capacity(ANALYSIS_WINDOW));

        let control = CaptureControl {
            running: Arc::clone(&running),
            frames: Arc::clone(&frames),
            analysis: analysis_rx,
        };

        let capture = Self {
            frame_size: frame_size.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_size),
            emit,
            running,
            frames,
            analysis,
        };

        (capture, control)
    }

    /// Feed samples from the input callback
    pub fn push(&mut self, data: &[f32]) {
        self.publish_analysis(data);

        if !self.running.load(Ordering::Acquire) {
            self.pending.clear();
            return;
        }

        let mut rest = data;
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                (self.emit)(AudioFrame::new(samples, self.sample_rate));
                self.frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Convert into a sink for [`AudioHost::open_input`](super::AudioHost::open_input)
    #[must_use]
    pub fn into_sink(mut self) -> InputSink {
        Box::new(move |data: &[f32]| self.push(data))
    }

    /// Slide the analysis window in place; it never grows past its capacity
    fn publish_analysis(&self, data: &[f32]) {
        let data = &data[data.len().saturating_sub(ANALYSIS_WINDOW)..];
        self.analysis.send_modify(|window| {
            let keep = ANALYSIS_WINDOW - data.len();
            if window.len() > keep {
                let excess = window.len() - keep;
                window.drain(..excess);
            }
            window.extend_from_slice(data);
        });
    }
}

/// Microphone opened through cpal
///
/// cpal streams aren't `Send`, so the stream lives on its own thread until
/// the device is closed.
pub struct CpalInput {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns `Permission` if no input device can be opened
    pub fn open(sample_rate: u32, sink: InputSink) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("beacon-live-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Park until closed or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Permission("capture thread exited during open".to_string()))
            }
        }
    }
}

impl InputDevice for CpalInput {
    fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(sample_rate: u32, mut sink: InputSink) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(sample_rate) && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Permission(e.to_string()))?
        .filter(|c| supports_rate(c) && c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Permission("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let mut mono = Vec::new();
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    sink(data);
                    return;
                }
                mono.clear();
                #[allow(clippy::cast_precision_loss)]
                mono.extend(
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                );
                sink(&mono);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Permission(e.to_string()))?;

    stream.play().map_err(|e| Error::Permission(e.to_string()))?;
    tracing::debug!("audio capture started");

    Ok(stream)
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for pair in super::codec::encode(samples).chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
