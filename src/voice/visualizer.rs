//! Input volume visualization
//!
//! A periodic task samples the most recent microphone audio, measures the
//! energy in the voice band of its spectrum, and publishes a smoothed 0-100
//! volume. The task is independent of the network path and is cancelled
//! explicitly when the session ends.

use std::sync::Arc;
use std::time::Duration;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-bin smoothing between successive measurements
const SMOOTHING: f32 = 0.8;

/// Magnitudes below this map to zero
const MIN_DECIBELS: f32 = -100.0;

/// Magnitudes above this map to full scale
const MAX_DECIBELS: f32 = -30.0;

/// Scale applied to the averaged bin level before clamping
const VOLUME_GAIN: f32 = 1.5;

/// Input volume in the range [0, 100]
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct VolumeSample(f32);

impl VolumeSample {
    pub const SILENT: Self = Self(0.0);

    /// Clamp an arbitrary level into range; NaN becomes silence
    #[must_use]
    pub fn new(level: f32) -> Self {
        if level.is_nan() {
            return Self::SILENT;
        }
        Self(level.clamp(0.0, 100.0))
    }

    #[must_use]
    pub const fn value(self) -> f32 {
        self.0
    }
}

/// Spectral energy meter over a fixed FFT size
pub struct VolumeMeter {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl VolumeMeter {
    /// Create a meter; `size` is rounded up to a power of two (minimum 32)
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(32).next_power_of_two();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);

        #[allow(clippy::cast_precision_loss)]
        let window = (0..size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        Self {
            fft,
            size,
            window,
            smoothed: vec![0.0; size / 2],
            buffer: vec![Complex::new(0.0, 0.0); size],
        }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Measure the trailing `size` samples of `samples`
    ///
    /// Shorter input is zero-padded at the front.
    #[allow(clippy::cast_precision_loss)]
    pub fn measure(&mut self, samples: &[f32]) -> VolumeSample {
        let tail = &samples[samples.len().saturating_sub(self.size)..];
        let pad = self.size - tail.len();

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { tail[i - pad] };
            let sample = if sample.is_finite() { sample } else { 0.0 };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let scale = self.size as f32;
        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.buffer[bin].norm() / scale;
            *smoothed = SMOOTHING.mul_add(*smoothed, (1.0 - SMOOTHING) * magnitude);
        }

        // Voice-relevant band: lower half of the spectrum
        let band = &self.smoothed[..self.smoothed.len() / 2];
        let total: f32 = band.iter().map(|&m| level(m)).sum();
        let average = total / band.len() as f32;

        VolumeSample::new(average / 255.0 * 100.0 * VOLUME_GAIN)
    }

    /// Forget smoothing history
    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

/// Map a linear magnitude onto the 0-255 byte scale
fn level(magnitude: f32) -> f32 {
    let db = 20.0 * magnitude.max(1e-12).log10();
    ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0).clamp(0.0, 255.0)
}

/// Handle to a running visualizer task
pub struct VisualizerSampler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl VisualizerSampler {
    /// Spawn the sampling loop
    ///
    /// `on_tick` receives every new sample; the loop ends when `cancel` fires.
    pub fn spawn<F>(
        mut analysis: watch::Receiver<Vec<f32>>,
        interval: Duration,
        fft_size: usize,
        cancel: CancellationToken,
        mut on_tick: F,
    ) -> Self
    where
        F: FnMut(VolumeSample) + Send + 'static,
    {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut meter = VolumeMeter::new(fft_size);
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::debug!(?interval, fft_size = meter.size(), "visualizer started");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let samples = analysis.borrow_and_update().clone();
                        on_tick(meter.measure(&samples));
                    }
                }
            }
            tracing::debug!("visualizer stopped");
        });

        Self { cancel, task }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::warn!(error = %e, "visualizer task panicked");
            }
        }
    }
}
