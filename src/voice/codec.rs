//! PCM16 wire format conversion
//!
//! Outbound frames are mono 16-bit little-endian PCM. Inbound frames use the
//! same sample format at the remote's rate (24kHz for synthesized speech).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::{Error, Result};

/// Sample rate of outbound (captured) audio
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of inbound (synthesized) audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per captured frame (~128 ms at 16kHz)
pub const FRAME_SIZE: usize = 2048;

/// All frames are mono
pub const CHANNELS: u16 = 1;

const BYTES_PER_SAMPLE: usize = 2;

/// An immutable slice of mono audio
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
    timestamp: Instant,
}

impl AudioFrame {
    /// Create a frame stamped with the current instant
    #[must_use]
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            timestamp: Instant::now(),
        }
    }

    /// Samples in playback order
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the sample data
    #[must_use]
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn channels(&self) -> u16 {
        CHANNELS
    }

    /// When the frame was captured (outbound) or arrived (inbound)
    #[must_use]
    pub const fn timestamp(&self) -> Instant {
        self.timestamp
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration at the frame's own sample rate
    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Convert a sample count to a duration at the given rate
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (samples as u128 * 1_000_000_000) / u128::from(sample_rate);
    Duration::from_nanos(nanos as u64)
}

/// Encode float samples as PCM16 little-endian bytes
///
/// Samples are clipped to [-1, 1] before scaling.
#[must_use]
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let clipped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        #[allow(clippy::cast_possible_truncation)]
        let value = (clipped * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode PCM16 little-endian bytes into a frame at `sample_rate`
///
/// # Errors
///
/// Returns `AudioDecode` if the payload is empty, has an odd byte count, or
/// the sample rate is zero
pub fn decode(bytes: &[u8], sample_rate: u32) -> Result<AudioFrame> {
    if sample_rate == 0 {
        return Err(Error::AudioDecode("sample rate must be non-zero".to_string()));
    }
    if bytes.is_empty() {
        return Err(Error::AudioDecode("empty audio payload".to_string()));
    }
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(Error::AudioDecode(format!(
            "payload of {} bytes is not whole 16-bit samples",
            bytes.len()
        )));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    Ok(AudioFrame::new(samples, sample_rate))
}

/// Input consumed per resampler pass, in milliseconds
const RESAMPLE_CHUNK_MS: u32 = 10;

/// Resampler that carries filter state across consecutive frames
///
/// Input is consumed in fixed 10 ms chunks, so the output is identical no
/// matter how the stream was split into frames. A remainder shorter than one
/// chunk is held until more audio arrives or [`StreamResampler::finish`].
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    ratio: f64,
    pending: Vec<f32>,
    output: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// # Errors
    ///
    /// Returns `AudioDecode` if either rate is zero or the resampler cannot be
    /// built
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(Error::AudioDecode("sample rate must be non-zero".to_string()));
        }

        let ratio = f64::from(to_rate) / f64::from(from_rate);
        let chunk_size = (from_rate * RESAMPLE_CHUNK_MS / 1000).max(1) as usize;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            usize::from(CHANNELS),
        )
        .map_err(|e| Error::AudioDecode(format!("failed to create resampler: {e}")))?;
        let output = resampler.output_buffer_allocate(true);

        tracing::debug!(from_rate, to_rate, chunk_size, "stream resampler created");
        Ok(Self {
            resampler,
            ratio,
            pending: Vec::with_capacity(chunk_size * 2),
            output,
        })
    }

    /// Resample every whole chunk now available, holding the remainder
    ///
    /// # Errors
    ///
    /// Returns `AudioDecode` if the resampler fails
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let chunk = self.resampler.input_frames_next();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let mut resampled = Vec::with_capacity((self.pending.len() as f64 * self.ratio) as usize + 16);
        let mut consumed = 0;
        while chunk > 0 && self.pending.len() - consumed >= chunk {
            let input = [&self.pending[consumed..consumed + chunk]];
            let (used, written) = self
                .resampler
                .process_into_buffer(&input, &mut self.output, None)
                .map_err(|e| Error::AudioDecode(format!("resampling failed: {e}")))?;
            resampled.extend_from_slice(&self.output[0][..written]);
            if used == 0 {
                break;
            }
            consumed += used;
        }
        self.pending.drain(..consumed);

        Ok(resampled)
    }

    /// Resample whatever is held and start the next stream from a clean state
    ///
    /// # Errors
    ///
    /// Returns `AudioDecode` if the resampler fails
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        if self.pending.is_empty() {
            self.resampler.reset();
            return Ok(Vec::new());
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let expected =
            (self.pending.len() as f64 * self.ratio).round() as usize + self.resampler.output_delay();
        let input = [self.pending.as_slice()];
        let (_, written) = self
            .resampler
            .process_partial_into_buffer(Some(&input[..]), &mut self.output, None)
            .map_err(|e| Error::AudioDecode(format!("resampling failed: {e}")))?;
        let tail = self.output[0][..written.min(expected)].to_vec();

        self.pending.clear();
        self.resampler.reset();
        Ok(tail)
    }

    /// Drop held input and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }

    /// Input samples waiting for a full chunk
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
