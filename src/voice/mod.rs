//! Voice processing module
//!
//! Handles audio capture, PCM framing, scheduled playback and the input
//! volume meter.

mod capture;
pub mod codec;
mod device;
mod output;
mod playback;
mod visualizer;

pub use capture::{ANALYSIS_WINDOW, CaptureControl, CaptureLoop, CpalInput, FrameEmitter, samples_to_wav};
pub use codec::{AudioFrame, FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
pub use device::{AudioHost, InputDevice, InputSink, OutputDevice, PlaybackId, PlaybackNotifier};
pub use output::CpalOutput;
pub use playback::{PlaybackScheduler, SAFETY_MARGIN, SPEAKING_EPSILON, ScheduledFrame};
pub use visualizer::{VisualizerSampler, VolumeMeter, VolumeSample};

use crate::Result;

/// Audio host backed by the default cpal devices
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalHost;

impl AudioHost for CpalHost {
    fn open_input(&self, sample_rate: u32, sink: InputSink) -> Result<Box<dyn InputDevice>> {
        Ok(Box::new(CpalInput::open(sample_rate, sink)?))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        finished: PlaybackNotifier,
    ) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(CpalOutput::open(sample_rate, finished)?))
    }
}
