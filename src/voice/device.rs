//! Host audio capability
//!
//! The session core only talks to audio hardware through these traits, so
//! the scheduling logic can be driven by a real device or a manual clock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Receives captured mono samples from the realtime input callback
///
/// Runs on the audio thread; implementations must not block.
pub type InputSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Told about each buffer that played out in full
///
/// Runs on the audio thread; implementations must not block.
pub type PlaybackNotifier = Box<dyn Fn(PlaybackId) + Send + Sync + 'static>;

/// Identifies one buffer scheduled on an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opens microphone and speaker devices
pub trait AudioHost: Send + Sync {
    /// Open the default microphone at `sample_rate`, delivering samples to `sink`
    ///
    /// # Errors
    ///
    /// Returns `Permission` if the capture device cannot be acquired
    fn open_input(&self, sample_rate: u32, sink: InputSink) -> Result<Box<dyn InputDevice>>;

    /// Open the default speaker at `sample_rate`
    ///
    /// Buffers that play out fully are reported on `finished`.
    ///
    /// # Errors
    ///
    /// Returns `Audio` if the output device cannot be opened
    fn open_output(
        &self,
        sample_rate: u32,
        finished: PlaybackNotifier,
    ) -> Result<Box<dyn OutputDevice>>;
}

/// An open microphone
pub trait InputDevice: Send {
    /// Stop delivering samples and release the device
    ///
    /// Calling it more than once has no further effect.
    fn close(&mut self);
}

/// An open speaker with an absolute timeline
pub trait OutputDevice: Send {
    /// Native sample rate of the device
    fn sample_rate(&self) -> u32;

    /// Current position of the device clock
    fn current_time(&self) -> Duration;

    /// Schedule `samples` (at the device rate) to start at absolute time `start`
    ///
    /// # Errors
    ///
    /// Returns `Audio` if the device is no longer running
    fn schedule(&mut self, id: PlaybackId, samples: Arc<[f32]>, start: Duration) -> Result<()>;

    /// Stop a scheduled or playing buffer immediately
    ///
    /// A stopped buffer is never reported as finished.
    fn stop(&mut self, id: PlaybackId);

    /// Release the device
    ///
    /// Calling it more than once has no further effect.
    fn close(&mut self);
}
