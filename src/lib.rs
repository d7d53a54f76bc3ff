//! Beacon Live - Realtime voice conversations with a remote speech model
//!
//! This library provides the core of a live voice session:
//! - Microphone capture framed into fixed PCM16 chunks
//! - Ordered, non-blocking delivery of those chunks to the remote
//! - Gapless scheduling of the remote's speech, with barge-in flushing
//! - An input volume meter for visual feedback
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  frames   ┌─────────────────┐  PCM16   ┌────────────┐
//! │ CaptureLoop ├──────────►│                 ├─────────►│            │
//! └─────────────┘           │                 │          │            │
//! ┌─────────────┐  ticks    │    Session      │  events  │ Transport  │
//! │ Visualizer  ├──────────►│    Controller   │◄─────────┤            │
//! └─────────────┘           │                 │          │            │
//! ┌─────────────┐  done     │                 │          └────────────┘
//! │  Playback   │◄─────────►│                 │
//! └─────────────┘           └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::{Config, LiveConfig, SessionConfig};
pub use error::{Error, Result};
pub use session::{SessionController, SessionState, SessionStatus, TransmitChannel};
pub use transport::{Connection, Connector, LiveConnector, Transport, TransportEvent};
pub use voice::{AudioFrame, AudioHost, CpalHost, PlaybackScheduler, VolumeSample};
