//! Conversational transport
//!
//! A transport carries encoded microphone frames out and delivers the
//! remote's events back in arrival order. The session core only sees the
//! [`Connector`] and [`Transport`] traits.

mod live;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use live::{CLOSE_TIMEOUT, LiveConnector, parse_server_message};

use crate::Result;

/// Event delivered by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The conversation is ready to receive audio
    Opened,
    /// Synthesized speech as PCM16 little-endian bytes
    AudioChunk {
        data: Vec<u8>,
        sample_rate: u32,
    },
    /// The remote stopped speaking because the user barged in
    Interrupted,
    /// The remote finished its turn
    TurnComplete,
    /// The remote closed the conversation
    Closed { reason: Option<String> },
    /// The transport failed
    Error(String),
}

impl TransportEvent {
    /// Short name for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::Interrupted => "interrupted",
            Self::TurnComplete => "turn_complete",
            Self::Closed { .. } => "closed",
            Self::Error(_) => "error",
        }
    }
}

/// Outbound half of an open conversation
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue an encoded frame for delivery without waiting on the network
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the connection is gone
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Close the conversation; later calls have no effect
    async fn close(&self);
}

/// An open conversation
pub struct Connection {
    /// Outbound half
    pub transport: Arc<dyn Transport>,
    /// Inbound events in arrival order
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens conversations
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new conversation
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the remote cannot be reached or rejects setup
    async fn connect(&self) -> Result<Connection>;
}
