//! Error types for live voice sessions

use thiserror::Error;

/// Result type alias for live session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a live voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone could not be acquired
    #[error("permission error: {0}")]
    Permission(String),

    /// Transport could not be opened
    #[error("connection error: {0}")]
    Connection(String),

    /// Transport failed after it was opened
    #[error("transport error: {0}")]
    Transport(String),

    /// A single inbound audio frame was malformed
    #[error("audio decode error: {0}")]
    AudioDecode(String),

    /// Audio device error other than a denied microphone
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A pending start was overtaken by a stop request
    #[error("session start cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether the error ends the session (as opposed to a recoverable frame error)
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::AudioDecode(_))
    }
}
