//! Configuration management for live voice sessions

pub mod file;

use std::time::Duration;

use secrecy::SecretString;

use crate::voice::{FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, SAFETY_MARGIN};
use crate::{Error, Result};

/// Default bidirectional streaming endpoint
pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live model
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Orus";

/// Beacon live configuration
#[derive(Debug, Default)]
pub struct Config {
    /// Audio pipeline configuration
    pub session: SessionConfig,

    /// Live endpoint configuration
    pub live: LiveConfig,
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Microphone sample rate (Hz)
    pub input_sample_rate: u32,

    /// Speaker sample rate (Hz)
    pub output_sample_rate: u32,

    /// Samples per outbound frame
    pub frame_size: usize,

    /// Delay before playback resumes after an underrun
    pub safety_margin: Duration,

    /// Visualizer tick period
    pub visualizer_interval: Duration,

    /// FFT size used by the volume meter
    pub fft_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            safety_margin: SAFETY_MARGIN,
            visualizer_interval: Duration::from_millis(33),
            fft_size: 256,
        }
    }
}

impl SessionConfig {
    /// Check that rates and sizes are usable
    ///
    /// # Errors
    ///
    /// Returns `Config` if any rate or size is zero
    pub fn validate(&self) -> Result<()> {
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if self.frame_size == 0 {
            return Err(Error::Config("frame size must be non-zero".to_string()));
        }
        if self.fft_size == 0 {
            return Err(Error::Config("fft size must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Live endpoint configuration
#[derive(Debug)]
pub struct LiveConfig {
    /// WebSocket endpoint
    pub url: String,

    /// API key (from `GEMINI_API_KEY` env)
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// Optional system instruction
    pub system_instruction: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_LIVE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: None,
        }
    }
}

impl LiveConfig {
    /// Check that a live session can be opened
    ///
    /// # Errors
    ///
    /// Returns `Config` if the API key is missing or the URL is not a WebSocket URL
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_none() {
            return Err(Error::Config(
                "GEMINI_API_KEY required for live sessions".to_string(),
            ));
        }
        let url = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid live url {}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "live url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting session configuration is unusable
    pub fn load() -> Result<Self> {
        Self::from_file(file::load_config_file())
    }

    /// Resolve configuration from a parsed file, applying env overrides
    ///
    /// # Errors
    ///
    /// Returns error if the resulting session configuration is unusable
    pub fn from_file(fc: file::LiveConfigFile) -> Result<Self> {
        let defaults = SessionConfig::default();

        let session = SessionConfig {
            input_sample_rate: fc.session.input_sample_rate.unwrap_or(defaults.input_sample_rate),
            output_sample_rate: fc
                .session
                .output_sample_rate
                .unwrap_or(defaults.output_sample_rate),
            frame_size: env_parse("BEACON_LIVE_FRAME_SIZE")
                .or(fc.session.frame_size)
                .unwrap_or(defaults.frame_size),
            safety_margin: env_parse("BEACON_LIVE_SAFETY_MARGIN_MS")
                .or(fc.session.safety_margin_ms)
                .map_or(defaults.safety_margin, Duration::from_millis),
            visualizer_interval: env_parse("BEACON_LIVE_VISUALIZER_INTERVAL_MS")
                .or(fc.session.visualizer_interval_ms)
                .map_or(defaults.visualizer_interval, Duration::from_millis),
            fft_size: fc.session.fft_size.unwrap_or(defaults.fft_size),
        };
        session.validate()?;

        let live = LiveConfig {
            url: std::env::var("BEACON_LIVE_URL")
                .ok()
                .or(fc.live.url)
                .unwrap_or_else(|| DEFAULT_LIVE_URL.to_string()),
            api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .or(fc.live.api_key)
                .filter(|key| !key.is_empty())
                .map(SecretString::from),
            model: std::env::var("BEACON_LIVE_MODEL")
                .ok()
                .or(fc.live.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: std::env::var("BEACON_LIVE_VOICE")
                .ok()
                .or(fc.live.voice)
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            system_instruction: fc.live.system_instruction,
        };

        Ok(Self { session, live })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
