//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-live/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LiveConfigFile {
    /// Audio pipeline tuning
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Remote conversation endpoint
    #[serde(default)]
    pub live: LiveFileConfig,
}

/// Audio pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Microphone sample rate (Hz)
    pub input_sample_rate: Option<u32>,

    /// Speaker sample rate (Hz)
    pub output_sample_rate: Option<u32>,

    /// Samples per outbound frame
    pub frame_size: Option<usize>,

    /// Delay before playback resumes after an underrun
    pub safety_margin_ms: Option<u64>,

    /// Visualizer tick period
    pub visualizer_interval_ms: Option<u64>,

    /// FFT size used by the volume meter
    pub fft_size: Option<usize>,
}

/// Live endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint
    pub url: Option<String>,

    /// API key (prefer the `GEMINI_API_KEY` env var)
    pub api_key: Option<String>,

    /// Model identifier (e.g. "models/gemini-2.5-flash-native-audio-preview-09-2025")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Orus")
    pub voice: Option<String>,

    /// System instruction sent with the setup message
    pub system_instruction: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LiveConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LiveConfigFile {
    let Some(path) = config_file_path() else {
        return LiveConfigFile::default();
    };

    if !path.exists() {
        return LiveConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LiveConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LiveConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-live/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-live")
            .join("config.toml")
    })
}
