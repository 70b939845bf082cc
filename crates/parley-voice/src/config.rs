//! Session configuration.
//!
//! Loaded with the `config` crate: built-in defaults, then a TOML file
//! (`PARLEY_CONFIG` or `config/parley.toml`), then `PARLEY__*` environment variables.

use crate::capture::{CaptureConstraints, CaptureSettings};
use crate::codec::{OUTPUT_RATE, TARGET_INPUT_RATE};
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/parley.toml";

/// Everything a session needs to connect and run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// WebSocket URL of the live speech endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// API key. Falls back to `GEMINI_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prebuilt voice name for synthesized speech.
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub system_instruction: Option<String>,
    /// Capture block size in frames.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_target_input_rate")]
    pub target_input_rate: u32,
    /// Rate assumed for inbound audio without a `rate=` parameter.
    #[serde(default = "default_output_rate")]
    pub output_rate: u32,
    /// Channels assumed for inbound audio without a `channels=` parameter.
    #[serde(default = "default_output_channels")]
    pub output_channels: u16,
    /// Blocks buffered between the capture callback and the encoder before dropping.
    #[serde(default = "default_capture_queue")]
    pub capture_queue: usize,
    /// Input device name; the host default when unset.
    #[serde(default)]
    pub input_device: Option<String>,
    /// Output device name; the host default when unset.
    #[serde(default)]
    pub output_device: Option<String>,
}

fn default_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_model() -> String {
    "models/gemini-2.0-flash-exp".to_string()
}

fn default_block_size() -> usize {
    4096
}

fn default_target_input_rate() -> u32 {
    TARGET_INPUT_RATE
}

fn default_output_rate() -> u32 {
    OUTPUT_RATE
}

fn default_output_channels() -> u16 {
    1
}

fn default_capture_queue() -> usize {
    8
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            voice: None,
            system_instruction: None,
            block_size: default_block_size(),
            target_input_rate: default_target_input_rate(),
            output_rate: default_output_rate(),
            output_channels: default_output_channels(),
            capture_queue: default_capture_queue(),
            input_device: None,
            output_device: None,
        }
    }
}

impl SessionConfig {
    /// Load from `PARLEY_CONFIG` (or [`DEFAULT_CONFIG_PATH`]) plus `PARLEY__*` env vars.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from a specific file. A missing file is not an error; defaults apply.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .set_default("endpoint", default_endpoint())?
            .set_default("model", default_model())?
            .set_default("block_size", default_block_size() as i64)?
            .set_default("target_input_rate", default_target_input_rate() as i64)?
            .set_default("output_rate", default_output_rate() as i64)?
            .set_default("output_channels", default_output_channels() as i64)?
            .set_default("capture_queue", default_capture_queue() as i64)?;

        let builder = if path.exists() {
            tracing::debug!(target: "parley::voice", path = %path.display(), "loading config file");
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PARLEY").separator("__"))
            .build()?;

        let mut cfg: SessionConfig = built.try_deserialize()?;
        if cfg.api_key.as_deref().map_or(true, str::is_empty) {
            cfg.api_key = std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty());
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(VoiceError::Config("endpoint must not be empty".to_string()));
        }
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(VoiceError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                endpoint
            )));
        }
        let zero = [
            ("block_size", self.block_size == 0),
            ("target_input_rate", self.target_input_rate == 0),
            ("output_rate", self.output_rate == 0),
            ("output_channels", self.output_channels == 0),
            ("capture_queue", self.capture_queue == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(VoiceError::Config(format!("{} must be greater than zero", field)));
        }
        Ok(())
    }

    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            device: self.input_device.clone(),
            block_size: self.block_size,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            block_size: self.block_size,
            target_rate: self.target_input_rate,
            queue_capacity: self.capture_queue,
        }
    }
}
