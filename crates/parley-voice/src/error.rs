//! Error types for the Parley voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Why a capture or output device could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The platform refused access (permissions, privacy settings).
    Denied,
    /// No matching device exists.
    NotFound,
    /// The device exists but cannot be opened right now.
    Unavailable,
}

impl DeviceErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceErrorKind::Denied => "denied",
            DeviceErrorKind::NotFound => "not_found",
            DeviceErrorKind::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the voice pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error ({kind}): {message}")]
    Device {
        kind: DeviceErrorKind,
        message: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Malformed audio: {0}")]
    MalformedAudio(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Playback timeline violation: {0}")]
    SchedulingViolation(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    pub fn device(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        VoiceError::Device {
            kind,
            message: message.into(),
        }
    }

    /// Errors that end the session. Per-frame decode problems and timeline
    /// violations are recovered locally.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VoiceError::MalformedAudio(_)
                | VoiceError::InvalidEncoding(_)
                | VoiceError::SchedulingViolation(_)
        )
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::InvalidEncoding(err.to_string())
    }
}

#[cfg(feature = "devices")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::device(DeviceErrorKind::Unavailable, err.to_string())
    }
}

#[cfg(feature = "devices")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        let kind = match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceErrorKind::NotFound,
            _ => DeviceErrorKind::Unavailable,
        };
        VoiceError::device(kind, err.to_string())
    }
}

#[cfg(feature = "devices")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        let kind = match err {
            cpal::BuildStreamError::DeviceNotAvailable => DeviceErrorKind::NotFound,
            // Backends surface permission refusals as backend-specific errors.
            cpal::BuildStreamError::BackendSpecific { ref err }
                if err.description.to_lowercase().contains("permission") =>
            {
                DeviceErrorKind::Denied
            }
            _ => DeviceErrorKind::Unavailable,
        };
        VoiceError::device(kind, err.to_string())
    }
}

/// Raised by a running stream, e.g. when the device disappears.
#[cfg(feature = "devices")]
impl From<cpal::StreamError> for VoiceError {
    fn from(err: cpal::StreamError) -> Self {
        let kind = match err {
            cpal::StreamError::DeviceNotAvailable => DeviceErrorKind::NotFound,
            _ => DeviceErrorKind::Unavailable,
        };
        VoiceError::device(kind, err.to_string())
    }
}

#[cfg(feature = "devices")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::device(DeviceErrorKind::Unavailable, err.to_string())
    }
}
