//! # Parley Voice - Full-Duplex Voice Session Core
//!
//! Streams microphone audio to a live speech endpoint and plays the synthesized reply
//! back gaplessly, cutting playback off the moment the remote side signals barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       SessionController                          │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐                │
//! │  │ Capture    │ → │ Resampler  │ → │ PCM16 +    │ → Transport out │
//! │  │ (device)   │   │ (→ 16 kHz) │   │ base64     │                │
//! │  └────────────┘   └────────────┘   └────────────┘                │
//! │                                                                  │
//! │  Transport in → decode → ┌────────────────────┐ → Output device  │
//! │        │                 │ PlaybackScheduler  │                  │
//! │        └─ interrupted ─→ │ (flush on barge-in)│                  │
//! │        └─ tool call ──→ ToolRegistry → tool result → Transport    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Devices and the network are reached only through the traits in [`capture`],
//! [`playback`] and [`transport`]. CPAL/Rodio implementations live behind the
//! `devices` feature.

pub mod capture;
pub mod codec;
pub mod config;
#[cfg(feature = "devices")]
pub mod devices;
pub mod error;
pub mod playback;
pub mod resample;
pub mod session;
pub mod tools;
pub mod transport;

pub use capture::{
    BlockSink, CaptureBackend, CaptureConstraints, CaptureDevice, CaptureSettings, CaptureStats,
    CaptureStream, ErrorSink,
};
pub use codec::{
    decode_base64, decode_pcm16, encode_base64, encode_pcm16, EncodedFrame, OUTPUT_RATE,
    TARGET_INPUT_RATE,
};
pub use config::SessionConfig;
#[cfg(feature = "devices")]
pub use devices::{list_input_devices, list_output_devices, CpalCapture, RodioOutput};
pub use error::{DeviceErrorKind, VoiceError, VoiceResult};
pub use playback::{
    CompletionCallback, OutputDevice, PlaybackScheduler, PlaybackSegment, ScheduledPlayback,
};
pub use resample::{resample, AudioBlock};
pub use session::{SessionController, SessionState};
pub use tools::{ToolCall, ToolDeclaration, ToolHandler, ToolRegistry, ToolResult};
pub use transport::{
    AudioPayload, OutboundSink, ServerMessage, Transport, TransportEvent, TransportLink,
};
