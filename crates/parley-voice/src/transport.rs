//! The duplex channel to the remote speech endpoint, seen from the core.
//!
//! The core never speaks a concrete protocol. A [`Transport`] opens a
//! [`TransportLink`]: an outbound sink shared by the capture pipeline and the
//! session, plus an ordered stream of inbound [`TransportEvent`]s.

use crate::codec::{EncodedFrame, OUTPUT_RATE};
use crate::config::SessionConfig;
use crate::error::VoiceResult;
use crate::tools::{ToolCall, ToolResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opens sessions against the remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and complete any handshake. Fails with `VoiceError::Connection`.
    async fn open(&self, config: &SessionConfig) -> VoiceResult<TransportLink>;
}

/// Sending half of an open session. Implementations must tolerate concurrent calls.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Send one encoded microphone frame. Back-pressure policy belongs to the transport.
    async fn send_audio(&self, frame: EncodedFrame) -> VoiceResult<()>;

    /// Relay the result of a tool call.
    async fn send_tool_result(&self, result: ToolResult) -> VoiceResult<()>;

    /// Begin closing the connection. Must not wait on the network.
    fn close(&self);
}

/// An open session.
pub struct TransportLink {
    pub outbound: Arc<dyn OutboundSink>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Inbound events, delivered in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// Orderly close by either side.
    Closed { reason: Option<String> },
    /// The connection failed.
    Error(String),
}

/// One message from the remote endpoint. Any combination of fields may be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    pub audio: Vec<AudioPayload>,
    pub interrupted: bool,
    pub tool_calls: Vec<ToolCall>,
    pub turn_complete: bool,
}

impl ServerMessage {
    pub fn audio(payload: AudioPayload) -> Self {
        Self {
            audio: vec![payload],
            ..Default::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Default::default()
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            tool_calls: vec![call],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && !self.interrupted && self.tool_calls.is_empty() && !self.turn_complete
    }
}

/// Base64 PCM16 payload with its MIME descriptor, e.g. `audio/pcm;rate=24000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub mime_type: String,
    pub data: String,
}

impl AudioPayload {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// True for raw PCM payloads (`audio/pcm`, `audio/l16`).
    pub fn is_pcm(&self) -> bool {
        let base = self.mime_type.split(';').next().unwrap_or("").trim();
        base.eq_ignore_ascii_case("audio/pcm") || base.eq_ignore_ascii_case("audio/l16")
    }

    /// `rate=` parameter, or `default` when absent or unparsable.
    pub fn sample_rate_or(&self, default: u32) -> u32 {
        self.param("rate").and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// `channels=` parameter, or `default`.
    pub fn channels_or(&self, default: u16) -> u16 {
        self.param("channels").and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Sample rate assuming the 24 kHz output convention.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate_or(OUTPUT_RATE)
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.mime_type.split(';').skip(1).find_map(|p| {
            let (k, v) = p.split_once('=')?;
            k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
        })
    }
}
