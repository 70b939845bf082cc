//! Sample codec: normalized f32 <-> 16-bit little-endian PCM, plus base64 for the wire.
//!
//! All functions are pure. The only failures are structural: a PCM buffer whose length
//! is not a whole number of frames, or base64 text that does not decode.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Rate the remote endpoint expects for microphone audio.
pub const TARGET_INPUT_RATE: u32 = 16_000;

/// Rate of synthesized speech arriving from the remote endpoint.
pub const OUTPUT_RATE: u32 = 24_000;

/// Bytes per 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

/// Quantize one normalized sample to i16.
///
/// Negative values scale by 32768 and non-negative by 32767 so both ends of
/// [-1.0, 1.0] map exactly onto the i16 range. The fractional part is truncated.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`quantize`] up to quantization error. Output is in [-1.0, 1.0).
#[inline]
pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Pack already-quantized samples as little-endian bytes.
pub fn pack_i16(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Encode normalized samples as 16-bit little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &s in samples {
        out.extend_from_slice(&quantize(s).to_le_bytes());
    }
    out
}

/// Decode interleaved 16-bit little-endian PCM into one sample vector per channel.
pub fn decode_pcm16(bytes: &[u8], channels: u16) -> VoiceResult<Vec<Vec<f32>>> {
    if channels == 0 {
        return Err(VoiceError::MalformedAudio(
            "channel count must be at least 1".to_string(),
        ));
    }
    let frame_bytes = BYTES_PER_SAMPLE * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(VoiceError::MalformedAudio(format!(
            "{} bytes is not a multiple of {} ({} channel(s) of 16-bit PCM)",
            bytes.len(),
            frame_bytes,
            channels
        )));
    }

    let frames = bytes.len() / frame_bytes;
    let mut out = vec![Vec::with_capacity(frames); channels as usize];
    for frame in bytes.chunks_exact(frame_bytes) {
        for (ch, pair) in frame.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            out[ch].push(dequantize(i16::from_le_bytes([pair[0], pair[1]])));
        }
    }
    Ok(out)
}

/// Standard (padded) base64 of a byte buffer.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 text.
pub fn decode_base64(text: &str) -> VoiceResult<Vec<u8>> {
    Ok(STANDARD.decode(text.trim())?)
}

/// One captured block after resampling and encoding, ready for the transport.
///
/// Immutable once built; ownership moves to the transport on send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    data: Vec<u8>,
    sample_rate: u32,
}

impl EncodedFrame {
    /// Wrap PCM16 mono bytes recorded at `sample_rate`.
    pub fn new(data: Vec<u8>, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    /// Build a frame from quantized samples.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        Self::new(pack_i16(samples), sample_rate)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// MIME-style descriptor, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Base64 payload as carried on the wire.
    pub fn to_base64(&self) -> String {
        encode_base64(&self.data)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
