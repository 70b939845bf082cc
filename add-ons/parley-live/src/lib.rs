//! Parley Live - WebSocket transport and built-in tools for `parley-voice` sessions.

pub mod tools;
pub mod wire;
pub mod ws;

pub use tools::builtin_tools;
pub use ws::{session_url, WsTransport, DEFAULT_SETUP_TIMEOUT};
