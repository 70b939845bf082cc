//! WebSocket transport for the live speech endpoint.
//!
//! `open` connects, sends `setup` and waits for `setupComplete`. After that a writer
//! task drains an unbounded command queue into the socket and a reader task turns
//! server frames into [`TransportEvent`]s.

use crate::wire::{ClientMessage, ServerEnvelope, Setup};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_voice::{
    EncodedFrame, OutboundSink, SessionConfig, ToolDeclaration, ToolRegistry, ToolResult,
    Transport, TransportEvent, TransportLink, VoiceError, VoiceResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time allowed between connecting and `setupComplete`.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound events buffered before the reader waits on the session.
const EVENT_QUEUE: usize = 64;

/// Opens live sessions over WebSocket.
#[derive(Debug, Clone)]
pub struct WsTransport {
    declarations: Vec<ToolDeclaration>,
    setup_timeout: Duration,
}

impl WsTransport {
    /// Transport advertising every tool in `tools` at setup.
    pub fn new(tools: &ToolRegistry) -> Self {
        Self {
            declarations: tools.declarations(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }
}

/// Endpoint URL with the API key appended as the `key` query parameter.
pub fn session_url(config: &SessionConfig) -> VoiceResult<String> {
    let endpoint = config.endpoint.trim();
    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
        return Err(VoiceError::Connection(format!(
            "endpoint must be a ws:// or wss:// URL, got '{}'",
            endpoint
        )));
    }
    Ok(match config.api_key.as_deref() {
        Some(key) if !key.is_empty() => {
            let sep = if endpoint.contains('?') { '&' } else { '?' };
            format!("{}{}key={}", endpoint, sep, key)
        }
        _ => endpoint.to_string(),
    })
}

fn connection_error(context: &str, err: impl std::fmt::Display) -> VoiceError {
    VoiceError::Connection(format!("{}: {}", context, err))
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, config: &SessionConfig) -> VoiceResult<TransportLink> {
        let url = session_url(config)?;
        if url.starts_with("wss://") && !cfg!(feature = "tls") {
            return Err(VoiceError::Connection(
                "wss:// endpoints need the `tls` feature".to_string(),
            ));
        }
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| connection_error("connect failed", e))?;
        let (mut write, mut read) = socket.split();

        let setup = ClientMessage::Setup(Setup::new(config, &self.declarations)).to_json()?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| connection_error("sending setup failed", e))?;

        tokio::time::timeout(self.setup_timeout, wait_for_setup(&mut read))
            .await
            .map_err(|_| {
                VoiceError::Connection(format!(
                    "no setupComplete within {:?}",
                    self.setup_timeout
                ))
            })??;
        info!(target: "parley::live", model = %config.model, "live session set up");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(write_loop(write, command_rx, event_tx.clone()));
        tokio::spawn(read_loop(read, event_tx));

        Ok(TransportLink {
            outbound: Arc::new(WsOutbound {
                commands: command_tx,
            }),
            inbound: event_rx,
        })
    }
}

/// Decode a data frame into an envelope. Control frames yield `None`.
fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn wait_for_setup(read: &mut SplitStream<Socket>) -> VoiceResult<()> {
    while let Some(frame) = read.next().await {
        let frame = frame.map_err(|e| connection_error("setup failed", e))?;
        if let Message::Close(close) = &frame {
            let reason = close.as_ref().map(|c| c.reason.to_string()).unwrap_or_default();
            return Err(VoiceError::Connection(format!(
                "closed during setup: {}",
                reason
            )));
        }
        let Some(text) = frame_text(frame) else {
            continue;
        };
        match ServerEnvelope::parse(&text) {
            Ok(envelope) if envelope.is_setup_complete() => return Ok(()),
            Ok(_) => debug!(target: "parley::live", "ignoring frame before setupComplete"),
            Err(e) => warn!(target: "parley::live", "unparsable frame during setup: {}", e),
        }
    }
    Err(VoiceError::Connection(
        "connection ended during setup".to_string(),
    ))
}

enum Command {
    Send(String),
    Close,
}

async fn write_loop(
    mut write: SplitSink<Socket, Message>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Send(text) => {
                if let Err(e) = write.send(Message::Text(text)).await {
                    let _ = events
                        .send(TransportEvent::Error(format!("send failed: {}", e)))
                        .await;
                    return;
                }
            }
            Command::Close => break,
        }
    }
    let _ = write.send(Message::Close(None)).await;
    let _ = write.close().await;
    debug!(target: "parley::live", "writer finished");
}

async fn read_loop(mut read: SplitStream<Socket>, events: mpsc::Sender<TransportEvent>) {
    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        };
        if let Message::Close(close) = &frame {
            let reason = close.as_ref().map(|c| c.reason.to_string());
            let _ = events.send(TransportEvent::Closed { reason }).await;
            return;
        }
        let Some(text) = frame_text(frame) else {
            continue;
        };
        let envelope = match ServerEnvelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "parley::live", "dropping unparsable server frame: {}", e);
                continue;
            }
        };
        if let Some(go_away) = &envelope.go_away {
            warn!(
                target: "parley::live",
                time_left = go_away.time_left.as_deref().unwrap_or("unknown"),
                "server is going away"
            );
        }
        if let Some(cancel) = &envelope.tool_call_cancellation {
            debug!(target: "parley::live", ids = ?cancel.ids, "tool calls cancelled");
        }
        if let Some(text) = envelope.text() {
            debug!(target: "parley::live", "model: {}", text);
        }
        if let Some(message) = envelope.to_server_message() {
            if events.send(TransportEvent::Message(message)).await.is_err() {
                // Session went away.
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed { reason: None }).await;
}

struct WsOutbound {
    commands: mpsc::UnboundedSender<Command>,
}

impl WsOutbound {
    fn enqueue(&self, message: ClientMessage) -> VoiceResult<()> {
        let text = message.to_json()?;
        self.commands
            .send(Command::Send(text))
            .map_err(|_| VoiceError::Connection("connection closed".to_string()))
    }
}

#[async_trait]
impl OutboundSink for WsOutbound {
    async fn send_audio(&self, frame: EncodedFrame) -> VoiceResult<()> {
        self.enqueue(ClientMessage::audio(&frame))
    }

    async fn send_tool_result(&self, result: ToolResult) -> VoiceResult<()> {
        self.enqueue(ClientMessage::tool_result(result))
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}
