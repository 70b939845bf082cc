//! Session lifecycle: wires capture to the transport and the transport to playback.
//!
//! ```text
//!  Disconnected --start--> Connecting --opened--> Connected --stop / closed--> Disconnected
//!        any --transport or device error--> Error --stop--> Disconnected
//! ```
//!
//! Every resource a session holds lives in one `Running` slot guarded by a generation
//! counter. Teardown takes the slot, bumps the generation and releases each resource
//! independently, so a late event from an old session can never touch a new one.

use crate::capture::{CaptureBackend, CaptureStats, CaptureStream};
use crate::codec::{decode_base64, decode_pcm16};
use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{PlaybackScheduler, PlaybackSegment};
use crate::tools::ToolRegistry;
use crate::transport::{AudioPayload, OutboundSink, ServerMessage, Transport, TransportEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`SessionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        }
    }

    /// Connecting or connected.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Running {
    generation: u64,
    outbound: Option<Arc<dyn OutboundSink>>,
    capture: Option<CaptureStream>,
    inbound: Option<JoinHandle<()>>,
}

impl Running {
    fn invalidate(&mut self) -> Released {
        self.generation = self.generation.wrapping_add(1);
        Released {
            outbound: self.outbound.take(),
            capture: self.capture.take(),
            inbound: self.inbound.take(),
        }
    }
}

/// Resources taken out of `Running` for release.
#[derive(Default)]
struct Released {
    outbound: Option<Arc<dyn OutboundSink>>,
    capture: Option<CaptureStream>,
    inbound: Option<JoinHandle<()>>,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    capture_backend: Arc<dyn CaptureBackend>,
    scheduler: PlaybackScheduler,
    tools: ToolRegistry,
    state: watch::Sender<SessionState>,
    last_error: Mutex<Option<String>>,
    muted: Arc<AtomicBool>,
    running: Mutex<Running>,
}

/// Owns one live voice session at a time.
///
/// Cheap to clone; clones control the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        capture_backend: Arc<dyn CaptureBackend>,
        scheduler: PlaybackScheduler,
        tools: ToolRegistry,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                capture_backend,
                scheduler,
                tools,
                state,
                last_error: Mutex::new(None),
                muted: Arc::new(AtomicBool::new(false)),
                running: Mutex::new(Running::default()),
            }),
        }
    }

    /// Open the transport, then start capture. A no-op while connecting or connected.
    ///
    /// On failure the session is left in [`SessionState::Error`] with every resource
    /// released, and the error is returned.
    pub async fn start(&self) -> VoiceResult<()> {
        // Claim and generation bump share one critical section with stop().
        let generation = {
            let mut running = self.inner.lock_running();
            let claimed = self.inner.state.send_if_modified(|state| {
                if state.is_active() {
                    false
                } else {
                    *state = SessionState::Connecting;
                    true
                }
            });
            if !claimed {
                debug!(target: "parley::voice", "start ignored, session already active");
                return Ok(());
            }
            running.generation = running.generation.wrapping_add(1);
            running.generation
        };
        self.inner.set_last_error(None);
        info!(target: "parley::voice", endpoint = %self.inner.config.endpoint, "connecting");

        let link = match self.inner.transport.open(&self.inner.config).await {
            Ok(link) => link,
            Err(e) => {
                error!(target: "parley::voice", "transport failed to open: {}", e);
                self.inner.finish(generation, SessionState::Error, Some(&e));
                return Err(e);
            }
        };

        let outbound = link.outbound;
        {
            let mut running = self.inner.lock_running();
            if running.generation != generation {
                // Stopped while the handshake was in flight.
                drop(running);
                outbound.close();
                return Ok(());
            }
            running.outbound = Some(outbound.clone());
            self.inner.state.send_replace(SessionState::Connected);
        }
        info!(target: "parley::voice", "session connected");

        let capture = self
            .inner
            .capture_backend
            .acquire(&self.inner.config.capture_constraints())
            .and_then(|device| {
                CaptureStream::start(
                    device,
                    outbound.clone(),
                    &self.inner.config.capture_settings(),
                    self.inner.muted.clone(),
                )
            });
        let mut capture = match capture {
            Ok(capture) => capture,
            Err(e) => {
                error!(target: "parley::voice", "capture failed to start: {}", e);
                self.inner.finish(generation, SessionState::Error, Some(&e));
                return Err(e);
            }
        };

        let faults = capture
            .take_faults()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        let inbound = tokio::spawn(run_inbound(
            Arc::downgrade(&self.inner),
            link.inbound,
            faults,
            outbound,
            generation,
        ));

        let mut running = self.inner.lock_running();
        if running.generation != generation {
            // Torn down between connect and here; the pieces were never installed.
            drop(running);
            capture.stop();
            inbound.abort();
            return Ok(());
        }
        running.capture = Some(capture);
        running.inbound = Some(inbound);
        Ok(())
    }

    /// Release everything and return to [`SessionState::Disconnected`]. Valid from any
    /// state, never waits on the network, safe to call repeatedly.
    pub fn stop(&self) {
        let released = {
            let mut running = self.inner.lock_running();
            let released = running.invalidate();
            self.inner.state.send_replace(SessionState::Disconnected);
            released
        };
        let had_session = released.outbound.is_some() || released.capture.is_some();
        self.inner.release(released);
        if had_session {
            info!(target: "parley::voice", "session stopped");
        }
    }

    /// Mute or unmute the microphone. Muted blocks are discarded, not buffered.
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
        info!(target: "parley::voice", muted, "microphone mute changed");
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Message of the error that last moved the session to [`SessionState::Error`].
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Counters of the running capture stream, if any.
    pub fn capture_stats(&self) -> Option<CaptureStats> {
        self.inner.lock_running().capture.as_ref().map(CaptureStream::stats)
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("muted", &self.is_muted())
            .finish()
    }
}

impl Inner {
    fn lock_running(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_last_error(&self, message: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = message;
    }

    /// Release each resource independently of the others.
    fn release(&self, released: Released) {
        let Released {
            outbound,
            capture,
            inbound,
        } = released;
        if let Some(mut capture) = capture {
            capture.stop();
        }
        self.scheduler.reset();
        if let Some(inbound) = inbound {
            inbound.abort();
        }
        if let Some(outbound) = outbound {
            outbound.close();
        }
    }

    /// End the session identified by `generation` in `state`. Ignored when that
    /// session has already been replaced or stopped.
    fn finish(&self, generation: u64, state: SessionState, cause: Option<&VoiceError>) {
        let released = {
            let mut running = self.lock_running();
            if running.generation != generation {
                return;
            }
            running.invalidate()
        };
        self.release(released);
        if let Some(cause) = cause {
            self.set_last_error(Some(cause.to_string()));
        }
        self.state.send_replace(state);
        info!(target: "parley::voice", state = %state, "session ended");
    }

    /// Act on one server message. Errors only for a failure that ends the session.
    async fn handle_message(
        &self,
        message: ServerMessage,
        outbound: &Arc<dyn OutboundSink>,
    ) -> VoiceResult<()> {
        if message.interrupted {
            debug!(target: "parley::voice", "remote interruption");
            self.scheduler.flush();
        }

        for payload in &message.audio {
            match self.play(payload) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(target: "parley::voice", mime = %payload.mime_type, "dropping inbound audio: {}", e);
                }
            }
        }

        for call in &message.tool_calls {
            info!(target: "parley::voice", tool = %call.name, id = %call.id, "tool call");
            let result = self.tools.dispatch(call);
            if let Err(e) = outbound.send_tool_result(result).await {
                warn!(target: "parley::voice", tool = %call.name, "failed to relay tool result: {}", e);
            }
        }

        if message.turn_complete {
            debug!(target: "parley::voice", "turn complete");
        }
        Ok(())
    }

    fn play(&self, payload: &AudioPayload) -> VoiceResult<()> {
        if !payload.is_pcm() {
            return Err(VoiceError::MalformedAudio(format!(
                "unsupported audio type {}",
                payload.mime_type
            )));
        }
        let bytes = decode_base64(&payload.data)?;
        let channels = payload.channels_or(self.config.output_channels);
        let rate = payload.sample_rate_or(self.config.output_rate);
        let segment = PlaybackSegment::new(decode_pcm16(&bytes, channels)?, rate);
        if segment.frames() == 0 {
            return Ok(());
        }
        self.scheduler.enqueue(segment)?;
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let released = self
            .running
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .invalidate();
        self.release(released);
    }
}

async fn run_inbound(
    inner: Weak<Inner>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut faults: mpsc::UnboundedReceiver<VoiceError>,
    outbound: Arc<dyn OutboundSink>,
    generation: u64,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Message(message) => {
                        if let Err(e) = inner.handle_message(message, &outbound).await {
                            error!(target: "parley::voice", "output device failed: {}", e);
                            inner.finish(generation, SessionState::Error, Some(&e));
                            return;
                        }
                    }
                    TransportEvent::Closed { reason } => {
                        info!(target: "parley::voice", reason = reason.as_deref().unwrap_or(""), "transport closed");
                        inner.finish(generation, SessionState::Disconnected, None);
                        return;
                    }
                    TransportEvent::Error(message) => {
                        error!(target: "parley::voice", "transport error: {}", message);
                        let err = VoiceError::Connection(message);
                        inner.finish(generation, SessionState::Error, Some(&err));
                        return;
                    }
                }
            }
            Some(fault) = faults.recv() => {
                error!(target: "parley::voice", "capture device failed: {}", fault);
                if let Some(inner) = inner.upgrade() {
                    inner.finish(generation, SessionState::Error, Some(&fault));
                }
                return;
            }
        }
    }
    // Event stream ended without an explicit close.
    if let Some(inner) = inner.upgrade() {
        inner.finish(generation, SessionState::Disconnected, None);
    }
}
