//! In-memory stand-ins for the transport, microphone and speaker.

#![allow(dead_code)]

use async_trait::async_trait;
use parley_voice::{
    encode_base64, encode_pcm16, AudioBlock, AudioPayload, BlockSink, CaptureBackend,
    CaptureConstraints, CaptureDevice, CompletionCallback, DeviceErrorKind, EncodedFrame, ErrorSink,
    OutboundSink, OutputDevice, PlaybackScheduler, PlaybackSegment, ScheduledPlayback,
    SessionConfig, SessionController, ToolRegistry, ToolResult, Transport, TransportEvent,
    TransportLink, VoiceError, VoiceResult,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Mono PCM16 payload of `seconds` of silence at 24 kHz.
pub fn pcm_payload(seconds: f64) -> AudioPayload {
    let frames = (seconds * 24_000.0).round() as usize;
    AudioPayload::new(
        "audio/pcm;rate=24000",
        encode_base64(&encode_pcm16(&vec![0.0; frames])),
    )
}

// --- transport -------------------------------------------------------------

#[derive(Default)]
pub struct FakeOutbound {
    pub frames: Mutex<Vec<EncodedFrame>>,
    pub tool_results: Mutex<Vec<ToolResult>>,
    pub closes: AtomicUsize,
}

impl FakeOutbound {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn tool_result_count(&self) -> usize {
        self.tool_results.lock().unwrap().len()
    }
}

#[async_trait]
impl OutboundSink for FakeOutbound {
    async fn send_audio(&self, frame: EncodedFrame) -> VoiceResult<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn send_tool_result(&self, result: ToolResult) -> VoiceResult<()> {
        self.tool_results.lock().unwrap().push(result);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub outbound: Arc<FakeOutbound>,
    pub refuse: AtomicBool,
    pub opens: AtomicUsize,
    /// When set, `open` waits for `release_open` before completing.
    pub gated: AtomicBool,
    gate: Notify,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl FakeTransport {
    /// Sender feeding the most recently opened session.
    pub fn events(&self) -> mpsc::Sender<TransportEvent> {
        self.events
            .lock()
            .unwrap()
            .clone()
            .expect("transport was never opened")
    }

    pub fn release_open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _config: &SessionConfig) -> VoiceResult<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(VoiceError::Connection("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(32);
        *self.events.lock().unwrap() = Some(tx);
        Ok(TransportLink {
            outbound: self.outbound.clone(),
            inbound: rx,
        })
    }
}

// --- capture ---------------------------------------------------------------

/// Microphone whose blocks are pushed by the test.
pub struct FakeMicrophone {
    pub rate: u32,
    pub refuse: Mutex<Option<DeviceErrorKind>>,
    pub acquires: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    sink: Arc<Mutex<Option<BlockSink>>>,
    on_error: Arc<Mutex<Option<ErrorSink>>>,
}

impl FakeMicrophone {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            refuse: Mutex::new(None),
            acquires: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            sink: Arc::new(Mutex::new(None)),
            on_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    /// Deliver one mono block as the realtime callback would.
    pub fn push(&self, samples: Vec<f32>) {
        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            sink(AudioBlock::mono(samples, self.rate));
        }
    }

    /// Report a failure from the running device, as an unplugged microphone would.
    pub fn fail(&self, kind: DeviceErrorKind, message: &str) {
        if let Some(report) = self.on_error.lock().unwrap().as_mut() {
            report(VoiceError::device(kind, message));
        }
    }
}

impl CaptureBackend for FakeMicrophone {
    fn acquire(&self, _constraints: &CaptureConstraints) -> VoiceResult<Box<dyn CaptureDevice>> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *self.refuse.lock().unwrap() {
            return Err(VoiceError::device(kind, "microphone refused"));
        }
        Ok(Box::new(FakeMicrophoneDevice {
            rate: self.rate,
            sink: self.sink.clone(),
            on_error: self.on_error.clone(),
            stops: self.stops.clone(),
        }))
    }
}

struct FakeMicrophoneDevice {
    rate: u32,
    sink: Arc<Mutex<Option<BlockSink>>>,
    on_error: Arc<Mutex<Option<ErrorSink>>>,
    stops: Arc<AtomicUsize>,
}

impl CaptureDevice for FakeMicrophoneDevice {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        1
    }

    fn start(
        &mut self,
        _block_size: usize,
        sink: BlockSink,
        on_error: ErrorSink,
    ) -> VoiceResult<()> {
        *self.sink.lock().unwrap() = Some(sink);
        *self.on_error.lock().unwrap() = Some(on_error);
        Ok(())
    }

    fn stop(&mut self) {
        if self.sink.lock().unwrap().take().is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// --- output ----------------------------------------------------------------

/// Speaker with a hand-driven clock. Segments "finish" only when the test says so.
#[derive(Default)]
pub struct FakeSpeaker {
    now: Mutex<f64>,
    /// When set, scheduling fails as a vanished output device would.
    pub unplugged: AtomicBool,
    pub starts: Mutex<Vec<f64>>,
    pending: Mutex<Vec<(Arc<AtomicBool>, CompletionCallback)>>,
}

impl FakeSpeaker {
    pub fn set_now(&self, t: f64) {
        *self.now.lock().unwrap() = t;
    }

    pub fn last_start(&self) -> Option<f64> {
        self.starts.lock().unwrap().last().copied()
    }

    /// Complete every segment that has not been stopped.
    pub fn finish_all(&self) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for (stopped, done) in pending {
            if !stopped.load(Ordering::SeqCst) {
                done();
            }
        }
    }
}

struct FakeHandle {
    stopped: Arc<AtomicBool>,
    count: Arc<FakeSpeakerCounter>,
}

#[derive(Default)]
struct FakeSpeakerCounter(AtomicUsize);

impl ScheduledPlayback for FakeHandle {
    fn stop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.count.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Shared speaker wrapper so tests keep a handle while the scheduler owns another.
pub struct SpeakerHandle {
    pub speaker: Arc<FakeSpeaker>,
    counter: Arc<FakeSpeakerCounter>,
}

impl SpeakerHandle {
    pub fn stopped(&self) -> usize {
        self.counter.0.load(Ordering::SeqCst)
    }
}

impl OutputDevice for SpeakerHandle {
    fn now(&self) -> f64 {
        *self.speaker.now.lock().unwrap()
    }

    fn schedule(
        &self,
        _segment: &PlaybackSegment,
        start_at: f64,
        on_complete: CompletionCallback,
    ) -> VoiceResult<Box<dyn ScheduledPlayback>> {
        if self.speaker.unplugged.load(Ordering::SeqCst) {
            return Err(VoiceError::device(
                DeviceErrorKind::Unavailable,
                "speaker unplugged",
            ));
        }
        self.speaker.starts.lock().unwrap().push(start_at);
        let stopped = Arc::new(AtomicBool::new(false));
        self.speaker
            .pending
            .lock()
            .unwrap()
            .push((stopped.clone(), on_complete));
        Ok(Box::new(FakeHandle {
            stopped,
            count: self.counter.clone(),
        }))
    }
}

/// Scheduler over a fresh fake speaker.
pub fn speaker_scheduler() -> (Arc<SpeakerHandle>, PlaybackScheduler) {
    let handle = Arc::new(SpeakerHandle {
        speaker: Arc::new(FakeSpeaker::default()),
        counter: Arc::new(FakeSpeakerCounter::default()),
    });
    let scheduler = PlaybackScheduler::new(handle.clone());
    (handle, scheduler)
}

// --- session ---------------------------------------------------------------

pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub microphone: Arc<FakeMicrophone>,
    pub speaker: Arc<SpeakerHandle>,
    pub controller: SessionController,
}

impl Harness {
    pub fn new(tools: ToolRegistry) -> Self {
        init_tracing();
        let transport = Arc::new(FakeTransport::default());
        let microphone = Arc::new(FakeMicrophone::new(48_000));
        let (speaker, scheduler) = speaker_scheduler();
        let controller = SessionController::new(
            SessionConfig::default(),
            transport.clone(),
            microphone.clone(),
            scheduler,
            tools,
        );
        Self {
            transport,
            microphone,
            speaker,
            controller,
        }
    }
}
