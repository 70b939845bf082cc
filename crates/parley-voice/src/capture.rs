//! Microphone capture: device blocks → resample → PCM16 → outbound transport.
//!
//! The device callback runs on a realtime thread and does only two things: check the
//! mute flag and `try_send` the block into a bounded channel. Resampling, encoding and
//! the network send happen on a Tokio task so the callback never waits on I/O.

use crate::codec::EncodedFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::resample::{resample, AudioBlock};
use crate::transport::OutboundSink;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives blocks on the device's realtime context. Must not block.
pub type BlockSink = Box<dyn FnMut(AudioBlock) + Send + 'static>;

/// Receives device failures raised after `start`, e.g. the microphone being
/// unplugged. Called from the device's own context; must not block.
pub type ErrorSink = Box<dyn FnMut(VoiceError) + Send + 'static>;

/// What to ask the capture backend for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Device name; `None` selects the host default.
    pub device: Option<String>,
    /// Frames per delivered block.
    pub block_size: usize,
}

/// Acquires capture devices. Fails with `VoiceError::Device`.
pub trait CaptureBackend: Send + Sync {
    fn acquire(&self, constraints: &CaptureConstraints) -> VoiceResult<Box<dyn CaptureDevice>>;
}

/// An acquired microphone. Native format is discovered at acquire time.
pub trait CaptureDevice: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Begin delivering blocks of `block_size` frames to `sink`. Failures after a
    /// successful start go to `on_error`.
    fn start(&mut self, block_size: usize, sink: BlockSink, on_error: ErrorSink)
        -> VoiceResult<()>;

    /// Release the device. No block is delivered after this returns. Idempotent.
    fn stop(&mut self);
}

/// Pipeline parameters for one [`CaptureStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub block_size: usize,
    /// Rate of the encoded frames sent to the transport.
    pub target_rate: u32,
    /// Blocks buffered between the callback and the encoder.
    pub queue_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            block_size: 4096,
            target_rate: crate::codec::TARGET_INPUT_RATE,
            queue_capacity: 8,
        }
    }
}

/// Counters for one capture stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Blocks delivered by the device while the stream was active.
    pub blocks_captured: u64,
    /// Blocks discarded because the stream was muted.
    pub blocks_muted: u64,
    /// Blocks discarded because the encoder queue was full.
    pub blocks_dropped: u64,
    /// Frames accepted by the outbound sink.
    pub frames_sent: u64,
}

#[derive(Default)]
struct Counters {
    blocks_captured: AtomicU64,
    blocks_muted: AtomicU64,
    blocks_dropped: AtomicU64,
    frames_sent: AtomicU64,
}

struct Shared {
    active: AtomicBool,
    muted: Arc<AtomicBool>,
    counters: Counters,
}

/// A running capture pipeline bound to one device and one outbound sink.
pub struct CaptureStream {
    device: Box<dyn CaptureDevice>,
    shared: Arc<Shared>,
    pipeline: Option<JoinHandle<()>>,
    faults: Option<mpsc::UnboundedReceiver<VoiceError>>,
}

impl CaptureStream {
    /// Start capturing from `device` into `outbound`.
    ///
    /// `muted` is shared with the caller so mute state survives stream restarts.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        mut device: Box<dyn CaptureDevice>,
        outbound: Arc<dyn OutboundSink>,
        settings: &CaptureSettings,
        muted: Arc<AtomicBool>,
    ) -> VoiceResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Config(format!("capture requires a Tokio runtime: {}", e)))?;

        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            muted,
            counters: Counters::default(),
        });

        let (block_tx, block_rx) = mpsc::channel::<AudioBlock>(settings.queue_capacity.max(1));
        let pipeline = runtime.spawn(run_pipeline(
            block_rx,
            outbound,
            shared.clone(),
            settings.target_rate,
        ));

        let sink_shared = shared.clone();
        let sink: BlockSink = Box::new(move |block| {
            if !sink_shared.active.load(Ordering::Acquire) {
                return;
            }
            let counters = &sink_shared.counters;
            counters.blocks_captured.fetch_add(1, Ordering::Relaxed);
            if sink_shared.muted.load(Ordering::Relaxed) {
                counters.blocks_muted.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if block_tx.try_send(block).is_err() {
                counters.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        });

        let (fault_tx, fault_rx) = mpsc::unbounded_channel::<VoiceError>();
        let fault_shared = shared.clone();
        let on_error: ErrorSink = Box::new(move |err| {
            if fault_shared.active.load(Ordering::Acquire) {
                let _ = fault_tx.send(err);
            }
        });

        if let Err(e) = device.start(settings.block_size, sink, on_error) {
            shared.active.store(false, Ordering::Release);
            pipeline.abort();
            device.stop();
            return Err(e);
        }

        info!(
            target: "parley::voice",
            device_rate = device.sample_rate(),
            channels = device.channels(),
            target_rate = settings.target_rate,
            block_size = settings.block_size,
            "capture started"
        );

        Ok(Self {
            device,
            shared,
            pipeline: Some(pipeline),
            faults: Some(fault_rx),
        })
    }

    /// Device failures reported while the stream runs. Yields nothing after `stop`.
    /// Can be taken once.
    pub fn take_faults(&mut self) -> Option<mpsc::UnboundedReceiver<VoiceError>> {
        self.faults.take()
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CaptureStats {
        let c = &self.shared.counters;
        CaptureStats {
            blocks_captured: c.blocks_captured.load(Ordering::Relaxed),
            blocks_muted: c.blocks_muted.load(Ordering::Relaxed),
            blocks_dropped: c.blocks_dropped.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
        }
    }

    /// Release the device and cancel the encoder. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if !self.shared.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.device.stop();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
        let stats = self.stats();
        info!(
            target: "parley::voice",
            captured = stats.blocks_captured,
            muted = stats.blocks_muted,
            dropped = stats.blocks_dropped,
            sent = stats.frames_sent,
            "capture stopped"
        );
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream")
            .field("active", &self.is_active())
            .field("muted", &self.is_muted())
            .field("stats", &self.stats())
            .finish()
    }
}

async fn run_pipeline(
    mut blocks: mpsc::Receiver<AudioBlock>,
    outbound: Arc<dyn OutboundSink>,
    shared: Arc<Shared>,
    target_rate: u32,
) {
    while let Some(block) = blocks.recv().await {
        if !shared.active.load(Ordering::Acquire) {
            break;
        }
        let samples = resample(&block, target_rate);
        if samples.is_empty() {
            continue;
        }
        let frame = EncodedFrame::from_samples(&samples, target_rate);
        let bytes = frame.len();
        match outbound.send_audio(frame).await {
            Ok(()) => {
                shared.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => {
                // The transport reports the failure on its inbound side.
                warn!(target: "parley::voice", "outbound audio failed, stopping encoder: {}", e);
                break;
            }
            Err(e) => {
                debug!(target: "parley::voice", bytes, "audio frame rejected: {}", e);
            }
        }
    }
    debug!(target: "parley::voice", "capture pipeline finished");
}
