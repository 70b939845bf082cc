//! Speaker output on Rodio.
//!
//! Every scheduled segment gets its own `Sink`: silence up to its start time, the
//! samples, then an empty callback source that reports natural completion. Stopping
//! the sink cancels whatever has not played yet, the callback included.

use crate::error::{DeviceErrorKind, VoiceError, VoiceResult};
use crate::playback::{CompletionCallback, OutputDevice, PlaybackSegment, ScheduledPlayback};
use rodio::buffer::SamplesBuffer;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::source::EmptyCallback;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source, StreamError};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Output device backed by a Rodio output stream.
///
/// The device clock is seconds since [`RodioOutput::open`].
pub struct RodioOutput {
    handle: OutputStreamHandle,
    opened_at: Instant,
    shutdown: Mutex<Option<(std_mpsc::Sender<()>, thread::JoinHandle<()>)>>,
}

impl RodioOutput {
    /// Open the named output device, or the host default.
    pub fn open(device: Option<&str>) -> VoiceResult<Self> {
        let requested = device.map(str::to_string);
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<OutputStreamHandle>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        // OutputStream is !Send; it stays on this thread until shutdown.
        let thread = thread::Builder::new()
            .name("parley-output".to_string())
            .spawn(move || match open_stream(requested.as_deref()) {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let handle = ready_rx.recv().unwrap_or_else(|_| {
            Err(VoiceError::Playback("output thread exited during open".to_string()))
        });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };

        info!(target: "parley::voice", device = device.unwrap_or("default"), "🔊 output device opened");
        Ok(Self {
            handle,
            opened_at: Instant::now(),
            shutdown: Mutex::new(Some((shutdown_tx, thread))),
        })
    }

    /// Close the output stream. Segments still playing are cut off.
    pub fn close(&self) {
        let worker = self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((shutdown, thread)) = worker {
            let _ = shutdown.send(());
            if thread.join().is_err() {
                warn!(target: "parley::voice", "output thread panicked");
            }
            info!(target: "parley::voice", "🔊 output device closed");
        }
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(name: Option<&str>) -> VoiceResult<(OutputStream, OutputStreamHandle)> {
    let opened = match name {
        None => OutputStream::try_default(),
        Some(wanted) => {
            let host = rodio::cpal::default_host();
            let device = host
                .output_devices()
                .map_err(|e| VoiceError::device(DeviceErrorKind::Unavailable, e.to_string()))?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| {
                    VoiceError::device(
                        DeviceErrorKind::NotFound,
                        format!("output device '{}' not found", wanted),
                    )
                })?;
            OutputStream::try_from_device(&device)
        }
    };
    opened.map_err(|e| {
        let kind = match e {
            StreamError::NoDevice => DeviceErrorKind::NotFound,
            _ => DeviceErrorKind::Unavailable,
        };
        VoiceError::device(kind, e.to_string())
    })
}

impl OutputDevice for RodioOutput {
    fn now(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(
        &self,
        segment: &PlaybackSegment,
        start_at: f64,
        on_complete: CompletionCallback,
    ) -> VoiceResult<Box<dyn ScheduledPlayback>> {
        let sink = Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;

        let lead = (start_at - self.now()).max(0.0);
        let samples = SamplesBuffer::new(
            segment.channel_count().max(1),
            segment.sample_rate,
            segment.interleaved(),
        );
        sink.append(samples.delay(Duration::from_secs_f64(lead)));

        // EmptyCallback wants Fn; the completion is FnOnce.
        let once = Mutex::new(Some(on_complete));
        sink.append(EmptyCallback::<f32>::new(Box::new(move || {
            if let Some(cb) = once.lock().unwrap_or_else(|p| p.into_inner()).take() {
                cb();
            }
        })));

        debug!(target: "parley::voice", start_at, lead, frames = segment.frames(), "segment queued on output");
        Ok(Box::new(RodioPlayback { sink: Some(sink) }))
    }
}

struct RodioPlayback {
    sink: Option<Sink>,
}

impl ScheduledPlayback for RodioPlayback {
    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }
}
