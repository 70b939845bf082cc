//! Microphone capture on CPAL.

use crate::capture::{BlockSink, CaptureBackend, CaptureConstraints, CaptureDevice, ErrorSink};
use crate::error::{DeviceErrorKind, VoiceError, VoiceResult};
use crate::resample::AudioBlock;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tracing::{info, warn};

/// Capture backend over the host's default CPAL host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for CpalCapture {
    fn acquire(&self, constraints: &CaptureConstraints) -> VoiceResult<Box<dyn CaptureDevice>> {
        let device = find_input_device(constraints.device.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let supported = device.default_input_config()?;

        info!(
            target: "parley::voice",
            device = %name,
            rate = supported.sample_rate().0,
            channels = supported.channels(),
            format = ?supported.sample_format(),
            "🎤 input device acquired"
        );

        Ok(Box::new(CpalInputDevice {
            requested: constraints.device.clone(),
            name,
            config: supported.config(),
            sample_format: supported.sample_format(),
            worker: None,
        }))
    }
}

fn find_input_device(name: Option<&str>) -> VoiceResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host.default_input_device().ok_or_else(|| {
            VoiceError::device(DeviceErrorKind::NotFound, "no default input device")
        }),
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                VoiceError::device(
                    DeviceErrorKind::NotFound,
                    format!("input device '{}' not found", wanted),
                )
            }),
    }
}

struct Worker {
    shutdown: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// An acquired CPAL input device. The stream lives on its own thread between
/// `start` and `stop`.
pub struct CpalInputDevice {
    requested: Option<String>,
    name: String,
    config: StreamConfig,
    sample_format: SampleFormat,
    worker: Option<Worker>,
}

impl CpalInputDevice {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CaptureDevice for CpalInputDevice {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn start(
        &mut self,
        block_size: usize,
        sink: BlockSink,
        on_error: ErrorSink,
    ) -> VoiceResult<()> {
        if self.worker.is_some() {
            return Err(VoiceError::device(
                DeviceErrorKind::Unavailable,
                "capture already started",
            ));
        }

        let requested = self.requested.clone();
        let config = self.config.clone();
        let format = self.sample_format;
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        // The cpal stream is !Send on some hosts; it is created, played and dropped here.
        let thread = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let stream = find_input_device(requested.as_deref()).and_then(|device| {
                    let stream = build_stream(&device, &config, format, block_size.max(1), sink, on_error)?;
                    stream.play()?;
                    Ok(stream)
                });
                match stream {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Blocks until stop() sends or drops the shutdown sender.
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(VoiceError::device(
                DeviceErrorKind::Unavailable,
                "capture thread exited during start",
            ))
        });
        match started {
            Ok(()) => {
                self.worker = Some(Worker {
                    shutdown: shutdown_tx,
                    thread,
                });
                Ok(())
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            // Joining guarantees the stream, and with it the callback, is gone.
            if worker.thread.join().is_err() {
                warn!(target: "parley::voice", "capture thread panicked");
            }
            info!(target: "parley::voice", device = %self.name, "🎤 input device released");
        }
    }
}

impl Drop for CpalInputDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    block_size: usize,
    sink: BlockSink,
    on_error: ErrorSink,
) -> VoiceResult<cpal::Stream> {
    match format {
        SampleFormat::F32 => build_typed_stream::<f32>(device, config, block_size, sink, on_error),
        SampleFormat::I16 => build_typed_stream::<i16>(device, config, block_size, sink, on_error),
        SampleFormat::U16 => build_typed_stream::<u16>(device, config, block_size, sink, on_error),
        SampleFormat::I32 => build_typed_stream::<i32>(device, config, block_size, sink, on_error),
        other => Err(VoiceError::device(
            DeviceErrorKind::Unavailable,
            format!("unsupported input sample format {:?}", other),
        )),
    }
}

/// Accumulate interleaved device samples into blocks of `block_size` frames.
fn build_typed_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    block_size: usize,
    mut sink: BlockSink,
    mut on_error: ErrorSink,
) -> VoiceResult<cpal::Stream>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let rate = config.sample_rate.0;
    let block_len = block_size * channels.max(1) as usize;
    let mut pending: Vec<f32> = Vec::with_capacity(block_len);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push(f32::from_sample(sample));
                if pending.len() == block_len {
                    let samples = std::mem::replace(&mut pending, Vec::with_capacity(block_len));
                    sink(AudioBlock::new(samples, rate, channels));
                }
            }
        },
        move |err| {
            warn!(target: "parley::voice", "input stream error: {}", err);
            on_error(VoiceError::from(err));
        },
        None,
    )?;
    Ok(stream)
}
