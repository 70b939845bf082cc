//! Hardware backends: microphone capture via CPAL, speaker output via Rodio.
//!
//! Both libraries hand out stream objects that are `!Send` on some hosts, so each
//! backend parks its stream on a dedicated thread and talks to it over channels.

mod input;
mod output;

pub use input::{CpalCapture, CpalInputDevice};
pub use output::RodioOutput;

use crate::error::VoiceResult;
use cpal::traits::{DeviceTrait, HostTrait};

/// Names of the host's input devices.
pub fn list_input_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host.input_devices()? {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Names of the host's output devices.
pub fn list_output_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host.output_devices()? {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}
