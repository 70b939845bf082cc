//! Parley Live: talk to a live speech model from the terminal.
//!
//! Flags:
//! - `--list-devices` print audio devices and exit
//! - `--muted` start with the microphone muted

use anyhow::Context as _;
use parley_live::{builtin_tools, WsTransport};
use parley_voice::{
    list_input_devices, list_output_devices, CpalCapture, PlaybackScheduler, RodioOutput,
    SessionConfig, SessionController, SessionState,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley-live] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--list-devices") {
        println!("Input devices:");
        for name in list_input_devices().context("listing input devices")? {
            println!("  {}", name);
        }
        println!("Output devices:");
        for name in list_output_devices().context("listing output devices")? {
            println!("  {}", name);
        }
        return Ok(());
    }

    let config = SessionConfig::load().context("loading session config")?;
    if config.api_key.is_none() {
        warn!(target: "parley::live", "no API key configured (set GEMINI_API_KEY or PARLEY__API_KEY)");
    }

    let tools = builtin_tools();
    info!(target: "parley::live", tools = ?tools, "tools registered");

    let output = RodioOutput::open(config.output_device.as_deref())
        .context("opening output device")?;
    let controller = SessionController::new(
        config,
        Arc::new(WsTransport::new(&tools)),
        Arc::new(CpalCapture::new()),
        PlaybackScheduler::new(Arc::new(output)),
        tools,
    );
    if args.iter().any(|a| a == "--muted") {
        controller.set_muted(true);
    }

    let mut states = controller.subscribe();
    controller.start().await.context("starting session")?;
    info!(target: "parley::live", "🎙️ live session running; press Ctrl-C to stop");

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(target: "parley::live", state = %state, "session state changed");
                match state {
                    SessionState::Disconnected => break,
                    SessionState::Error => {
                        error!(
                            target: "parley::live",
                            "session failed: {}",
                            controller.last_error().unwrap_or_default()
                        );
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target: "parley::live", "CTRL-C received; stopping session");
                break;
            }
        }
    }

    if let Some(stats) = controller.capture_stats() {
        info!(
            target: "parley::live",
            sent = stats.frames_sent,
            dropped = stats.blocks_dropped,
            "capture summary"
        );
    }
    controller.stop();
    Ok(())
}
