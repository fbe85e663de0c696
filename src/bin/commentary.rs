//! Screen Commentary Client
//!
//! Shares the screen with the commentary service and plays the commentary
//! it sends back until Ctrl+C or until sharing stops.
//!
//! Usage: `commentary <session-id> [capture-interval-ms]`

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use screen_commentary::{
    audio::{list_output_devices, playback_channel, AudioOutput},
    capture::{list_monitors, MonitorProvider},
    codec::SymphoniaDecoder,
    config::AppConfig,
    session::{CaptureSession, PipelineParts, SessionSlot},
    ui::{UiState, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Screen Commentary Client");

    let mut config = AppConfig::load().context("Failed to load configuration")?;

    let mut args = std::env::args().skip(1);
    let session_id: u64 = args
        .next()
        .context("usage: commentary <session-id> [capture-interval-ms]")?
        .parse()
        .context("session id must be a number")?;
    if let Some(interval) = args.next() {
        config.session.capture_interval = interval
            .parse()
            .context("capture interval must be a number of milliseconds")?;
    }
    config.validate()?;

    println!("\n=== Available Monitors ===");
    match list_monitors() {
        Ok(monitors) => {
            for monitor in monitors {
                println!("  {}", monitor);
            }
        }
        Err(e) => println!("  (unavailable: {})", e),
    }

    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let (notifier, playback_events) = playback_channel();
    let output = AudioOutput::open(config.playback.device_id.as_deref(), notifier)?;

    let parts = PipelineParts {
        screen: Arc::new(MonitorProvider::new(config.capture.monitor.clone())),
        decoder: Arc::new(SymphoniaDecoder),
        sink: Box::new(output),
        playback_events,
    };

    let slot = SessionSlot::new();
    let session = CaptureSession::new(session_id, config.session.clone());

    let handle = match slot.start(session, &config, parts).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}", e.user_message());
            return Err(e.into());
        }
    };

    // Keep the server alive for the whole session
    let _web_server = if config.ui.enabled {
        let ui_state = Arc::new(UiState::new(slot.clone()));
        ui_state.attach(&handle);
        Some(WebServer::start(&config.ui, ui_state).await?)
    } else {
        None
    };

    let stop = handle.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, stopping");
            stop.stop();
        }
    });

    tracing::info!("Session {} running - press Ctrl+C to stop", session_id);

    let report = handle.join().await?;

    println!("\n=== Session Report ===");
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.end_reason.is_normal() {
        anyhow::bail!("Session ended: {}", report.end_reason);
    }
    Ok(())
}
