//! m8-audio-capture
//!
//! Captures the USB audio stream of an M8 tracker and writes raw PCM to
//! stdout or a file. Logs go to stderr.

use anyhow::{Context as _, Result, anyhow};
use capture::config::{self, CaptureConfig};
use capture::error::CaptureError;
use capture::pipeline::{CaptureSummary, Pipeline, StopSignal};
use capture::sink::PacketSink;
use capture::usb::{DeviceSession, LibusbBackend, list_candidates};
use clap::Parser;
use common::setup_logging;
use rusb::Context;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "m8-audio-capture")]
#[command(
    author,
    version,
    about = "Capture raw PCM audio from an M8 tracker over USB"
)]
#[command(long_about = "
Streams the isochronous USB audio output of an M8 tracker as raw
interleaved S16_LE PCM, with no container framing.

EXAMPLES:
    # Play live through ALSA
    m8-audio-capture | aplay -f S16_LE -r 44100 -c 2

    # Record to a file
    m8-audio-capture --output ~/m8-session.raw

    # List connected M8 devices
    m8-audio-capture --list-devices

    # Larger transfer pool with debug logging
    m8-audio-capture --pool-size 128 --log-level debug

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/m8-audio-capture/capture.toml
    3. /etc/m8-audio-capture/capture.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Output file, `-` for stdout
    #[arg(short, long, value_name = "PATH")]
    output: Option<String>,

    /// Number of transfers kept in flight
    #[arg(long, value_name = "N")]
    pool_size: Option<usize>,

    /// Isochronous packets per transfer
    #[arg(long, value_name = "N")]
    packets_per_transfer: Option<usize>,

    /// Bytes requested per packet
    #[arg(long, value_name = "BYTES")]
    packet_size: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut CaptureConfig) {
        if let Some(level) = &self.log_level {
            config.capture.log_level = level.clone();
        }
        if let Some(output) = &self.output {
            config.capture.output = output.clone();
        }
        if let Some(pool_size) = self.pool_size {
            config.transfers.pool_size = pool_size;
        }
        if let Some(packets) = self.packets_per_transfer {
            config.transfers.packets_per_transfer = packets;
        }
        if let Some(packet_size) = self.packet_size {
            config.transfers.packet_size = packet_size;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        eprintln!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.capture.log_level).context("Failed to setup logging")?;

    info!("m8-audio-capture v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", config.capture.log_level);

    if args.list_devices {
        return list_devices_mode(&config);
    }

    let stop = StopSignal::new();
    let (result_tx, mut result_rx) = oneshot::channel();
    let capture_handle = spawn_capture(config, stop.clone(), result_tx)?;

    let result = tokio::select! {
        result = &mut result_rx => result,
        () = shutdown_signal() => {
            info!("Shutdown requested, stopping capture...");
            stop.raise();
            result_rx.await
        }
    };

    if let Err(e) = capture_handle.join() {
        error!("Capture thread panicked: {:?}", e);
    }

    let summary = result.map_err(|_| anyhow!("Capture thread exited without a result"))??;
    report(&summary);
    Ok(())
}

/// Run the capture on its own thread; libusb handles are not `Send`, so
/// everything USB is created there
fn spawn_capture(
    config: CaptureConfig,
    stop: StopSignal,
    result_tx: oneshot::Sender<Result<CaptureSummary>>,
) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-capture".to_string())
        .spawn(move || {
            let result = run_capture(&config, stop);
            let _ = result_tx.send(result);
        })
        .context("Failed to spawn capture thread")
}

fn run_capture(config: &CaptureConfig, stop: StopSignal) -> Result<CaptureSummary> {
    let context = Context::new().map_err(CaptureError::Context)?;
    let session = DeviceSession::open(&context, &config.device)?;

    let target = config.output_target();
    let sink = target.open().context("Failed to open output")?;
    info!("Stream format: {}", config.audio.format_banner());
    info!("Writing PCM to {}", target);

    let mut pipeline = Pipeline::new(
        LibusbBackend::new(&session),
        config.transfers.pool_size,
        config.layout(),
        sink,
        stop,
        config.loop_settings(),
    )?;

    if let Err(e) = pipeline.start() {
        // start() has already drained whatever was submitted
        if let Err(finish_err) = pipeline.finish() {
            error!("Failed to release transfers: {}", finish_err);
        }
        return Err(e.into());
    }

    info!("Capturing from {}, press Ctrl+C to stop", session.candidate());
    pipeline.run();

    let (summary, mut sink) = pipeline.finish()?;
    if let Err(e) = sink.flush() {
        debug!("Final flush failed: {}", e);
    }
    Ok(summary)
}

/// Print devices matching the configured candidates
fn list_devices_mode(config: &CaptureConfig) -> Result<()> {
    let context = Context::new().map_err(CaptureError::Context)?;
    let devices = list_candidates(&context, &config.device)?;

    if devices.is_empty() {
        println!("No M8 devices found.");
        return Ok(());
    }

    println!("Found {} device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} - {}",
            device.candidate,
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Bus {:03} Device {:03}",
            device.bus_number, device.address
        );
    }
    Ok(())
}

fn report(summary: &CaptureSummary) {
    let metrics = &summary.metrics;
    info!(
        "Captured {} in {} ({} packets, {} dropped, {} loss)",
        metrics.format_bytes_forwarded(),
        metrics.format_uptime(),
        metrics.packets_ok,
        metrics.packets_dropped,
        metrics.format_loss_rate()
    );

    match &summary.stop_reason {
        Some(reason) if reason.is_clean() => info!("Capture stopped: {}", reason),
        Some(reason) => warn!("Capture ended: {}", reason),
        None => {}
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error waiting for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error installing SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "m8-audio-capture",
            "--output",
            "/tmp/out.raw",
            "--pool-size",
            "8",
            "--packets-per-transfer",
            "4",
            "--packet-size",
            "192",
            "--log-level",
            "debug",
        ]);
        let mut config = CaptureConfig::default();
        args.apply(&mut config);

        assert_eq!(config.capture.output, "/tmp/out.raw");
        assert_eq!(config.capture.log_level, "debug");
        assert_eq!(config.transfers.pool_size, 8);
        assert_eq!(config.transfers.packets_per_transfer, 4);
        assert_eq!(config.transfers.packet_size, 192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let args = Args::parse_from(["m8-audio-capture"]);
        let mut config = CaptureConfig::default();
        args.apply(&mut config);
        assert_eq!(config.capture.output, "-");
        assert_eq!(config.transfers.pool_size, 64);
    }

    #[test]
    fn test_cli_rejects_zero_pool() {
        let args = Args::parse_from(["m8-audio-capture", "--pool-size", "0"]);
        let mut config = CaptureConfig::default();
        args.apply(&mut config);
        assert!(config.validate().is_err());
    }
}
