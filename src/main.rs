//! FrameWave CLI application

use anyhow::{Context, Result};
use clap::Parser;
use framewave::config::Config;
use framewave::CaptureOrchestrator;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "framewave")]
#[command(about = "Streams local capture devices as MJPEG over HTTP, one port per camera")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "framewave.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the modes a device supports and exit
    #[arg(long, value_name = "NAME")]
    probe: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("FrameWave starting");
    let config = load_config(&cli.config)?;
    let orchestrator = CaptureOrchestrator::headless(config)?;

    if cli.list_devices {
        let devices = orchestrator.prober().list_devices().await;
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if let Some(device) = cli.probe {
        let capabilities = orchestrator.prober().capabilities(&device).await;
        println!("{}", serde_json::to_string_pretty(&capabilities)?);
        return Ok(());
    }

    let summary = orchestrator.start_all().await;
    for (camera, reason) in &summary.failed {
        error!(camera = %camera, reason = %reason, "Camera failed");
    }

    if summary.started.is_empty() {
        info!("No cameras streaming, exiting");
        orchestrator.stop_all().await;
        return Ok(());
    }

    for camera in &summary.started {
        if let Some(url) = orchestrator.stream_url(camera).await {
            info!(camera = %camera, url = %url, "Streaming");
        }
    }

    // Wait for Ctrl+C
    info!("Streaming started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    orchestrator.stop_all().await;
    Ok(())
}

/// Loads the configuration file, falling back to defaults when it is missing
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!(config_path = %path.display(), "Configuration file not found, using defaults");
        return Ok(Config::default());
    }

    info!(config_path = %path.display(), "Loading configuration");
    let config = Config::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    info!(
        cameras = config.cameras.len(),
        enabled = config.cameras.iter().filter(|c| c.enabled).count(),
        "Configuration loaded"
    );
    Ok(config)
}
