//! Parley Server - standalone headless conferencing hub.
//!
//! This binary hosts the Parley coordination core without any GUI: the
//! control channel, chat and presence, file transfers, audio mixing, and
//! video fan-out. It's designed for LAN deployments where the hub runs as
//! a background daemon and desktop clients connect to it.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::bootstrap_services;
use tokio::signal;

use crate::config::ServerConfig;

/// Parley Server - headless LAN conferencing hub.
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PARLEY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind address (overrides config file).
    #[arg(long, env = "PARLEY_HOST")]
    host: Option<String>,

    /// Control channel TCP port (overrides config file).
    #[arg(short = 'p', long, env = "PARLEY_PORT")]
    port: Option<u16>,

    /// Audio UDP port (overrides config file).
    #[arg(long, env = "PARLEY_AUDIO_PORT")]
    audio_port: Option<u16>,

    /// Video UDP port (overrides config file).
    #[arg(long, env = "PARLEY_VIDEO_PORT")]
    video_port: Option<u16>,

    /// Directory receiving uploaded files (overrides config file).
    #[arg(short = 'u', long, env = "PARLEY_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Parley Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(port) = args.audio_port {
        config.audio_port = port;
    }
    if let Some(port) = args.video_port {
        config.video_port = port;
    }
    if let Some(dir) = args.upload_dir {
        config.upload_dir = dir;
    }

    log::info!(
        "Configuration: host={}, control={}, audio={}, video={}, uploads={}",
        config.host,
        config.port,
        config.audio_port,
        config.video_port,
        config.upload_dir.display()
    );

    let core_config = config.to_core_config();
    core_config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    // Bind failures (ports in use, bad host) surface here, before any
    // subsystem task runs, and exit non-zero.
    let services = bootstrap_services(core_config)
        .await
        .context("Failed to start hub listeners")?;

    services.start();
    log::info!("Hub running; press Ctrl+C to stop");

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown
    services.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
