//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind all hub listeners on.
    /// Override: `PARLEY_HOST`
    pub host: String,

    /// TCP port for the control channel.
    /// Override: `PARLEY_PORT`
    pub port: u16,

    /// UDP port for audio datagrams.
    /// Override: `PARLEY_AUDIO_PORT`
    pub audio_port: u16,

    /// UDP port for video / screen-share datagrams.
    /// Override: `PARLEY_VIDEO_PORT`
    pub video_port: u16,

    /// Directory receiving uploaded files.
    /// Override: `PARLEY_UPLOAD_DIR`
    pub upload_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = parley_core::Config::default();
        Self {
            host: core.host,
            port: core.control_port,
            audio_port: core.audio_port,
            video_port: core.video_port,
            upload_dir: core.upload_dir,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PARLEY_HOST") {
            if !val.trim().is_empty() {
                self.host = val;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_AUDIO_PORT") {
            if let Ok(port) = val.parse() {
                self.audio_port = port;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_VIDEO_PORT") {
            if let Ok(port) = val.parse() {
                self.video_port = port;
            }
        }

        // Note: PARLEY_UPLOAD_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to parley-core's Config type.
    pub fn to_core_config(&self) -> parley_core::Config {
        parley_core::Config {
            host: self.host.clone(),
            control_port: self.port,
            audio_port: self.audio_port,
            video_port: self.video_port,
            upload_dir: self.upload_dir.clone(),
            ..Default::default()
        }
    }
}
