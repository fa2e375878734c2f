//! Core configuration types.
//!
//! Provides [`Config`] for the hub's bind addresses and the tunable
//! [`TransferConfig`] subsection. Wire-protocol constants that must not be
//! tuned live in [`crate::protocol_constants`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    DEFAULT_AUDIO_PORT, DEFAULT_CONTROL_PORT, DEFAULT_VIDEO_PORT, EPHEMERAL_PORT_FLOOR,
    MAX_FILE_SIZE_BYTES, TRANSFER_DEADLINE_SECS,
};

/// Configuration for file transfer behavior.
///
/// The defaults match the protocol contract; tests shrink the deadline to
/// exercise expiry without waiting five minutes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransferConfig {
    /// Maximum declared size of an offered file, in bytes.
    pub max_file_bytes: u64,

    /// Seconds an ephemeral transfer listener stays alive without
    /// completing its single transaction.
    pub deadline_secs: u64,

    /// Lowest acceptable ephemeral listener port.
    pub port_floor: u16,
}

impl TransferConfig {
    /// The transfer deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_file_bytes == 0 {
            return Err("max_file_bytes must be >= 1".to_string());
        }
        if self.deadline_secs == 0 {
            return Err("deadline_secs must be >= 1".to_string());
        }
        Ok(())
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: MAX_FILE_SIZE_BYTES,
            deadline_secs: TRANSFER_DEADLINE_SECS,
            port_floor: EPHEMERAL_PORT_FLOOR,
        }
    }
}

/// Configuration for the conferencing hub.
///
/// All fields have sensible defaults; port 0 asks the OS for a free port
/// (used by tests; production deployments set fixed ports so clients can
/// find them).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Address to bind all listeners on.
    pub host: String,

    /// TCP port for the control channel.
    pub control_port: u16,

    /// UDP port for audio datagrams.
    pub audio_port: u16,

    /// UDP port for video / screen-share datagrams.
    pub video_port: u16,

    /// Directory receiving uploaded files.
    pub upload_dir: PathBuf,

    /// File transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.upload_dir.as_os_str().is_empty() {
            return Err("upload_dir must not be empty".to_string());
        }
        self.transfer.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            video_port: DEFAULT_VIDEO_PORT,
            upload_dir: PathBuf::from("uploads"),
            transfer: TransferConfig::default(),
        }
    }
}
