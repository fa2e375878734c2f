//! Fixed protocol constants that should NOT be changed.
//!
//! These values are part of the wire protocol between the hub and its
//! clients. Changing them breaks interoperability with deployed clients;
//! tunable runtime parameters live in [`crate::state::Config`] instead.

// ─────────────────────────────────────────────────────────────────────────────
// Transport Ports (defaults; all overridable via configuration)
// ─────────────────────────────────────────────────────────────────────────────

/// Default TCP port for the line-delimited JSON control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 9000;

/// Default UDP port for chunked video / screen-share datagrams.
pub const DEFAULT_VIDEO_PORT: u16 = 10000;

/// Default UDP port for Opus audio datagrams.
pub const DEFAULT_AUDIO_PORT: u16 = 11000;

/// Lowest port considered acceptable for ephemeral file-transfer listeners.
///
/// Transfer listeners bind OS-assigned ports and retry until the port lands
/// at or above this floor, keeping transfers clear of well-known ports.
pub const EPHEMERAL_PORT_FLOOR: u16 = 10000;

// ─────────────────────────────────────────────────────────────────────────────
// Control Channel
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum length of a single control-channel line (64 KiB).
///
/// Longer lines are a protocol violation and close the connection.
pub const MAX_CONTROL_FRAME_BYTES: usize = 64 * 1024;

/// Maximum chat message text length (4 KiB).
pub const MAX_CHAT_TEXT_BYTES: usize = 4096;

/// Maximum display name length in bytes.
pub const MAX_USERNAME_BYTES: usize = 64;

/// Number of chat entries retained for history replay.
pub const CHAT_HISTORY_CAPACITY: usize = 500;

/// Outbound frames buffered per session before drop-oldest kicks in.
pub const MAILBOX_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// File Transfers
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum declared size of an offered file (100 MiB).
pub const MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Lifetime of an ephemeral transfer listener (seconds).
///
/// An upload or download that has not completed within this window is
/// aborted and its listener closed.
pub const TRANSFER_DEADLINE_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Audio
// ─────────────────────────────────────────────────────────────────────────────

/// Audio sample rate (Hz). 48 kHz mono is the only rate on the wire.
pub const SAMPLE_RATE: u32 = 48_000;

/// Mix tick period (milliseconds). One Opus frame covers exactly one tick.
pub const MIX_TICK_MS: u64 = 40;

/// Decoded PCM samples per frame (40 ms at 48 kHz mono).
pub const SAMPLES_PER_FRAME: usize = 1920;

/// Size of the fixed audio datagram header in bytes.
pub const AUDIO_HEADER_BYTES: usize = 16;

/// Upper bound on an encoded Opus payload we accept from the network.
pub const MAX_AUDIO_PAYLOAD_BYTES: usize = 4000;

/// Consecutive ticks without a frame before a participant's jitter slot is
/// cleared and the participant is treated as silent.
pub const SILENCE_TICKS: u32 = 10;

/// Target jitter-buffer depth in frames (80-160 ms at 40 ms/frame).
pub const JITTER_TARGET_DEPTH: usize = 3;

/// Hard cap on buffered frames per jitter slot; beyond this the playout
/// cursor jumps forward to the target depth.
pub const JITTER_MAX_DEPTH: usize = 8;

// ─────────────────────────────────────────────────────────────────────────────
// Video / Screen Share
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the fixed video datagram header in bytes.
pub const VIDEO_HEADER_BYTES: usize = 24;

/// Maximum JPEG payload bytes per video chunk (MTU-safe).
pub const MAX_VIDEO_CHUNK_BYTES: usize = 1400;

/// Partial frames older than this are discarded (milliseconds).
pub const PARTIAL_FRAME_TTL_MS: u64 = 500;

/// Assemblers for frame ids older than `latest - HORIZON` are dropped.
pub const ASSEMBLER_FRAME_HORIZON: u32 = 8;

// ─────────────────────────────────────────────────────────────────────────────
// Supervision
// ─────────────────────────────────────────────────────────────────────────────

/// Per-subsystem drain budget during graceful shutdown (seconds).
pub const SHUTDOWN_DRAIN_SECS: u64 = 5;
