//! Parley Core - shared library for the Parley conferencing hub.
//!
//! This crate provides the server-side coordination core of Parley, a LAN
//! conferencing system: a single hub that connected clients use to chat,
//! exchange files, stream mixed audio, and fan out webcam and screen-share
//! video. It is designed to be driven by the standalone headless server
//! binary; capture devices, codecs beyond the audio seam, and GUIs live
//! with the clients.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`registry`]: Participant identity, presence flags, and mute sets
//! - [`control`]: TCP acceptor and per-session control-channel tasks
//! - [`protocol`]: Line-delimited JSON control message types
//! - [`chat`]: History ring, per-session mailboxes, broadcast delivery
//! - [`transfer`]: Ephemeral-listener file upload/download broker
//! - [`audio`]: Jitter-buffered Opus decode, mix, and per-listener encode
//! - [`video`]: Chunked JPEG reassembly and fan-out
//! - [`wire`]: Fixed-layout UDP datagram headers
//! - [`bootstrap`]: Composition root, startup/shutdown ordering
//! - [`journal`]: Append-only event sinks behind a trait
//! - [`error`]: Centralized error types
//!
//! The hot audio path is deliberately narrow: ingress decodes into
//! per-participant slots under per-slot locks, and a single tick task owns
//! the mix buffer, so no lock is ever held across the whole mix.

#![warn(clippy::all)]

pub mod audio;
pub mod bootstrap;
pub mod chat;
pub mod control;
pub mod error;
pub mod journal;
pub mod protocol;
pub mod protocol_constants;
pub mod registry;
pub mod state;
pub mod transfer;
pub mod utils;
pub mod video;
pub mod wire;

// Re-export commonly used types at the crate root
pub use audio::AudioMixer;
pub use bootstrap::{bootstrap_services, bootstrap_services_with_journal, BootstrappedServices};
pub use chat::{ChatEngine, Mailbox};
pub use control::ControlServer;
pub use error::{ErrorClass, HubError, HubResult};
pub use journal::{EventJournal, LogJournal, NoopJournal};
pub use protocol::{ChatEntry, ClientMessage, DeliveryKind, ParticipantSummary, ServerMessage};
pub use registry::{Participant, Registry};
pub use state::{Config, TransferConfig};
pub use transfer::{FileBroker, FileOffer, OfferState, TransferDirection, TransferSession};
pub use utils::{now_iso8601, now_millis, sanitize_filename};
pub use video::VideoFanout;
pub use wire::{AudioPacket, StreamKind, VideoChunk};
