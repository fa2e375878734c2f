//! Append-only event journals.
//!
//! Significant chat, transfer, and presentation events are mirrored to
//! three append-only sinks. The sinks themselves (files, collectors) are
//! external; the hub talks to them through [`EventJournal`], and the
//! default implementation routes through the `log` facade under dedicated
//! targets so any configured logger can fan them out.

use uuid::Uuid;

use crate::protocol::{ChatEntry, DeliveryKind};

/// Trait for the three append-only event sinks.
pub trait EventJournal: Send + Sync {
    /// Records a delivered chat entry.
    fn chat(&self, entry: &ChatEntry);

    /// Records a file-transfer lifecycle event.
    fn transfer(&self, fid: Uuid, event: &str);

    /// Records a presentation start/stop event.
    fn presentation(&self, uid: u32, username: &str, event: &str);
}

/// Default journal writing through `log` targets (`parley::chat`,
/// `parley::transfers`, `parley::presentations`).
pub struct LogJournal;

impl EventJournal for LogJournal {
    fn chat(&self, entry: &ChatEntry) {
        match entry.kind {
            DeliveryKind::Unicast => log::info!(
                target: "parley::chat",
                "{} {}({}) -> {:?}: {}",
                entry.ts,
                entry.username,
                entry.uid,
                entry.target_uid,
                entry.text
            ),
            _ => log::info!(
                target: "parley::chat",
                "{} {}({}): {}",
                entry.ts,
                entry.username,
                entry.uid,
                entry.text
            ),
        }
    }

    fn transfer(&self, fid: Uuid, event: &str) {
        log::info!(target: "parley::transfers", "{fid} {event}");
    }

    fn presentation(&self, uid: u32, username: &str, event: &str) {
        log::info!(target: "parley::presentations", "{username}({uid}) {event}");
    }
}

/// Journal that records nothing. Useful in tests.
pub struct NoopJournal;

impl EventJournal for NoopJournal {
    fn chat(&self, _entry: &ChatEntry) {}
    fn transfer(&self, _fid: Uuid, _event: &str) {}
    fn presentation(&self, _uid: u32, _username: &str, _event: &str) {}
}
