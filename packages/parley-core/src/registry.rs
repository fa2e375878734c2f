//! Authoritative participant identity and presence state.
//!
//! Every other subsystem references participants by `uid` and resolves
//! through this registry; uids are allocated from a monotonic counter and
//! never reused within a server lifetime.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::chat::Mailbox;
use crate::error::{HubError, HubResult};
use crate::protocol::ParticipantSummary;
use crate::protocol_constants::MAX_USERNAME_BYTES;

/// A logged-in participant.
///
/// Created on successful login, destroyed when the control channel closes.
/// Media endpoints are tracked by the media engines themselves (learned
/// from datagram source addresses), not here.
pub struct Participant {
    pub uid: u32,
    pub name: String,
    /// Outbound control-channel mailbox for this participant's session.
    pub mailbox: Arc<Mailbox>,
    /// Topic the participant is currently presenting, if any.
    presenting: Mutex<Option<String>>,
    /// Peers this participant has silenced locally. Only the mixer's
    /// per-listener personalization reads this.
    muted: Mutex<HashSet<u32>>,
    audio_active: AtomicBool,
    video_active: AtomicBool,
}

impl Participant {
    /// Starts presenting. Returns the broadcastable topic; multiple
    /// concurrent presenters across participants are allowed.
    pub fn start_presenting(&self, topic: Option<String>) -> Option<String> {
        let mut guard = self.presenting.lock();
        *guard = Some(topic.clone().unwrap_or_default());
        topic
    }

    /// Stops presenting. Returns `true` if the participant was presenting.
    pub fn stop_presenting(&self) -> bool {
        self.presenting.lock().take().is_some()
    }

    /// Whether the participant currently presents, and the topic.
    pub fn presenting(&self) -> Option<String> {
        self.presenting.lock().clone()
    }

    /// Adds a peer to this participant's mute set.
    pub fn mute(&self, peer: u32) {
        self.muted.lock().insert(peer);
    }

    /// Removes a peer from this participant's mute set.
    pub fn unmute(&self, peer: u32) {
        self.muted.lock().remove(&peer);
    }

    /// Snapshot of the mute set for mixer personalization.
    pub fn muted_peers(&self) -> HashSet<u32> {
        self.muted.lock().clone()
    }

    pub fn set_audio_active(&self, active: bool) {
        self.audio_active.store(active, Ordering::Relaxed);
    }

    pub fn audio_active(&self) -> bool {
        self.audio_active.load(Ordering::Relaxed)
    }

    pub fn set_video_active(&self, active: bool) {
        self.video_active.store(active, Ordering::Relaxed);
    }

    pub fn video_active(&self) -> bool {
        self.video_active.load(Ordering::Relaxed)
    }
}

/// Thread-safe registry of logged-in participants.
pub struct Registry {
    participants: DashMap<u32, Arc<Participant>>,
    /// Next uid to hand out. Starts at 1; uid 0 is the server itself on
    /// the audio plane.
    next_uid: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            participants: DashMap::new(),
            next_uid: AtomicU32::new(1),
        }
    }

    /// Registers a participant under a validated display name.
    ///
    /// The name is trimmed; blank names and names over the byte limit are
    /// rejected. Allocation is a single atomic increment, so concurrent
    /// logins get pairwise distinct, strictly increasing uids.
    pub fn register(&self, name: &str, mailbox: Arc<Mailbox>) -> HubResult<Arc<Participant>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::NameEmpty);
        }
        if name.len() > MAX_USERNAME_BYTES {
            return Err(HubError::NameTooLong(MAX_USERNAME_BYTES));
        }

        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let participant = Arc::new(Participant {
            uid,
            name: name.to_string(),
            mailbox,
            presenting: Mutex::new(None),
            muted: Mutex::new(HashSet::new()),
            audio_active: AtomicBool::new(false),
            video_active: AtomicBool::new(false),
        });
        self.participants.insert(uid, Arc::clone(&participant));
        log::info!("[Registry] uid {} registered as {:?}", uid, name);
        Ok(participant)
    }

    /// Removes a participant. Idempotent; returns the removed entry.
    pub fn unregister(&self, uid: u32) -> Option<Arc<Participant>> {
        let removed = self.participants.remove(&uid).map(|(_, p)| p);
        if let Some(p) = &removed {
            log::info!("[Registry] uid {} ({:?}) unregistered", uid, p.name);
        }
        removed
    }

    /// O(1) lookup by uid.
    pub fn lookup(&self, uid: u32) -> Option<Arc<Participant>> {
        self.participants.get(&uid).map(|r| Arc::clone(r.value()))
    }

    /// Consistent snapshot of all registered participants, ordered by uid.
    pub fn snapshot(&self) -> Vec<ParticipantSummary> {
        let mut list: Vec<ParticipantSummary> = self
            .participants
            .iter()
            .map(|r| ParticipantSummary {
                uid: r.uid,
                username: r.name.clone(),
            })
            .collect();
        list.sort_by_key(|p| p.uid);
        list
    }

    /// All participants, ordered by uid. Mixer tick iterates this to take
    /// per-slot locks in ascending uid order.
    pub fn all(&self) -> Vec<Arc<Participant>> {
        let mut list: Vec<Arc<Participant>> = self
            .participants
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        list.sort_by_key(|p| p.uid);
        list
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> Arc<Mailbox> {
        Arc::new(Mailbox::new(8))
    }

    #[test]
    fn uids_are_distinct_and_increasing() {
        let registry = Registry::new();
        let uids: Vec<u32> = (0..50)
            .map(|i| {
                registry
                    .register(&format!("user-{i}"), mailbox())
                    .unwrap()
                    .uid
            })
            .collect();
        for pair in uids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(uids[0], 1);
    }

    #[test]
    fn uid_not_reused_after_unregister() {
        let registry = Registry::new();
        let first = registry.register("alice", mailbox()).unwrap().uid;
        registry.unregister(first);
        let second = registry.register("alice", mailbox()).unwrap().uid;
        assert!(second > first);
    }

    #[test]
    fn blank_name_rejected() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register("   ", mailbox()),
            Err(HubError::NameEmpty)
        ));
    }

    #[test]
    fn oversize_name_rejected() {
        let registry = Registry::new();
        let name = "x".repeat(MAX_USERNAME_BYTES + 1);
        assert!(matches!(
            registry.register(&name, mailbox()),
            Err(HubError::NameTooLong(_))
        ));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        let uid = registry.register("bob", mailbox()).unwrap().uid;
        assert!(registry.unregister(uid).is_some());
        assert!(registry.unregister(uid).is_none());
    }

    #[test]
    fn snapshot_is_ordered_and_current() {
        let registry = Registry::new();
        registry.register("a", mailbox()).unwrap();
        let b = registry.register("b", mailbox()).unwrap();
        registry.register("c", mailbox()).unwrap();
        registry.unregister(b.uid);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].username, "a");
        assert_eq!(snapshot[1].username, "c");
    }

    #[test]
    fn mute_set_round_trip() {
        let registry = Registry::new();
        let p = registry.register("alice", mailbox()).unwrap();
        p.mute(7);
        p.mute(9);
        p.unmute(7);
        let muted = p.muted_peers();
        assert!(muted.contains(&9));
        assert!(!muted.contains(&7));
    }

    #[test]
    fn presenting_topic_round_trip() {
        let registry = Registry::new();
        let p = registry.register("alice", mailbox()).unwrap();
        assert!(p.presenting().is_none());
        p.start_presenting(Some("roadmap".into()));
        assert_eq!(p.presenting().as_deref(), Some("roadmap"));
        assert!(p.stop_presenting());
        assert!(!p.stop_presenting());
    }
}
