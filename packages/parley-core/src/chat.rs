//! Chat history, per-session mailboxes, and broadcast delivery.
//!
//! Delivery is best-effort per session: the engine enqueues frames into
//! bounded per-session mailboxes and each session's writer task drains its
//! own. A slow or dead writer loses its oldest frames; it never blocks
//! delivery to anyone else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{HubError, HubResult};
use crate::journal::EventJournal;
use crate::protocol::{ChatEntry, DeliveryKind, ServerMessage};
use crate::protocol_constants::{CHAT_HISTORY_CAPACITY, MAILBOX_CAPACITY, MAX_CHAT_TEXT_BYTES};
use crate::registry::Registry;
use crate::utils::now_iso8601;

/// Bounded outbound queue owned by one control session.
///
/// Producers (broadcasts, replies) never block: on overflow the oldest
/// frame is dropped and the slow-consumer counter bumped. The single
/// consumer is the session's writer task.
pub struct Mailbox {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Mailbox with the protocol-default capacity.
    pub fn with_default_capacity() -> Self {
        Self::new(MAILBOX_CAPACITY)
    }

    /// Enqueues a frame, dropping the oldest on overflow. No-op once
    /// closed.
    pub fn push(&self, msg: ServerMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    log::warn!("[Mailbox] slow consumer, {dropped} frame(s) dropped");
                }
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Receives the next frame. Drains remaining frames after close, then
    /// returns `None`.
    pub async fn recv(&self) -> Option<ServerMessage> {
        loop {
            // Register for wakeup before checking the queue so a push
            // between the check and the await is not missed.
            let notified = self.notify.notified();
            if let Some(msg) = self.queue.lock().pop_front() {
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Closes the mailbox; pending frames stay receivable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Frames dropped to date because this consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Bounded ring of chat entries, oldest evicted first.
struct HistoryRing {
    entries: Mutex<VecDeque<ChatEntry>>,
    capacity: usize,
}

impl HistoryRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn append(&self, entry: ChatEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn snapshot(&self) -> Vec<ChatEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

/// Chat and presence delivery engine.
///
/// Owns the history ring and performs broadcast/unicast fan-out over the
/// registry's mailboxes. History is copied out under the lock and released
/// before any enqueueing, so a large fan-out never holds the ring.
pub struct ChatEngine {
    registry: Arc<Registry>,
    history: HistoryRing,
    journal: Arc<dyn EventJournal>,
}

impl ChatEngine {
    pub fn new(registry: Arc<Registry>, journal: Arc<dyn EventJournal>) -> Self {
        Self {
            registry,
            history: HistoryRing::new(CHAT_HISTORY_CAPACITY),
            journal,
        }
    }

    /// Appends a chat/broadcast entry and delivers it to every registered
    /// participant, sender included.
    pub fn send_to_all(
        &self,
        sender_uid: u32,
        sender_name: &str,
        kind: DeliveryKind,
        text: String,
    ) -> HubResult<()> {
        if text.len() > MAX_CHAT_TEXT_BYTES {
            return Err(HubError::TextTooLong);
        }
        let entry = ChatEntry {
            ts: now_iso8601(),
            uid: sender_uid,
            username: sender_name.to_string(),
            text,
            kind,
            target_uid: None,
        };
        self.history.append(entry.clone());
        self.journal.chat(&entry);

        let frame = match kind {
            DeliveryKind::Broadcast => ServerMessage::Broadcast {
                uid: entry.uid,
                username: entry.username.clone(),
                text: entry.text.clone(),
                ts: entry.ts.clone(),
            },
            _ => ServerMessage::Chat {
                uid: entry.uid,
                username: entry.username.clone(),
                text: entry.text.clone(),
                ts: entry.ts.clone(),
            },
        };
        self.fan_out(frame, None);
        Ok(())
    }

    /// Appends a unicast entry and delivers it to the target and back to
    /// the sender. Fails without side effects if the target is unknown.
    pub fn send_unicast(
        &self,
        sender_uid: u32,
        sender_name: &str,
        target_uid: u32,
        text: String,
    ) -> HubResult<()> {
        if text.len() > MAX_CHAT_TEXT_BYTES {
            return Err(HubError::TextTooLong);
        }
        let target = self
            .registry
            .lookup(target_uid)
            .ok_or(HubError::UnknownParticipant(target_uid))?;

        let entry = ChatEntry {
            ts: now_iso8601(),
            uid: sender_uid,
            username: sender_name.to_string(),
            text,
            kind: DeliveryKind::Unicast,
            target_uid: Some(target_uid),
        };
        self.history.append(entry.clone());
        self.journal.chat(&entry);

        let frame = ServerMessage::Unicast {
            from_uid: sender_uid,
            from_username: sender_name.to_string(),
            to_uid: target.uid,
            to_username: target.name.clone(),
            text: entry.text,
            ts: entry.ts,
        };
        target.mailbox.push(frame.clone());
        if let Some(sender) = self.registry.lookup(sender_uid) {
            sender.mailbox.push(frame);
        }
        Ok(())
    }

    /// Enqueues a non-chat frame (join/leave, file availability,
    /// presentation events) to every participant, optionally excluding one
    /// uid.
    pub fn fan_out(&self, frame: ServerMessage, exclude_uid: Option<u32>) {
        for participant in self.registry.all() {
            if Some(participant.uid) == exclude_uid {
                continue;
            }
            participant.mailbox.push(frame.clone());
        }
    }

    /// The most recent history entries, oldest first.
    pub fn history(&self) -> Vec<ChatEntry> {
        self.history.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::NoopJournal;

    fn engine() -> (Arc<Registry>, ChatEngine) {
        let registry = Arc::new(Registry::new());
        let engine = ChatEngine::new(Arc::clone(&registry), Arc::new(NoopJournal));
        (registry, engine)
    }

    #[tokio::test]
    async fn mailbox_preserves_fifo_order() {
        let mailbox = Mailbox::new(16);
        for i in 0..5 {
            mailbox.push(ServerMessage::UnicastSent { target_uid: i });
        }
        for i in 0..5 {
            match mailbox.recv().await {
                Some(ServerMessage::UnicastSent { target_uid }) => assert_eq!(target_uid, i),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn mailbox_drops_oldest_on_overflow() {
        let mailbox = Mailbox::new(3);
        for i in 0..5 {
            mailbox.push(ServerMessage::UnicastSent { target_uid: i });
        }
        assert_eq!(mailbox.dropped(), 2);
        // Oldest two (0, 1) were dropped; 2 is now at the front.
        match mailbox.recv().await {
            Some(ServerMessage::UnicastSent { target_uid }) => assert_eq!(target_uid, 2),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mailbox_drains_after_close() {
        let mailbox = Mailbox::new(4);
        mailbox.push(ServerMessage::HeartbeatAck);
        mailbox.close();
        assert!(matches!(
            mailbox.recv().await,
            Some(ServerMessage::HeartbeatAck)
        ));
        assert!(mailbox.recv().await.is_none());
    }

    #[test]
    fn history_ring_evicts_oldest() {
        let (_registry, engine) = engine();
        for i in 0..(CHAT_HISTORY_CAPACITY + 10) {
            engine
                .send_to_all(1, "alice", DeliveryKind::Chat, format!("msg-{i}"))
                .unwrap();
        }
        let history = engine.history();
        assert_eq!(history.len(), CHAT_HISTORY_CAPACITY);
        assert_eq!(history[0].text, "msg-10");
        assert_eq!(
            history.last().unwrap().text,
            format!("msg-{}", CHAT_HISTORY_CAPACITY + 9)
        );
    }

    #[test]
    fn broadcast_reaches_all_including_sender() {
        let (registry, engine) = engine();
        let a = registry
            .register("a", Arc::new(Mailbox::new(8)))
            .unwrap();
        let b = registry
            .register("b", Arc::new(Mailbox::new(8)))
            .unwrap();

        engine
            .send_to_all(a.uid, "a", DeliveryKind::Chat, "hello".into())
            .unwrap();
        assert_eq!(a.mailbox.len(), 1);
        assert_eq!(b.mailbox.len(), 1);
    }

    #[test]
    fn unicast_reaches_only_sender_and_target() {
        let (registry, engine) = engine();
        let a = registry.register("a", Arc::new(Mailbox::new(8))).unwrap();
        let b = registry.register("b", Arc::new(Mailbox::new(8))).unwrap();
        let c = registry.register("c", Arc::new(Mailbox::new(8))).unwrap();

        engine.send_unicast(a.uid, "a", b.uid, "psst".into()).unwrap();
        assert_eq!(a.mailbox.len(), 1);
        assert_eq!(b.mailbox.len(), 1);
        assert_eq!(c.mailbox.len(), 0);
    }

    #[test]
    fn unicast_to_unknown_target_fails_cleanly() {
        let (registry, engine) = engine();
        let a = registry.register("a", Arc::new(Mailbox::new(8))).unwrap();
        let err = engine
            .send_unicast(a.uid, "a", 99, "psst".into())
            .unwrap_err();
        assert_eq!(err.reason(), "unknown participant");
        assert!(engine.history().is_empty());
        assert_eq!(a.mailbox.len(), 0);
    }

    #[test]
    fn oversize_text_rejected() {
        let (registry, engine) = engine();
        let a = registry.register("a", Arc::new(Mailbox::new(8))).unwrap();
        let text = "x".repeat(MAX_CHAT_TEXT_BYTES + 1);
        assert!(engine
            .send_to_all(a.uid, "a", DeliveryKind::Chat, text)
            .is_err());
        assert!(engine.history().is_empty());
    }
}
