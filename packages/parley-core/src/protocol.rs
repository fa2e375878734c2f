//! Control-channel message types.
//!
//! One JSON object per LF-terminated line, every object tagged by `type`.
//! Inbound lines decode into the closed [`ClientMessage`] set so the
//! session loop dispatches with a single `match`; unknown tags fail decode
//! and surface as protocol errors rather than reaching handlers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HubError, HubResult};

/// Delivery kind of a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Chat,
    Broadcast,
    Unicast,
}

/// A single chat history entry, stored and replayed in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// ISO-8601 wall-clock timestamp.
    pub ts: String,
    /// Sender uid.
    pub uid: u32,
    /// Sender display name at send time.
    pub username: String,
    pub text: String,
    pub kind: DeliveryKind,
    /// Target uid, unicast only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_uid: Option<u32>,
}

/// Compact participant record used in `participant_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub uid: u32,
    pub username: String,
}

/// Messages a client may send to the hub.
///
/// Clients historically sent `message` where the protocol says `text`;
/// the alias is accepted on input, output always uses `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        username: String,
    },
    Heartbeat,
    Chat {
        #[serde(alias = "message")]
        text: String,
    },
    Broadcast {
        #[serde(alias = "message")]
        text: String,
    },
    Unicast {
        target_uid: u32,
        #[serde(alias = "message")]
        text: String,
    },
    GetHistory,
    FileOffer {
        fid: Uuid,
        filename: String,
        size: u64,
    },
    FileRequest {
        fid: Uuid,
    },
    PresentStart {
        #[serde(default)]
        topic: Option<String>,
    },
    PresentStop,
    Mute {
        target_uid: u32,
    },
    Unmute {
        target_uid: u32,
    },
    Logout,
}

impl ClientMessage {
    /// Parses one control line. `Err` carries the reason used in the
    /// `error` reply; the raw serde message is logged by the caller.
    pub fn parse(line: &str) -> HubResult<Self> {
        serde_json::from_str(line).map_err(|e| HubError::Malformed(e.to_string()))
    }
}

/// Messages the hub sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LoginSuccess {
        uid: u32,
    },
    ParticipantList {
        participants: Vec<ParticipantSummary>,
    },
    History {
        messages: Vec<ChatEntry>,
    },
    UserJoined {
        uid: u32,
        username: String,
    },
    UserLeft {
        uid: u32,
        username: String,
    },
    HeartbeatAck,
    Chat {
        uid: u32,
        username: String,
        text: String,
        ts: String,
    },
    Broadcast {
        uid: u32,
        username: String,
        text: String,
        ts: String,
    },
    Unicast {
        from_uid: u32,
        from_username: String,
        to_uid: u32,
        to_username: String,
        text: String,
        ts: String,
    },
    UnicastSent {
        target_uid: u32,
    },
    FileUploadPort {
        port: u16,
        fid: Uuid,
    },
    FileDownloadPort {
        port: u16,
        fid: Uuid,
        filename: String,
        size: u64,
    },
    FileAvailable {
        fid: Uuid,
        filename: String,
        size: u64,
        offerer_uid: u32,
        offerer_username: String,
    },
    PresentStartBroadcast {
        uid: u32,
        username: String,
        topic: Option<String>,
    },
    PresentStopBroadcast {
        uid: u32,
    },
    MuteAck {
        target_uid: u32,
        muted: bool,
    },
    Error {
        reason: String,
    },
}

impl ServerMessage {
    /// Builds the `error` reply for a failed operation.
    pub fn error_for(err: &HubError) -> Self {
        Self::Error {
            reason: err.reason().to_string(),
        }
    }

    /// Serializes to the single-line wire form (no trailing LF; the codec
    /// appends it).
    pub fn to_line(&self) -> String {
        // Serialization of these variants cannot fail; fall back to a bare
        // error object rather than poisoning the writer.
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","reason":"internal"}"#.to_string())
    }
}
