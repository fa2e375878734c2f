//! Centralized error types for the Parley core library.
//!
//! Every failure a control session can observe maps onto one of these
//! variants; the `reason()` string is what goes on the wire in an `error`
//! reply. Variants also carry a coarse [`ErrorClass`] used by the session
//! loop to decide whether the connection survives the error.

use thiserror::Error;
use uuid::Uuid;

/// Coarse error classification, mirroring the propagation policy:
/// protocol and lookup failures keep the session alive, transport
/// failures end it, transfer failures mark the offer and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Auth,
    Resource,
    NotFound,
    Transfer,
    Transport,
}

/// Application-wide error type for the conferencing hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// Line was not a valid JSON control message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Control line exceeded the 64 KiB frame limit.
    #[error("control frame too large")]
    FrameTooLarge,

    /// Message type not valid in the session's current phase.
    #[error("unexpected message type in this state")]
    Unexpected,

    /// Login with a blank display name.
    #[error("display name must not be empty")]
    NameEmpty,

    /// Login with a display name over the byte limit.
    #[error("display name exceeds {0} bytes")]
    NameTooLong(usize),

    /// Chat text over the 4 KiB limit.
    #[error("chat text too long")]
    TextTooLong,

    /// Offered file exceeds the size cap.
    #[error("file size {0} exceeds limit")]
    SizeExceeded(u64),

    /// Filename reduced to nothing after sanitization.
    #[error("invalid filename")]
    InvalidFilename,

    /// Could not allocate an ephemeral listener port.
    #[error("no ephemeral port available")]
    NoPort,

    /// A file offer with this fid already exists.
    #[error("duplicate file offer {0}")]
    DuplicateOffer(Uuid),

    /// Referenced participant is not registered.
    #[error("unknown participant {0}")]
    UnknownParticipant(u32),

    /// Referenced file offer does not exist.
    #[error("unknown file offer {0}")]
    UnknownOffer(Uuid),

    /// File offer exists but is not in the `available` state.
    #[error("file offer {0} is not available")]
    OfferNotAvailable(Uuid),

    /// Transfer ended early, read/wrote the wrong byte count, or hit disk
    /// trouble.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Transfer listener reached its deadline without completing.
    #[error("transfer deadline expired")]
    DeadlineExpired,

    /// Opus encode/decode failure. Never surfaces on the control channel;
    /// media errors are silent at the protocol level.
    #[error("codec error: {0}")]
    Codec(String),

    /// Peer reset, socket closed, or other I/O failure on an established
    /// connection.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Returns the stable reason string used in `error` replies.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::FrameTooLarge => "frame too large",
            Self::Unexpected => "unexpected message type",
            Self::NameEmpty => "name empty",
            Self::NameTooLong(_) => "name too long",
            Self::TextTooLong => "text too long",
            Self::SizeExceeded(_) => "size exceeds limit",
            Self::InvalidFilename => "invalid filename",
            Self::NoPort => "no ephemeral port available",
            Self::DuplicateOffer(_) => "duplicate fid",
            Self::UnknownParticipant(_) => "unknown participant",
            Self::UnknownOffer(_) => "unknown fid",
            Self::OfferNotAvailable(_) => "file not available",
            Self::Transfer(_) => "transfer failed",
            Self::DeadlineExpired => "transfer deadline expired",
            Self::Codec(_) => "codec error",
            Self::Io(_) => "io error",
        }
    }

    /// Classifies the error for session handling.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Malformed(_) | Self::FrameTooLarge | Self::Unexpected => ErrorClass::Protocol,
            Self::NameEmpty | Self::NameTooLong(_) => ErrorClass::Auth,
            Self::TextTooLong => ErrorClass::Protocol,
            Self::SizeExceeded(_)
            | Self::InvalidFilename
            | Self::NoPort
            | Self::DuplicateOffer(_) => ErrorClass::Resource,
            Self::UnknownParticipant(_) | Self::UnknownOffer(_) | Self::OfferNotAvailable(_) => {
                ErrorClass::NotFound
            }
            Self::Transfer(_) | Self::DeadlineExpired | Self::Codec(_) => ErrorClass::Transfer,
            Self::Io(_) => ErrorClass::Transport,
        }
    }

    /// Whether replying to this error should be followed by closing the
    /// control session. Only oversize frames and login failures close;
    /// everything else keeps the session alive.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge | Self::NameEmpty | Self::NameTooLong(_) | Self::Io(_)
        )
    }
}

/// Convenient Result alias for hub-wide operations.
pub type HubResult<T> = Result<T, HubError>;
