//! Fixed-layout UDP datagram headers for the media planes.
//!
//! All multi-byte fields are big-endian. The audio header is 16 bytes, the
//! video header 24 (the listed fields occupy 16; the remaining 8 are
//! reserved and must be zero).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{HubError, HubResult};
use crate::protocol_constants::{
    AUDIO_HEADER_BYTES, MAX_AUDIO_PAYLOAD_BYTES, VIDEO_HEADER_BYTES,
};

/// Audio header flags, bit 0: datagram originates from the server (mixed
/// output) rather than a participant.
pub const FLAG_SERVER_ORIGIN: u32 = 1;

/// Sender uid used in server-origin audio datagrams.
pub const SERVER_UID: u32 = 0;

/// One audio datagram: `{uid, seq, flags, length}` + Opus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub uid: u32,
    pub seq: u32,
    pub flags: u32,
    pub payload: Bytes,
}

impl AudioPacket {
    /// Builds a server-origin packet carrying one mixed frame.
    pub fn mixed(seq: u32, payload: Bytes) -> Self {
        Self {
            uid: SERVER_UID,
            seq,
            flags: FLAG_SERVER_ORIGIN,
            payload,
        }
    }

    /// Encodes header + payload into a single datagram buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_BYTES + self.payload.len());
        buf.put_u32(self.uid);
        buf.put_u32(self.seq);
        buf.put_u32(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a datagram. Rejects truncated headers, length mismatches,
    /// and payloads beyond the Opus size bound.
    pub fn decode(datagram: &[u8]) -> HubResult<Self> {
        if datagram.len() < AUDIO_HEADER_BYTES {
            return Err(HubError::Malformed("short audio header".into()));
        }
        let mut buf = datagram;
        let uid = buf.get_u32();
        let seq = buf.get_u32();
        let flags = buf.get_u32();
        let length = buf.get_u32() as usize;
        if length != buf.remaining() || length > MAX_AUDIO_PAYLOAD_BYTES {
            return Err(HubError::Malformed("audio length mismatch".into()));
        }
        Ok(Self {
            uid,
            seq,
            flags,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Media stream kind carried in video datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Webcam,
    Screen,
}

impl StreamKind {
    /// Wire value of the kind byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Webcam => 0,
            Self::Screen => 1,
        }
    }

    /// Parses the kind byte.
    pub fn from_u8(value: u8) -> HubResult<Self> {
        match value {
            0 => Ok(Self::Webcam),
            1 => Ok(Self::Screen),
            other => Err(HubError::Malformed(format!("stream kind {other}"))),
        }
    }
}

/// One video datagram: a slice of a chunked JPEG frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoChunk {
    pub sender_uid: u32,
    pub kind: StreamKind,
    pub frame_id: u32,
    pub chunk_index: u16,
    pub chunk_total: u16,
    pub payload: Bytes,
}

impl VideoChunk {
    /// Encodes header + payload into a single datagram buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VIDEO_HEADER_BYTES + self.payload.len());
        buf.put_u32(self.sender_uid);
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(self.frame_id);
        buf.put_u16(self.chunk_index);
        buf.put_u16(self.chunk_total);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u8(0); // reserved
        buf.put_bytes(0, VIDEO_HEADER_BYTES - 16); // reserved tail
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a datagram, validating chunk geometry.
    pub fn decode(datagram: &[u8]) -> HubResult<Self> {
        if datagram.len() < VIDEO_HEADER_BYTES {
            return Err(HubError::Malformed("short video header".into()));
        }
        let mut buf = datagram;
        let sender_uid = buf.get_u32();
        let kind = StreamKind::from_u8(buf.get_u8())?;
        let frame_id = buf.get_u32();
        let chunk_index = buf.get_u16();
        let chunk_total = buf.get_u16();
        let payload_len = buf.get_u16() as usize;
        buf.advance(1 + (VIDEO_HEADER_BYTES - 16));
        if chunk_total == 0 || chunk_index >= chunk_total {
            return Err(HubError::Malformed("chunk index out of range".into()));
        }
        if payload_len != buf.remaining() {
            return Err(HubError::Malformed("video length mismatch".into()));
        }
        Ok(Self {
            sender_uid,
            kind,
            frame_id,
            chunk_index,
            chunk_total,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Splits a complete frame into MTU-safe chunks sharing one `frame_id`.
///
/// Empty frames produce a single empty chunk so receivers still observe the
/// frame boundary.
pub fn chunk_frame(
    sender_uid: u32,
    kind: StreamKind,
    frame_id: u32,
    frame: &Bytes,
    max_payload: usize,
) -> Vec<VideoChunk> {
    let total = frame.len().div_ceil(max_payload).max(1) as u16;
    (0..total as usize)
        .map(|i| {
            let start = i * max_payload;
            let end = (start + max_payload).min(frame.len());
            VideoChunk {
                sender_uid,
                kind,
                frame_id,
                chunk_index: i as u16,
                chunk_total: total,
                payload: frame.slice(start..end),
            }
        })
        .collect()
}
