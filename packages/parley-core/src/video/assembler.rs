//! Chunked JPEG frame reassembly.
//!
//! Each sender/stream pair gets one assembler. Frames arrive as MTU-sized
//! chunks in any order; a frame is delivered once every chunk is present.
//! Memory stays bounded two ways: partial frames are discarded after
//! 500 ms, and frame ids falling behind the newest by more than the
//! horizon are dropped outright.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::protocol_constants::{ASSEMBLER_FRAME_HORIZON, PARTIAL_FRAME_TTL_MS};
use crate::wire::VideoChunk;

struct PartialFrame {
    total: u16,
    received: u16,
    chunks: Vec<Option<Bytes>>,
    first_seen: Instant,
}

impl PartialFrame {
    fn new(total: u16, first_seen: Instant) -> Self {
        Self {
            total,
            received: 0,
            chunks: vec![None; total as usize],
            first_seen,
        }
    }
}

/// Reassembles one sender's chunked frames for one stream kind.
pub struct FrameAssembler {
    frames: HashMap<u32, PartialFrame>,
    latest: u32,
    discarded: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            frames: HashMap::new(),
            latest: 0,
            discarded: 0,
        }
    }

    /// Inserts a chunk; returns the complete frame bytes once the last
    /// piece lands.
    pub fn insert(&mut self, chunk: VideoChunk) -> Option<Bytes> {
        self.insert_at(chunk, Instant::now())
    }

    /// [`insert`](Self::insert) with an explicit clock, for tests.
    pub fn insert_at(&mut self, chunk: VideoChunk, now: Instant) -> Option<Bytes> {
        self.latest = self.latest.max(chunk.frame_id);
        self.sweep(now);

        if chunk.frame_id.saturating_add(ASSEMBLER_FRAME_HORIZON) < self.latest {
            self.discarded += 1;
            return None;
        }

        let partial = self
            .frames
            .entry(chunk.frame_id)
            .or_insert_with(|| PartialFrame::new(chunk.chunk_total, now));
        if partial.total != chunk.chunk_total {
            // Sender restarted the frame with different geometry; start over.
            *partial = PartialFrame::new(chunk.chunk_total, now);
        }

        let index = chunk.chunk_index as usize;
        if partial.chunks[index].is_none() {
            partial.chunks[index] = Some(chunk.payload);
            partial.received += 1;
        }
        if partial.received < partial.total {
            return None;
        }

        let partial = self.frames.remove(&chunk.frame_id)?;
        let mut frame = BytesMut::new();
        for piece in partial.chunks.into_iter().flatten() {
            frame.extend_from_slice(&piece);
        }
        Some(frame.freeze())
    }

    /// Drops stale partials and everything behind the frame-id horizon.
    fn sweep(&mut self, now: Instant) {
        let ttl = Duration::from_millis(PARTIAL_FRAME_TTL_MS);
        let horizon = self.latest.saturating_sub(ASSEMBLER_FRAME_HORIZON);
        let before = self.frames.len();
        self.frames
            .retain(|id, partial| *id >= horizon && now.duration_since(partial.first_seen) < ttl);
        self.discarded += (before - self.frames.len()) as u64;
    }

    /// Partial frames discarded so far (stale or behind the horizon).
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.frames.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
