//! Video and screen-share fan-out.
//!
//! No transcoding happens here: complete JPEG frames are reassembled from
//! inbound chunks purely so they can be re-chunked and sent to every other
//! participant that has an endpoint learned for the same stream kind.
//! Webcam and screen share are independent planes over one socket.

mod assembler;

pub use assembler::FrameAssembler;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::HubResult;
use crate::protocol_constants::{MAX_VIDEO_CHUNK_BYTES, VIDEO_HEADER_BYTES};
use crate::registry::Registry;
use crate::state::Config;
use crate::wire::{chunk_frame, StreamKind, VideoChunk};

/// The video/screen-share fan-out engine.
pub struct VideoFanout {
    socket: UdpSocket,
    registry: Arc<Registry>,
    /// One assembler per (sender, stream kind).
    assemblers: DashMap<(u32, StreamKind), Arc<Mutex<FrameAssembler>>>,
    /// Learned return endpoints per (participant, stream kind).
    endpoints: DashMap<(u32, StreamKind), SocketAddr>,
}

impl VideoFanout {
    /// Binds the video socket. Bind failure is fatal to startup.
    pub async fn bind(config: &Config, registry: Arc<Registry>) -> HubResult<Arc<Self>> {
        let socket = UdpSocket::bind((config.host.as_str(), config.video_port)).await?;
        log::info!("[Video] fan-out listening on {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            socket,
            registry,
            assemblers: DashMap::new(),
            endpoints: DashMap::new(),
        }))
    }

    /// Local address of the video socket.
    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Ingress loop: reassemble and rebroadcast until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; VIDEO_HEADER_BYTES + MAX_VIDEO_CHUNK_BYTES + 64];
        loop {
            let (len, src) = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("[Video] recv error: {e}");
                        continue;
                    }
                },
            };
            self.handle_datagram(&buf[..len], src).await;
        }
        log::info!("[Video] fan-out stopped");
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        let chunk = match VideoChunk::decode(datagram) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("[Video] dropped datagram from {src}: {e}");
                return;
            }
        };
        let Some(participant) = self.registry.lookup(chunk.sender_uid) else {
            log::debug!("[Video] datagram from unregistered uid {}", chunk.sender_uid);
            return;
        };

        let key = (chunk.sender_uid, chunk.kind);
        self.endpoints.insert(key, src);
        participant.set_video_active(true);

        let assembler = self
            .assemblers
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(FrameAssembler::new())))
            .clone();

        let sender_uid = chunk.sender_uid;
        let kind = chunk.kind;
        let frame_id = chunk.frame_id;
        let complete = assembler.lock().insert(chunk);
        if let Some(frame) = complete {
            self.rebroadcast(sender_uid, kind, frame_id, frame).await;
        }
    }

    /// Re-chunks a complete frame and sends it to every other participant
    /// with a learned endpoint for the same stream kind.
    async fn rebroadcast(&self, sender_uid: u32, kind: StreamKind, frame_id: u32, frame: Bytes) {
        // Shed endpoints of participants that logged out.
        self.endpoints
            .retain(|(uid, _), _| self.registry.lookup(*uid).is_some());

        let targets: Vec<SocketAddr> = self
            .endpoints
            .iter()
            .filter(|entry| {
                let (uid, entry_kind) = *entry.key();
                entry_kind == kind && uid != sender_uid
            })
            .map(|entry| *entry.value())
            .collect();
        if targets.is_empty() {
            return;
        }

        let chunks = chunk_frame(sender_uid, kind, frame_id, &frame, MAX_VIDEO_CHUNK_BYTES);
        for target in targets {
            for chunk in &chunks {
                if let Err(e) = self.socket.send_to(&chunk.encode(), target).await {
                    log::debug!("[Video] send to {target} failed: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Mailbox;
    use std::time::Duration;

    async fn recv_chunks(
        socket: &UdpSocket,
        want_frame_bytes: usize,
    ) -> Vec<VideoChunk> {
        let mut buf = vec![0u8; 2048];
        let mut chunks = Vec::new();
        let mut got = 0usize;
        while got < want_frame_bytes {
            match tokio::time::timeout(Duration::from_millis(500), socket.recv_from(&mut buf))
                .await
            {
                Ok(Ok((len, _))) => {
                    let chunk = VideoChunk::decode(&buf[..len]).unwrap();
                    got += chunk.payload.len();
                    chunks.push(chunk);
                }
                _ => break,
            }
        }
        chunks
    }

    #[tokio::test]
    async fn complete_frames_reach_every_other_participant() {
        let registry = Arc::new(Registry::new());
        let config = Config {
            host: "127.0.0.1".to_string(),
            video_port: 0,
            ..Default::default()
        };
        let fanout = VideoFanout::bind(&config, Arc::clone(&registry)).await.unwrap();
        let addr = fanout.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&fanout).run(cancel.child_token()));

        let a = registry.register("a", Arc::new(Mailbox::new(8))).unwrap();
        let b = registry.register("b", Arc::new(Mailbox::new(8))).unwrap();
        let c = registry.register("c", Arc::new(Mailbox::new(8))).unwrap();

        let sock_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock_c = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // B and C announce themselves on the webcam plane so the hub
        // learns their endpoints.
        for (sock, uid) in [(&sock_b, b.uid), (&sock_c, c.uid)] {
            let hello = chunk_frame(uid, StreamKind::Webcam, 1, &Bytes::from_static(b"x"), 1400);
            sock.send_to(&hello[0].encode(), addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A sends a multi-chunk frame.
        let jpeg: Vec<u8> = (0..3500u32).map(|i| (i % 253) as u8).collect();
        let frame = Bytes::from(jpeg.clone());
        for chunk in chunk_frame(a.uid, StreamKind::Webcam, 42, &frame, 1400) {
            sock_a.send_to(&chunk.encode(), addr).await.unwrap();
        }

        for (name, sock) in [("b", &sock_b), ("c", &sock_c)] {
            let chunks = recv_chunks(sock, jpeg.len()).await;
            let from_a: Vec<&VideoChunk> = chunks
                .iter()
                .filter(|ch| ch.sender_uid == a.uid && ch.frame_id == 42)
                .collect();
            assert!(!from_a.is_empty(), "{name} received nothing from a");
            let mut assembler = FrameAssembler::new();
            let mut complete = None;
            for chunk in from_a {
                complete = assembler.insert(chunk.clone()).or(complete);
            }
            assert_eq!(
                complete.expect("frame incomplete").as_ref(),
                jpeg.as_slice(),
                "{name} got a corrupted frame"
            );
        }

        // The sender must not receive its own frame back.
        let mut buf = [0u8; 2048];
        let echoed = tokio::time::timeout(
            Duration::from_millis(300),
            sock_a.recv_from(&mut buf),
        )
        .await;
        assert!(echoed.is_err(), "sender received its own frame");

        cancel.cancel();
    }

    #[tokio::test]
    async fn screen_and_webcam_planes_are_independent() {
        let registry = Arc::new(Registry::new());
        let config = Config {
            host: "127.0.0.1".to_string(),
            video_port: 0,
            ..Default::default()
        };
        let fanout = VideoFanout::bind(&config, Arc::clone(&registry)).await.unwrap();
        let addr = fanout.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&fanout).run(cancel.child_token()));

        let a = registry.register("a", Arc::new(Mailbox::new(8))).unwrap();
        let b = registry.register("b", Arc::new(Mailbox::new(8))).unwrap();

        let sock_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // B is only on the webcam plane.
        let hello = chunk_frame(b.uid, StreamKind::Webcam, 1, &Bytes::from_static(b"x"), 1400);
        sock_b.send_to(&hello[0].encode(), addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A presents a screen frame; B has no screen endpoint, so nothing
        // should arrive.
        for chunk in chunk_frame(
            a.uid,
            StreamKind::Screen,
            7,
            &Bytes::from_static(b"screen frame"),
            1400,
        ) {
            sock_a.send_to(&chunk.encode(), addr).await.unwrap();
        }

        let mut buf = [0u8; 2048];
        let received = tokio::time::timeout(
            Duration::from_millis(300),
            sock_b.recv_from(&mut buf),
        )
        .await;
        assert!(received.is_err(), "screen frame leaked onto webcam plane");

        cancel.cancel();
    }
}
