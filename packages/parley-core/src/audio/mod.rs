//! Server-side audio mixing.
//!
//! Participants send Opus datagrams to the audio socket; the mixer decodes
//! them into per-participant jitter slots, and a single 40 ms tick task
//! sums everyone into a global mix, personalizes it per listener (minus
//! their own signal and their muted peers), re-encodes, and sends it back
//! to each participant's learned endpoint.
//!
//! The tick task is the only consumer of every slot; ingress is the only
//! producer. Slot locks are taken in ascending uid order during the tick.

mod codec;
mod jitter;

pub use codec::{FrameDecoder, FrameEncoder};
pub use jitter::JitterSlot;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::HubResult;
use crate::protocol_constants::{
    AUDIO_HEADER_BYTES, MAX_AUDIO_PAYLOAD_BYTES, MIX_TICK_MS, SAMPLES_PER_FRAME,
};
use crate::registry::Registry;
use crate::state::Config;
use crate::wire::{AudioPacket, FLAG_SERVER_ORIGIN};

/// Per-participant audio state: jitter slot, codec pair, and the learned
/// return endpoint.
struct AudioLane {
    slot: Mutex<JitterSlot>,
    decoder: Mutex<FrameDecoder>,
    /// Encoder for this listener's personalized mix. Opus state is per
    /// stream, so each listener needs its own.
    encoder: Mutex<FrameEncoder>,
    endpoint: Mutex<Option<SocketAddr>>,
}

impl AudioLane {
    fn new() -> HubResult<Self> {
        Ok(Self {
            slot: Mutex::new(JitterSlot::new()),
            decoder: Mutex::new(FrameDecoder::new()?),
            encoder: Mutex::new(FrameEncoder::new()?),
            endpoint: Mutex::new(None),
        })
    }
}

/// The audio mix engine.
pub struct AudioMixer {
    socket: UdpSocket,
    registry: Arc<Registry>,
    lanes: DashMap<u32, Arc<AudioLane>>,
    tick: AtomicU32,
}

impl AudioMixer {
    /// Binds the audio socket. Bind failure is fatal to startup.
    pub async fn bind(config: &Config, registry: Arc<Registry>) -> HubResult<Arc<Self>> {
        let socket = UdpSocket::bind((config.host.as_str(), config.audio_port)).await?;
        log::info!("[Audio] mixer listening on {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            socket,
            registry,
            lanes: DashMap::new(),
            tick: AtomicU32::new(0),
        }))
    }

    /// Local address of the audio socket.
    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Ingress loop: decode datagrams into jitter slots until cancelled.
    pub async fn run_ingress(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; AUDIO_HEADER_BYTES + MAX_AUDIO_PAYLOAD_BYTES];
        loop {
            let (len, src) = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("[Audio] recv error: {e}");
                        continue;
                    }
                },
            };
            self.ingest(&buf[..len], src);
        }
        log::info!("[Audio] ingress stopped");
    }

    fn ingest(&self, datagram: &[u8], src: SocketAddr) {
        let packet = match AudioPacket::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[Audio] dropped datagram from {src}: {e}");
                return;
            }
        };
        // Never ingest our own mixed output.
        if packet.flags & FLAG_SERVER_ORIGIN != 0 {
            return;
        }
        let Some(participant) = self.registry.lookup(packet.uid) else {
            log::debug!("[Audio] datagram from unregistered uid {}", packet.uid);
            return;
        };

        let lane = match self.lane_for(packet.uid) {
            Ok(lane) => lane,
            Err(e) => {
                log::warn!("[Audio] no lane for uid {}: {e}", packet.uid);
                return;
            }
        };
        *lane.endpoint.lock() = Some(src);
        participant.set_audio_active(true);

        match lane.decoder.lock().decode(&packet.payload) {
            Ok(pcm) => lane.slot.lock().insert(packet.seq, pcm),
            Err(e) => log::debug!("[Audio] decode failed for uid {}: {e}", packet.uid),
        };
    }

    fn lane_for(&self, uid: u32) -> HubResult<Arc<AudioLane>> {
        if let Some(lane) = self.lanes.get(&uid) {
            return Ok(Arc::clone(lane.value()));
        }
        let lane = Arc::new(AudioLane::new()?);
        self.lanes.insert(uid, Arc::clone(&lane));
        Ok(lane)
    }

    /// Mix tick loop: one personalized frame per listener every 40 ms.
    ///
    /// `MissedTickBehavior::Delay` fires a late tick immediately and
    /// re-spaces from there, so an overrun coalesces into at most one
    /// catch-up tick.
    pub async fn run_mixer(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(MIX_TICK_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.mix_once().await,
            }
        }
        log::info!("[Audio] mixer stopped");
    }

    async fn mix_once(&self) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);

        // Drop lanes whose participant logged out.
        self.lanes
            .retain(|uid, _| self.registry.lookup(*uid).is_some());

        // Pop this tick's frame from every lane, ascending uid order.
        let mut entries = Vec::new();
        for participant in self.registry.all() {
            let Some(lane) = self.lanes.get(&participant.uid).map(|r| Arc::clone(r.value()))
            else {
                continue;
            };
            let frame = {
                let mut slot = lane.slot.lock();
                let frame = slot.pop();
                if slot.is_stale() {
                    slot.reset();
                    participant.set_audio_active(false);
                }
                frame
            };
            entries.push((participant, lane, frame));
        }
        if entries.is_empty() {
            return;
        }

        let global = mix_global(entries.iter().map(|(_, _, f)| f.as_deref()));

        for (participant, lane, own) in &entries {
            let Some(endpoint) = *lane.endpoint.lock() else {
                continue;
            };
            let muted = participant.muted_peers();
            let excluded = entries
                .iter()
                .filter(|(p, _, f)| muted.contains(&p.uid) && f.is_some())
                .map(|(_, _, f)| f.as_deref().unwrap());
            let pcm = personalize(&global, own.as_deref(), excluded);

            let payload = match lane.encoder.lock().encode(&pcm) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("[Audio] encode failed for uid {}: {e}", participant.uid);
                    continue;
                }
            };
            let datagram = AudioPacket::mixed(tick, Bytes::from(payload)).encode();
            if let Err(e) = self.socket.send_to(&datagram, endpoint).await {
                log::debug!("[Audio] send to {endpoint} failed: {e}");
            }
        }
    }
}

/// Sums all present frames into a widened mix buffer.
fn mix_global<'a>(frames: impl Iterator<Item = Option<&'a [i16]>>) -> Vec<i32> {
    let mut mix = vec![0i32; SAMPLES_PER_FRAME];
    for frame in frames.flatten() {
        for (acc, sample) in mix.iter_mut().zip(frame) {
            *acc += *sample as i32;
        }
    }
    mix
}

/// One listener's mix: the global sum minus their own frame and the
/// frames of peers they muted, saturated back down to i16.
fn personalize<'a>(
    global: &[i32],
    own: Option<&[i16]>,
    excluded: impl Iterator<Item = &'a [i16]>,
) -> Vec<i16> {
    let mut out = global.to_vec();
    if let Some(own) = own {
        for (acc, sample) in out.iter_mut().zip(own) {
            *acc -= *sample as i32;
        }
    }
    for frame in excluded {
        for (acc, sample) in out.iter_mut().zip(frame) {
            *acc -= *sample as i32;
        }
    }
    out.into_iter()
        .map(|s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16) -> Vec<i16> {
        vec![amplitude; SAMPLES_PER_FRAME]
    }

    #[test]
    fn silence_mixes_to_all_zero() {
        let frames: Vec<Option<&[i16]>> = vec![None, None, None];
        let global = mix_global(frames.into_iter());
        assert!(global.iter().all(|&s| s == 0));
        let pcm = personalize(&global, None, std::iter::empty());
        assert!(pcm.iter().all(|&s| s == 0));
    }

    #[test]
    fn listener_never_hears_own_signal() {
        let own = tone(8000);
        let peer = tone(-3000);
        let frames: Vec<Option<&[i16]>> = vec![Some(&own), Some(&peer)];
        let global = mix_global(frames.into_iter());
        let pcm = personalize(&global, Some(&own), std::iter::empty());
        assert!(pcm.iter().all(|&s| s == -3000));
    }

    #[test]
    fn muted_peers_are_excluded() {
        let own = tone(100);
        let friendly = tone(500);
        let muted = tone(9000);
        let frames: Vec<Option<&[i16]>> = vec![Some(&own), Some(&friendly), Some(&muted)];
        let global = mix_global(frames.into_iter());
        let pcm = personalize(&global, Some(&own), std::iter::once(muted.as_slice()));
        assert!(pcm.iter().all(|&s| s == 500));
    }

    #[test]
    fn downmix_saturates_instead_of_wrapping() {
        let loud_a = tone(i16::MAX);
        let loud_b = tone(i16::MAX);
        let frames: Vec<Option<&[i16]>> = vec![Some(&loud_a), Some(&loud_b)];
        let global = mix_global(frames.into_iter());
        let pcm = personalize(&global, None, std::iter::empty());
        assert!(pcm.iter().all(|&s| s == i16::MAX));
    }

    #[tokio::test]
    async fn mixed_output_excludes_sender_tone() {
        use crate::chat::Mailbox;

        let registry = Arc::new(Registry::new());
        let config = Config {
            host: "127.0.0.1".to_string(),
            audio_port: 0,
            ..Default::default()
        };
        let mixer = AudioMixer::bind(&config, Arc::clone(&registry)).await.unwrap();
        let addr = mixer.local_addr().unwrap();

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&mixer).run_ingress(cancel.child_token()));
        tokio::spawn(Arc::clone(&mixer).run_mixer(cancel.child_token()));

        let a = registry
            .register("a", Arc::new(Mailbox::new(8)))
            .unwrap();
        let b = registry
            .register("b", Arc::new(Mailbox::new(8)))
            .unwrap();

        // A sends a loud square-ish tone, B sends silence.
        let sock_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut enc_a = FrameEncoder::new().unwrap();
        let mut enc_b = FrameEncoder::new().unwrap();
        let tone_pcm: Vec<i16> = (0..SAMPLES_PER_FRAME)
            .map(|i| if (i / 24) % 2 == 0 { 12000 } else { -12000 })
            .collect();
        let silence_pcm = vec![0i16; SAMPLES_PER_FRAME];

        for seq in 0..30u32 {
            let pkt_a = AudioPacket {
                uid: a.uid,
                seq,
                flags: 0,
                payload: Bytes::from(enc_a.encode(&tone_pcm).unwrap()),
            };
            let pkt_b = AudioPacket {
                uid: b.uid,
                seq,
                flags: 0,
                payload: Bytes::from(enc_b.encode(&silence_pcm).unwrap()),
            };
            sock_a.send_to(&pkt_a.encode(), addr).await.unwrap();
            sock_b.send_to(&pkt_b.encode(), addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(MIX_TICK_MS)).await;
        }

        // Collect a handful of mixed packets at each listener.
        let mut rms_a = Vec::new();
        let mut rms_b = Vec::new();
        let mut dec_a = FrameDecoder::new().unwrap();
        let mut dec_b = FrameDecoder::new().unwrap();
        let mut buf = vec![0u8; 4096];
        for _ in 0..8 {
            if let Ok(Ok((len, _))) = tokio::time::timeout(
                Duration::from_millis(200),
                sock_a.recv_from(&mut buf),
            )
            .await
            {
                let packet = AudioPacket::decode(&buf[..len]).unwrap();
                assert_eq!(packet.uid, 0);
                assert_ne!(packet.flags & FLAG_SERVER_ORIGIN, 0);
                if let Ok(pcm) = dec_a.decode(&packet.payload) {
                    rms_a.push(rms(&pcm));
                }
            }
            if let Ok(Ok((len, _))) = tokio::time::timeout(
                Duration::from_millis(200),
                sock_b.recv_from(&mut buf),
            )
            .await
            {
                let packet = AudioPacket::decode(&buf[..len]).unwrap();
                if let Ok(pcm) = dec_b.decode(&packet.payload) {
                    rms_b.push(rms(&pcm));
                }
            }
        }
        cancel.cancel();

        assert!(!rms_a.is_empty(), "listener A received no mixed audio");
        assert!(!rms_b.is_empty(), "listener B received no mixed audio");
        // A hears only B's silence; B hears A's tone.
        let quietest_a = rms_a.iter().cloned().fold(f64::MAX, f64::min);
        let loudest_b = rms_b.iter().cloned().fold(0.0f64, f64::max);
        assert!(
            quietest_a < 500.0,
            "sender's own tone leaked into their mix (rms {quietest_a})"
        );
        assert!(
            loudest_b > 2000.0,
            "peer tone missing from listener mix (rms {loudest_b})"
        );
    }

    fn rms(pcm: &[i16]) -> f64 {
        let sum: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / pcm.len() as f64).sqrt()
    }
}
