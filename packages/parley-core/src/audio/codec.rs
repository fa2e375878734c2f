//! Thin wrappers around the Opus codec.
//!
//! The mixer treats the codec as opaque: 40 ms of mono 48 kHz PCM in,
//! an encoded payload out, and back. Encoder and decoder state is per
//! stream, so every participant lane owns one of each.

use crate::error::{HubError, HubResult};
use crate::protocol_constants::{MAX_AUDIO_PAYLOAD_BYTES, SAMPLES_PER_FRAME, SAMPLE_RATE};

impl From<opus::Error> for HubError {
    fn from(err: opus::Error) -> Self {
        HubError::Codec(err.to_string())
    }
}

/// Stateful decoder for one participant's inbound stream.
pub struct FrameDecoder {
    inner: opus::Decoder,
}

impl FrameDecoder {
    pub fn new() -> HubResult<Self> {
        Ok(Self {
            inner: opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)?,
        })
    }

    /// Decodes one payload into exactly one tick's worth of PCM.
    ///
    /// Payloads that decode to any other frame length are rejected; the
    /// wire carries 40 ms frames only.
    pub fn decode(&mut self, payload: &[u8]) -> HubResult<Vec<i16>> {
        let mut pcm = vec![0i16; SAMPLES_PER_FRAME];
        let samples = self.inner.decode(payload, &mut pcm, false)?;
        if samples != SAMPLES_PER_FRAME {
            return Err(HubError::Codec(format!(
                "frame of {samples} samples, expected {SAMPLES_PER_FRAME}"
            )));
        }
        Ok(pcm)
    }
}

/// Stateful encoder for one listener's personalized mix.
pub struct FrameEncoder {
    inner: opus::Encoder,
    out: Vec<u8>,
}

impl FrameEncoder {
    pub fn new() -> HubResult<Self> {
        Ok(Self {
            inner: opus::Encoder::new(
                SAMPLE_RATE,
                opus::Channels::Mono,
                opus::Application::Voip,
            )?,
            out: vec![0u8; MAX_AUDIO_PAYLOAD_BYTES],
        })
    }

    /// Encodes one tick's worth of PCM into an Opus payload.
    pub fn encode(&mut self, pcm: &[i16]) -> HubResult<Vec<u8>> {
        debug_assert_eq!(pcm.len(), SAMPLES_PER_FRAME);
        let written = self.inner.encode(pcm, &mut self.out)?;
        Ok(self.out[..written].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_frame_length() {
        let mut encoder = FrameEncoder::new().unwrap();
        let mut decoder = FrameDecoder::new().unwrap();

        let pcm = vec![0i16; SAMPLES_PER_FRAME];
        let payload = encoder.encode(&pcm).unwrap();
        assert!(!payload.is_empty());
        assert!(payload.len() <= MAX_AUDIO_PAYLOAD_BYTES);

        let decoded = decoder.decode(&payload).unwrap();
        assert_eq!(decoded.len(), SAMPLES_PER_FRAME);
    }

    #[test]
    fn silence_round_trips_quietly() {
        let mut encoder = FrameEncoder::new().unwrap();
        let mut decoder = FrameDecoder::new().unwrap();

        let pcm = vec![0i16; SAMPLES_PER_FRAME];
        let decoded = decoder.decode(&encoder.encode(&pcm).unwrap()).unwrap();
        let peak = decoded.iter().map(|s| s.unsigned_abs() as u32).max().unwrap();
        // Opus is lossy; silence should still come back essentially silent.
        assert!(peak < 64, "silence decoded with peak {peak}");
    }
}
