//! Opus voice codec for the 20 ms mono frame format
//!
//! Everything on the wire is Opus at 48 kHz mono; a frame is always 960
//! samples. An empty packet stands for silence and never reaches libopus.
//! Codec failures degrade to silence so the pipeline cadence is preserved.

use tracing::warn;

use super::error::AudioError;

/// Sample rate used throughout the audio path
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples per channel in one frame (20 ms @ 48 kHz)
pub const FRAME_SAMPLES: usize = 960;

/// Frame duration in milliseconds
pub const FRAME_MILLIS: u64 = 20;

/// Largest Opus packet the encoder may produce
pub const MAX_PACKET_SIZE: usize = 1276;

/// Target encoder bitrate in bits per second
const TARGET_BITRATE: i32 = 32_000;

/// Voice encoder producing one Opus packet per frame
pub struct VoiceEncoder {
    encoder: opus::Encoder,
    packet_buf: Vec<u8>,
    frame_buf: Vec<i16>,
}

impl VoiceEncoder {
    /// Create an encoder configured for voice (voip application, 32 kbps)
    pub fn new() -> Result<Self, AudioError> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| AudioError::CodecInit(format!("encoder init failed: {}", e)))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(TARGET_BITRATE))
            .map_err(|e| AudioError::CodecInit(format!("set bitrate failed: {}", e)))?;

        Ok(Self {
            encoder,
            packet_buf: vec![0u8; MAX_PACKET_SIZE],
            frame_buf: vec![0i16; FRAME_SAMPLES],
        })
    }

    /// Encode one frame to an Opus packet.
    ///
    /// Short input is zero-padded to 960 samples; excess samples are
    /// truncated. Encoder errors yield an empty (silence) packet.
    pub fn encode(&mut self, samples: &[i16]) -> Vec<u8> {
        let take = samples.len().min(FRAME_SAMPLES);
        self.frame_buf[..take].copy_from_slice(&samples[..take]);
        self.frame_buf[take..].fill(0);

        match self.encoder.encode(&self.frame_buf, &mut self.packet_buf) {
            Ok(len) => self.packet_buf[..len].to_vec(),
            Err(e) => {
                warn!("Opus encode failed, emitting silence: {}", e);
                Vec::new()
            }
        }
    }
}

/// Voice decoder reconstructing 20 ms frames from Opus packets
pub struct VoiceDecoder {
    decoder: opus::Decoder,
    frame_buf: Vec<i16>,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self, AudioError> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| AudioError::CodecInit(format!("decoder init failed: {}", e)))?;

        Ok(Self {
            decoder,
            frame_buf: vec![0i16; FRAME_SAMPLES],
        })
    }

    /// Decode one packet to a 960-sample frame.
    ///
    /// An empty packet denotes silence and returns zeros without touching
    /// the decoder. Malformed packets log a warning and return silence.
    pub fn decode(&mut self, packet: &[u8]) -> Vec<i16> {
        if packet.is_empty() {
            return vec![0i16; FRAME_SAMPLES];
        }

        match self.decoder.decode(packet, &mut self.frame_buf, false) {
            Ok(decoded) => {
                let mut frame = self.frame_buf[..decoded].to_vec();
                frame.resize(FRAME_SAMPLES, 0);
                frame
            }
            Err(e) => {
                warn!("Opus decode failed, emitting silence: {}", e);
                vec![0i16; FRAME_SAMPLES]
            }
        }
    }

    /// Conceal one lost frame using the decoder's packet-loss concealment
    pub fn decode_plc(&mut self) -> Vec<i16> {
        match self.decoder.decode(&[], &mut self.frame_buf, false) {
            Ok(decoded) => {
                let mut frame = self.frame_buf[..decoded].to_vec();
                frame.resize(FRAME_SAMPLES, 0);
                frame
            }
            Err(e) => {
                warn!("Opus PLC failed, emitting silence: {}", e);
                vec![0i16; FRAME_SAMPLES]
            }
        }
    }
}

/// Convert i16 samples to little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Convert little-endian bytes to i16 samples.
///
/// A trailing odd byte is silently truncated.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Peak amplitude of a frame, normalised to [0, 1]
pub fn peak_level(samples: &[i16]) -> f32 {
    samples
        .iter()
        .map(|&s| (s as i32).unsigned_abs())
        .max()
        .unwrap_or(0) as f32
        / i16::MIN.unsigned_abs() as f32
}
