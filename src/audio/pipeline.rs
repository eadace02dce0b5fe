//! Inbound audio pipeline: per-peer decode, gain, pan and playback
//!
//! `play` is safe to call concurrently for different peers: the peer map
//! is behind a read-write lock and each peer's decoder has its own mutex,
//! so decoding never funnels through a global lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::codec::{self, VoiceDecoder};
use super::fade::FadeEngine;
use super::playback::PeerSink;
use super::spatial;

/// Normalised peak above which a decoded frame counts as speech
pub const ACTIVITY_THRESHOLD: f32 = 0.001;

/// Transmission flag is cleared when no packet arrived for this long
pub const TRANSMISSION_TIMEOUT: Duration = Duration::from_millis(300);

/// Events emitted by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    TransmissionChanged { peer_id: String, transmitting: bool },
}

fn store_f32(cell: &AtomicU32, value: f32) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn load_f32(cell: &AtomicU32) -> f32 {
    f32::from_bits(cell.load(Ordering::Relaxed))
}

/// Constant-clamp pan law: `left = 1 - pan`, `right = 1 + pan`, both
/// clamped to [0, 1]
fn pan_gains(pan: f32) -> (f32, f32) {
    ((1.0 - pan).clamp(0.0, 1.0), (1.0 + pan).clamp(0.0, 1.0))
}

/// Expand a mono frame to interleaved stereo with gain and pan applied
fn expand_stereo(frame: &[i16], gain: f32, pan: f32, out: &mut Vec<i16>) {
    let (left, right) = pan_gains(pan);
    out.clear();
    out.reserve(frame.len() * 2);
    for &sample in frame {
        let s = sample as f32 * gain;
        out.push((s * left).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        out.push((s * right).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
}

struct PeerAudio {
    decoder: Mutex<VoiceDecoder>,
    sink: PeerSink,
    pan: AtomicU32,
    transmitting: AtomicBool,
    last_packet: Mutex<Instant>,
}

/// Mixing facade over all peer playback paths
pub struct AudioPipeline {
    peers: RwLock<HashMap<String, Arc<PeerAudio>>>,
    fader: Arc<FadeEngine>,
    master_out: AtomicU32,
    max_distance: AtomicU32,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl AudioPipeline {
    pub fn new(
        fader: Arc<FadeEngine>,
        master_out: f32,
        max_distance: f32,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        let pipeline = Self {
            peers: RwLock::new(HashMap::new()),
            fader,
            master_out: AtomicU32::new(0),
            max_distance: AtomicU32::new(0),
            events,
        };
        pipeline.set_master_out(master_out);
        pipeline.set_max_distance(max_distance);
        pipeline
    }

    pub fn set_master_out(&self, master: f32) {
        store_f32(&self.master_out, master.clamp(0.0, 1.0));
    }

    pub fn set_max_distance(&self, max_distance: f32) {
        store_f32(&self.max_distance, max_distance.max(0.0));
    }

    fn ensure_peer(&self, peer_id: &str) -> Option<Arc<PeerAudio>> {
        if let Some(peer) = self.peers.read().get(peer_id) {
            return Some(peer.clone());
        }

        let decoder = match VoiceDecoder::new() {
            Ok(d) => d,
            Err(e) => {
                warn!("No decoder for peer {}: {}", peer_id, e);
                return None;
            }
        };
        let sink = match PeerSink::open(peer_id) {
            Ok(s) => s,
            Err(e) => {
                warn!("No playback sink for peer {}: {}", peer_id, e);
                return None;
            }
        };

        let peer = Arc::new(PeerAudio {
            decoder: Mutex::new(decoder),
            sink,
            pan: AtomicU32::new(0f32.to_bits()),
            transmitting: AtomicBool::new(false),
            last_packet: Mutex::new(Instant::now()),
        });

        let mut peers = self.peers.write();
        Some(peers.entry(peer_id.to_string()).or_insert(peer).clone())
    }

    /// Decode one inbound packet for a peer and queue it for playback
    pub fn play(&self, peer_id: &str, packet: &[u8]) {
        let Some(peer) = self.ensure_peer(peer_id) else {
            return;
        };

        *peer.last_packet.lock() = Instant::now();

        let frame = peer.decoder.lock().decode(packet);
        let level = codec::peak_level(&frame);

        let transmitting = level > ACTIVITY_THRESHOLD;
        if peer.transmitting.load(Ordering::Relaxed) != transmitting {
            peer.transmitting.store(transmitting, Ordering::Relaxed);
            let _ = self.events.send(PipelineEvent::TransmissionChanged {
                peer_id: peer_id.to_string(),
                transmitting,
            });
        }

        let gain = self.fader.gain(peer_id);
        let pan = load_f32(&peer.pan);

        let mut stereo = Vec::new();
        expand_stereo(&frame, gain, pan, &mut stereo);
        peer.sink.push(&stereo);
    }

    /// Retarget a peer's gain and pan from fresh proximity data.
    ///
    /// `delta_x` is the peer's horizontal offset from the local position
    /// (zero when maps differ).
    pub fn update_peer(
        &self,
        peer_id: &str,
        distance: f32,
        delta_x: f32,
        ui_volume: f32,
        muted: bool,
    ) {
        let Some(peer) = self.ensure_peer(peer_id) else {
            return;
        };

        let max_distance = load_f32(&self.max_distance);
        let pan = spatial::pan(delta_x, distance, max_distance);
        store_f32(&peer.pan, pan);

        let target = spatial::final_gain(
            distance,
            max_distance,
            ui_volume,
            load_f32(&self.master_out),
            muted,
        );

        if muted {
            self.fader.set_immediate(peer_id, 0.0);
        } else {
            let current = self.fader.gain(peer_id);
            self.fader.set_target(peer_id, current, target);
        }
    }

    /// Drop a peer's decoder, sink and fade state
    pub fn remove_peer(&self, peer_id: &str) {
        if self.peers.write().remove(peer_id).is_some() {
            debug!("Removed audio path for peer {}", peer_id);
        }
        self.fader.remove(peer_id);
    }

    /// Clear transmission flags for peers that went silent.
    ///
    /// Call periodically; emits `TransmissionChanged` for every flag that
    /// flips.
    pub fn sweep_transmission(&self) {
        let peers = self.peers.read();
        for (peer_id, peer) in peers.iter() {
            if peer.transmitting.load(Ordering::Relaxed)
                && peer.last_packet.lock().elapsed() >= TRANSMISSION_TIMEOUT
            {
                peer.transmitting.store(false, Ordering::Relaxed);
                let _ = self.events.send(PipelineEvent::TransmissionChanged {
                    peer_id: peer_id.clone(),
                    transmitting: false,
                });
            }
        }
    }

    /// Current transmission flag for a peer
    pub fn is_transmitting(&self, peer_id: &str) -> bool {
        self.peers
            .read()
            .get(peer_id)
            .map(|p| p.transmitting.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Gain currently applied to a peer (via the fade engine)
    pub fn current_gain(&self, peer_id: &str) -> f32 {
        self.fader.gain(peer_id)
    }

    /// Current pan factor for a peer
    pub fn pan_of(&self, peer_id: &str) -> f32 {
        self.peers
            .read()
            .get(peer_id)
            .map(|p| load_f32(&p.pan))
            .unwrap_or(0.0)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}
