//! Peer-session manager
//!
//! One session per peer identity, driven entirely by inbound events. The
//! negotiation role is settled by a deterministic total order on the two
//! identities so both ends agree without extra signalling: the smaller
//! identity creates the offer and the single `position` data channel.
//!
//! Inbound media is routed by the session that owns the receiving
//! transport, never by RTP SSRC.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::audio::FRAME_MILLIS;

use super::error::NetworkError;
use super::rtc::{RtcFactory, POSITION_CHANNEL_LABEL};

/// Upper bound for each negotiation phase (create/set description)
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Offering,
    Answering,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Negotiation role for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Resolve the negotiation role: the lexicographically smaller identity
/// initiates.
pub fn negotiation_role(local_id: &str, peer_id: &str) -> Role {
    if local_id < peer_id {
        Role::Initiator
    } else {
        Role::Responder
    }
}

/// Position payload carried over the `position` data channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerPosition {
    pub map_id: u16,
    pub x: i32,
    pub y: i32,
    pub character_name: String,
}

/// Events emitted by the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Local offer is ready for relay to the peer
    OfferReady { peer_id: String, sdp: String },
    /// Local answer is ready for relay to the peer
    AnswerReady { peer_id: String, sdp: String },
    /// Locally gathered ICE candidate for relay
    LocalCandidate { peer_id: String, candidate: String },
    DataChannelOpened { peer_id: String },
    PositionReceived { peer_id: String, position: PeerPosition },
    TransportConnected { peer_id: String },
    TransportFailed { peer_id: String },
    TransportClosed { peer_id: String },
}

/// Destination for decoded inbound media packets, keyed by peer
pub type MediaSink = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Session {
    role: Role,
    state: SessionState,
    pc: Arc<RTCPeerConnection>,
    data_channel: Option<Arc<RTCDataChannel>>,
    /// Remote candidates received before the remote description
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_description_set: bool,
}

type SessionMap = Arc<Mutex<HashMap<String, Session>>>;

/// Owns all peer sessions and mediates negotiation.
///
/// The map mutex guards only map reads and writes. Negotiation RPCs run
/// with the lock released, so transport callbacks for other peers are
/// never held up by one peer's handshake.
pub struct SessionManager {
    sessions: SessionMap,
    factory: RtcFactory,
    local_track: Arc<TrackLocalStaticSample>,
    events: mpsc::UnboundedSender<SessionEvent>,
    media_sink: MediaSink,
}

async fn set_state(sessions: &SessionMap, peer_id: &str, state: SessionState) {
    if let Some(session) = sessions.lock().await.get_mut(peer_id) {
        debug!("Session {} -> {:?}", peer_id, state);
        session.state = state;
    }
}

impl SessionManager {
    pub fn new(
        factory: RtcFactory,
        local_track: Arc<TrackLocalStaticSample>,
        events: mpsc::UnboundedSender<SessionEvent>,
        media_sink: MediaSink,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            factory,
            local_track,
            events,
            media_sink,
        }
    }

    /// Create a session for a peer if none exists.
    ///
    /// Idempotent: an existing (non-Closed) session is left untouched and
    /// `Ok(false)` is returned. The entry is inserted in `New` state before
    /// any negotiation so inbound candidates buffer against it; for the
    /// Initiator role the offer is then driven with the lock released.
    pub async fn ensure_session(&self, peer_id: &str, role: Role) -> Result<bool, NetworkError> {
        if self.sessions.lock().await.contains_key(peer_id) {
            return Ok(false);
        }

        let pc = self.factory.new_connection().await?;

        // Reserve the entry; a concurrent ensure may have won the race.
        // The loser's transport has no handlers yet, so closing it emits
        // nothing against the surviving session.
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(peer_id) {
                drop(sessions);
                let _ = pc.close().await;
                return Ok(false);
            }
            sessions.insert(
                peer_id.to_string(),
                Session {
                    role,
                    state: SessionState::New,
                    pc: pc.clone(),
                    data_channel: None,
                    pending_candidates: Vec::new(),
                    remote_description_set: false,
                },
            );
        }

        if let Err(e) = self.wire_connection(peer_id, &pc).await {
            self.close(peer_id).await;
            return Err(e);
        }

        info!("Session created for peer {} as {:?}", peer_id, role);
        if role == Role::Initiator {
            if let Err(e) = self.start_offer(peer_id, &pc).await {
                self.close(peer_id).await;
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Initiator negotiation: data channel, offer, local description.
    /// Runs without the map lock; the result is written back under a
    /// short lock afterwards.
    async fn start_offer(
        &self,
        peer_id: &str,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<(), NetworkError> {
        let dc = pc
            .create_data_channel(POSITION_CHANNEL_LABEL, None)
            .await
            .map_err(|e| NetworkError::TransportError(format!("data channel: {}", e)))?;
        self.wire_data_channel(peer_id, dc.clone());

        let offer = tokio::time::timeout(NEGOTIATION_TIMEOUT, pc.create_offer(None))
            .await
            .map_err(|_| NetworkError::NegotiationTimeout("create-offer"))?
            .map_err(|e| NetworkError::TransportError(format!("create offer: {}", e)))?;

        tokio::time::timeout(NEGOTIATION_TIMEOUT, pc.set_local_description(offer.clone()))
            .await
            .map_err(|_| NetworkError::NegotiationTimeout("set-local-description"))?
            .map_err(|e| NetworkError::TransportError(format!("local description: {}", e)))?;

        let sdp = serde_json::to_string(&offer)
            .map_err(|e| NetworkError::InvalidDescription(format!("offer serialization: {}", e)))?;

        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(peer_id) else {
                // closed while negotiating; nothing left to offer
                return Ok(());
            };
            session.data_channel = Some(dc);
            session.state = SessionState::Offering;
        }

        let _ = self.events.send(SessionEvent::OfferReady {
            peer_id: peer_id.to_string(),
            sdp,
        });
        Ok(())
    }

    /// Responder path: apply a relayed offer and produce an answer
    pub async fn apply_remote_offer(&self, peer_id: &str, sdp: &str) -> Result<(), NetworkError> {
        if !self.sessions.lock().await.contains_key(peer_id) {
            // Offers can outrun the roster update that introduces the peer
            self.ensure_session(peer_id, Role::Responder).await?;
        }

        let offer: RTCSessionDescription = serde_json::from_str(sdp)
            .map_err(|e| NetworkError::InvalidDescription(format!("offer parse: {}", e)))?;

        // Short lock: validate the role and flip to Answering; the
        // negotiation itself runs unlocked on the cloned transport handle
        let pc = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(peer_id)
                .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?;

            if session.role != Role::Responder {
                warn!("Ignoring offer from {}: local side is the initiator", peer_id);
                return Ok(());
            }
            session.state = SessionState::Answering;
            session.pc.clone()
        };

        tokio::time::timeout(NEGOTIATION_TIMEOUT, pc.set_remote_description(offer))
            .await
            .map_err(|_| NetworkError::NegotiationTimeout("set-remote-description"))?
            .map_err(|e| NetworkError::TransportError(format!("remote description: {}", e)))?;

        let buffered = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(peer_id) else {
                // closed while negotiating
                return Ok(());
            };
            session.remote_description_set = true;
            std::mem::take(&mut session.pending_candidates)
        };
        for candidate in buffered {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Buffered candidate rejected for {}: {}", peer_id, e);
            }
        }

        let answer = tokio::time::timeout(NEGOTIATION_TIMEOUT, pc.create_answer(None))
            .await
            .map_err(|_| NetworkError::NegotiationTimeout("create-answer"))?
            .map_err(|e| NetworkError::TransportError(format!("create answer: {}", e)))?;

        tokio::time::timeout(NEGOTIATION_TIMEOUT, pc.set_local_description(answer.clone()))
            .await
            .map_err(|_| NetworkError::NegotiationTimeout("set-local-description"))?
            .map_err(|e| NetworkError::TransportError(format!("local description: {}", e)))?;

        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(peer_id) else {
                return Ok(());
            };
            session.state = SessionState::Connecting;
        }

        let sdp = serde_json::to_string(&answer)
            .map_err(|e| NetworkError::InvalidDescription(format!("answer serialization: {}", e)))?;
        let _ = self.events.send(SessionEvent::AnswerReady {
            peer_id: peer_id.to_string(),
            sdp,
        });
        Ok(())
    }

    /// Initiator path: apply the relayed answer
    pub async fn apply_remote_answer(&self, peer_id: &str, sdp: &str) -> Result<(), NetworkError> {
        let answer: RTCSessionDescription = serde_json::from_str(sdp)
            .map_err(|e| NetworkError::InvalidDescription(format!("answer parse: {}", e)))?;

        let pc = {
            let sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(peer_id) else {
                debug!("Answer for unknown peer {} dropped", peer_id);
                return Ok(());
            };
            if session.role != Role::Initiator {
                warn!("Ignoring answer from {}: local side is the responder", peer_id);
                return Ok(());
            }
            session.pc.clone()
        };

        tokio::time::timeout(NEGOTIATION_TIMEOUT, pc.set_remote_description(answer))
            .await
            .map_err(|_| NetworkError::NegotiationTimeout("set-remote-description"))?
            .map_err(|e| NetworkError::TransportError(format!("remote description: {}", e)))?;

        let buffered = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(peer_id) else {
                // closed while negotiating
                return Ok(());
            };
            session.remote_description_set = true;
            session.state = SessionState::Connecting;
            std::mem::take(&mut session.pending_candidates)
        };

        for candidate in buffered {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Buffered candidate rejected for {}: {}", peer_id, e);
            }
        }
        Ok(())
    }

    /// Add a relayed ICE candidate.
    ///
    /// Candidates arriving before the remote description are buffered;
    /// candidates for closed (removed) sessions are dropped silently.
    pub async fn add_remote_ice(&self, peer_id: &str, candidate: &str) -> Result<(), NetworkError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| NetworkError::InvalidCandidate(format!("candidate parse: {}", e)))?;

        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(peer_id) else {
            debug!("Candidate for closed session {} dropped", peer_id);
            return Ok(());
        };

        if !session.remote_description_set {
            session.pending_candidates.push(init);
            return Ok(());
        }

        let pc = session.pc.clone();
        drop(sessions);
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| NetworkError::InvalidCandidate(format!("add candidate: {}", e)))?;
        Ok(())
    }

    /// Send a position update to one peer; a no-op unless the peer's data
    /// channel is open. Returns whether a send happened.
    pub async fn send_position(&self, peer_id: &str, pos: &PeerPosition) -> bool {
        let dc = {
            let sessions = self.sessions.lock().await;
            sessions.get(peer_id).and_then(|s| {
                s.data_channel
                    .as_ref()
                    .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
                    .cloned()
            })
        };

        let Some(dc) = dc else { return false };
        let Ok(json) = serde_json::to_string(pos) else {
            return false;
        };
        match dc.send(&Bytes::from(json)).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Position send to {} failed: {}", peer_id, e);
                false
            }
        }
    }

    /// Send a position update to every peer with an open channel
    pub async fn broadcast_position(&self, pos: &PeerPosition) {
        let channels: Vec<(String, Arc<RTCDataChannel>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter_map(|(id, s)| {
                    s.data_channel
                        .as_ref()
                        .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
                        .map(|dc| (id.clone(), dc.clone()))
                })
                .collect()
        };

        let Ok(json) = serde_json::to_string(pos) else {
            return;
        };
        let payload = Bytes::from(json);
        for (peer_id, dc) in channels {
            if let Err(e) = dc.send(&payload).await {
                warn!("Position broadcast to {} failed: {}", peer_id, e);
            }
        }
    }

    /// Write one 20 ms Opus packet onto the shared outbound track.
    ///
    /// Empty packets are silence and are not written; the far side sees
    /// silence as packet absence.
    pub async fn write_media(&self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }
        let sample = Sample {
            data: Bytes::copy_from_slice(packet),
            duration: Duration::from_millis(FRAME_MILLIS),
            ..Default::default()
        };
        if let Err(e) = self.local_track.write_sample(&sample).await {
            debug!("Outbound media write failed: {}", e);
        }
    }

    /// Close a session and release its transport
    pub async fn close(&self, peer_id: &str) {
        let session = self.sessions.lock().await.remove(peer_id);
        if let Some(mut session) = session {
            session.state = SessionState::Closed;
            if let Err(e) = session.pc.close().await {
                warn!("Error closing session {}: {}", peer_id, e);
            }
            info!("Session closed for peer {}", peer_id);
        }
    }

    /// Close every session
    pub async fn close_all(&self) {
        let peer_ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for peer_id in peer_ids {
            self.close(&peer_id).await;
        }
    }

    /// Current state of a peer's session
    pub async fn session_state(&self, peer_id: &str) -> Option<SessionState> {
        self.sessions.lock().await.get(peer_id).map(|s| s.state)
    }

    /// Candidates buffered while awaiting the remote description
    pub async fn buffered_candidates(&self, peer_id: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(peer_id)
            .map(|s| s.pending_candidates.len())
            .unwrap_or(0)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Snapshot of all sessions for the debug panel
    pub async fn snapshot(&self) -> Vec<(String, Role, SessionState)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.role, s.state))
            .collect()
    }

    /// Attach the outbound track and wire transport-level handlers
    async fn wire_connection(
        &self,
        peer_id: &str,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<(), NetworkError> {
        let rtp_sender = pc
            .add_track(Arc::clone(&self.local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NetworkError::TransportError(format!("add track: {}", e)))?;

        // Drain RTCP so the interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let sessions = self.sessions.clone();
        let events = self.events.clone();
        let pid = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sessions = sessions.clone();
            let events = events.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                debug!("Transport for {} is {}", peer_id, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        set_state(&sessions, &peer_id, SessionState::Connected).await;
                        let _ = events.send(SessionEvent::TransportConnected { peer_id });
                    }
                    RTCPeerConnectionState::Failed => {
                        set_state(&sessions, &peer_id, SessionState::Failed).await;
                        let _ = events.send(SessionEvent::TransportFailed { peer_id });
                    }
                    RTCPeerConnectionState::Closed => {
                        let _ = events.send(SessionEvent::TransportClosed { peer_id });
                    }
                    _ => {}
                }
            })
        }));

        let events = self.events.clone();
        let pid = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let json = match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Candidate serialization failed: {}", e);
                            return;
                        }
                    },
                    Err(e) => {
                        warn!("Candidate conversion failed: {}", e);
                        return;
                    }
                };
                let _ = events.send(SessionEvent::LocalCandidate {
                    peer_id,
                    candidate: json,
                });
            })
        }));

        // Inbound media: one reader per remote track, routed by the session
        // that owns this transport
        let media_sink = self.media_sink.clone();
        let pid = peer_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let media_sink = media_sink.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                info!("Inbound audio track from {}", peer_id);
                tokio::spawn(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _)) => {
                                if !packet.payload.is_empty() {
                                    media_sink(&peer_id, &packet.payload);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    debug!("Inbound track from {} ended", peer_id);
                });
            })
        }));

        // Responder side: adopt the channel announced in the offer
        let sessions = self.sessions.clone();
        let events = self.events.clone();
        let pid = peer_id.to_string();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sessions = sessions.clone();
            let events = events.clone();
            let peer_id = pid.clone();
            Box::pin(async move {
                if dc.label() != POSITION_CHANNEL_LABEL {
                    warn!("Unexpected data channel '{}' from {}", dc.label(), peer_id);
                    return;
                }
                wire_channel_handlers(&events, &peer_id, dc.clone());
                if let Some(session) = sessions.lock().await.get_mut(&peer_id) {
                    session.data_channel = Some(dc);
                }
            })
        }));

        Ok(())
    }

    fn wire_data_channel(&self, peer_id: &str, dc: Arc<RTCDataChannel>) {
        wire_channel_handlers(&self.events, peer_id, dc);
    }
}

/// Wire open/message handlers on the position channel
fn wire_channel_handlers(
    events: &mpsc::UnboundedSender<SessionEvent>,
    peer_id: &str,
    dc: Arc<RTCDataChannel>,
) {
    let open_events = events.clone();
    let open_pid = peer_id.to_string();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(SessionEvent::DataChannelOpened {
            peer_id: open_pid.clone(),
        });
        Box::pin(async {})
    }));

    let msg_events = events.clone();
    let msg_pid = peer_id.to_string();
    dc.on_message(Box::new(move |msg| {
        let events = msg_events.clone();
        let peer_id = msg_pid.clone();
        Box::pin(async move {
            match serde_json::from_slice::<PeerPosition>(&msg.data) {
                Ok(position) => {
                    let _ = events.send(SessionEvent::PositionReceived { peer_id, position });
                }
                Err(e) => {
                    warn!("Malformed position from {}: {}", peer_id, e);
                }
            }
        })
    }));
}
