//! Signaling client for peer introductions
//!
//! One WebSocket carries tagged JSON text frames. The server only performs
//! introductions: roster updates and SDP/ICE relay. Sends are serialized
//! through a single writer task; the read loop emits typed events. There is
//! no automatic reconnect, but reconnecting regenerates the client
//! identity.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::NetworkError;

/// Upper bound on establishing the WebSocket connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages sent to the signaling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    UpdatePosition {
        client_id: String,
        map_id: u16,
        x: i32,
        y: i32,
        channel: i32,
    },
    SendOffer {
        target_id: String,
        offer: String,
    },
    SendAnswer {
        target_id: String,
        answer: String,
    },
    SendIceCandidate {
        target_id: String,
        candidate: String,
    },
    RequestPeerRefresh,
    Disconnect,
}

/// Messages received from the signaling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    NearbyPeers(Vec<String>),
    ReceiveOffer { sender_id: String, offer: String },
    ReceiveAnswer { sender_id: String, answer: String },
    ReceiveIceCandidate { sender_id: String, candidate: String },
    Error(String),
}

/// Typed events surfaced to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    NearbyPeers(Vec<String>),
    Offer { sender_id: String, offer: String },
    Answer { sender_id: String, answer: String },
    IceCandidate { sender_id: String, candidate: String },
    ServerError(String),
    Disconnected,
}

/// Generate a fresh client identity.
///
/// Identities are opaque and per-session; regenerating one on reconnect is
/// the anonymity mechanism, so nothing durable may be keyed by it.
pub fn new_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build the server URL; port 443 selects TLS with an implicit port
pub fn server_url(host: &str, port: u16) -> String {
    if port == 443 {
        format!("wss://{}", host)
    } else {
        format!("ws://{}:{}", host, port)
    }
}

/// Handle for sending messages over the signaling connection
#[derive(Clone)]
pub struct SignalingSender {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    connected: Arc<AtomicBool>,
}

impl SignalingSender {
    /// Queue a message on the serialized send lane
    pub fn send(&self, msg: ClientMessage) -> Result<(), NetworkError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(NetworkError::NotConnected);
        }
        self.outbound
            .send(msg)
            .map_err(|_| NetworkError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Traffic counters for the signaling connection
#[derive(Debug, Clone, Default)]
pub struct SignalingStats {
    /// Messages successfully written to the socket
    pub messages_sent: u64,
    /// Well-formed messages received
    pub messages_received: u64,
    /// Inbound frames dropped as malformed
    pub malformed_frames: u64,
}

/// An active signaling connection
pub struct SignalingClient {
    sender: SignalingSender,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
}

impl SignalingClient {
    /// Connect to the signaling server, bounded at 10 s.
    ///
    /// Spawns the read loop and the serialized writer task. Inbound frames
    /// become `SignalingEvent`s; a drop of the connection emits
    /// `Disconnected` exactly once.
    pub async fn connect(
        host: &str,
        port: u16,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<Self, NetworkError> {
        let url = server_url(host, port);

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| NetworkError::ConnectionTimeout)?
            .map_err(|e| NetworkError::SignalingError(format!("connect failed: {}", e)))?;

        info!("Connected to signaling server {}", url);

        let (mut write, mut read) = ws_stream.split();
        let connected = Arc::new(AtomicBool::new(true));
        let sent = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));
        let malformed = Arc::new(AtomicU64::new(0));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Serialized send lane: per-connection order is preserved
        let writer_connected = connected.clone();
        let writer_sent = sent.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("Failed to serialize signaling message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Signaling send failed: {}", e);
                    writer_connected.store(false, Ordering::Relaxed);
                    break;
                }
                writer_sent.fetch_add(1, Ordering::Relaxed);
            }
            let _ = write.close().await;
        });

        // Read loop
        let reader_connected = connected.clone();
        let reader_received = received.clone();
        let reader_malformed = malformed.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                reader_received.fetch_add(1, Ordering::Relaxed);
                                let event = match msg {
                                    ServerMessage::NearbyPeers(ids) => {
                                        SignalingEvent::NearbyPeers(ids)
                                    }
                                    ServerMessage::ReceiveOffer { sender_id, offer } => {
                                        SignalingEvent::Offer { sender_id, offer }
                                    }
                                    ServerMessage::ReceiveAnswer { sender_id, answer } => {
                                        SignalingEvent::Answer { sender_id, answer }
                                    }
                                    ServerMessage::ReceiveIceCandidate {
                                        sender_id,
                                        candidate,
                                    } => SignalingEvent::IceCandidate { sender_id, candidate },
                                    ServerMessage::Error(message) => {
                                        SignalingEvent::ServerError(message)
                                    }
                                };
                                if events.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                reader_malformed.fetch_add(1, Ordering::Relaxed);
                                warn!("Dropping malformed signaling message: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Signaling server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling read error: {}", e);
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::Relaxed);
            let _ = events.send(SignalingEvent::Disconnected);
        });

        Ok(Self {
            sender: SignalingSender {
                outbound: outbound_tx,
                connected,
            },
            sent,
            received,
            malformed,
        })
    }

    /// Cloneable send handle
    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), NetworkError> {
        self.sender.send(msg)
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    /// Count of inbound frames dropped as malformed
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Traffic counters snapshot
    pub fn stats(&self) -> SignalingStats {
        SignalingStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            malformed_frames: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// Announce departure; the connection itself closes when dropped
    pub fn disconnect(&self) {
        let _ = self.sender.send(ClientMessage::Disconnect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url_scheme_selection() {
        assert_eq!(server_url("voice.example.com", 443), "wss://voice.example.com");
        assert_eq!(server_url("voice.example.com", 8080), "ws://voice.example.com:8080");
        assert_eq!(server_url("127.0.0.1", 80), "ws://127.0.0.1:80");
    }

    #[test]
    fn test_new_client_id_is_unique() {
        let a = new_client_id();
        let b = new_client_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_update_position_wire_shape() {
        let msg = ClientMessage::UpdatePosition {
            client_id: "abc".to_string(),
            map_id: 3,
            x: 10,
            y: -20,
            channel: 7,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"UpdatePosition","data":{"client_id":"abc","map_id":3,"x":10,"y":-20,"channel":7}}"#
        );
    }

    #[test]
    fn test_send_offer_wire_shape() {
        let msg = ClientMessage::SendOffer {
            target_id: "B".to_string(),
            offer: "{sdp}".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"SendOffer","data":{"target_id":"B","offer":"{sdp}"}}"#
        );
    }

    #[test]
    fn test_unit_variants_have_no_data() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::RequestPeerRefresh).unwrap(),
            r#"{"type":"RequestPeerRefresh"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::Disconnect).unwrap(),
            r#"{"type":"Disconnect"}"#
        );
    }

    #[test]
    fn test_nearby_peers_parses_id_array() {
        let json = r#"{"type":"NearbyPeers","data":["peer-a","peer-b"]}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::NearbyPeers(vec!["peer-a".to_string(), "peer-b".to_string()])
        );
    }

    #[test]
    fn test_receive_offer_parses_nested_data() {
        let json = r#"{"type":"ReceiveOffer","data":{"sender_id":"B","offer":"{\"type\":\"offer\"}"}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::ReceiveOffer { sender_id, offer } => {
                assert_eq!(sender_id, "B");
                assert!(offer.contains("offer"));
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_server_error_parses_plain_string() {
        let json = r#"{"type":"Error","data":"channel full"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, ServerMessage::Error("channel full".to_string()));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"type":"Telemetry","data":{}}"#;
        assert!(serde_json::from_str::<ServerMessage>(json).is_err());
    }
}
