//! Network subsystem
//!
//! Signaling over WebSocket plus per-peer WebRTC sessions.

mod error;
mod rtc;
mod session;
mod signaling;

pub use error::NetworkError;
pub use rtc::{new_voice_track, RtcFactory, DEFAULT_STUN_SERVER, POSITION_CHANNEL_LABEL};
pub use session::{
    negotiation_role, MediaSink, PeerPosition, Role, SessionEvent, SessionManager, SessionState,
    NEGOTIATION_TIMEOUT,
};
pub use signaling::{
    new_client_id, server_url, ClientMessage, ServerMessage, SignalingClient, SignalingEvent,
    SignalingSender, SignalingStats, CONNECT_TIMEOUT,
};
