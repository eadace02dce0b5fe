//! WebRTC plumbing shared by all peer sessions

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::error::NetworkError;

/// Label of the single reliable side channel carrying position updates
pub const POSITION_CHANNEL_LABEL: &str = "position";

/// Default STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Factory building per-peer connections with a shared API instance
pub struct RtcFactory {
    api: API,
    stun_server: String,
}

impl RtcFactory {
    pub fn new(stun_server: Option<String>) -> Result<Self, NetworkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NetworkError::TransportError(format!("codec registration: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NetworkError::TransportError(format!("interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            stun_server: stun_server.unwrap_or_else(|| DEFAULT_STUN_SERVER.to_string()),
        })
    }

    /// Create a fresh peer connection with the single configured STUN server
    pub async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>, NetworkError> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| NetworkError::TransportError(format!("peer connection: {}", e)))?;

        Ok(Arc::new(pc))
    }
}

/// The shared outbound voice track: Opus, 48 kHz, mono
pub fn new_voice_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: 1,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        "voice".to_string(),
        "proxchat".to_string(),
    ))
}
