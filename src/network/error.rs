//! Network error types

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Negotiation timed out: {0}")]
    NegotiationTimeout(&'static str),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),
}
