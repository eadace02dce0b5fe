//! Position source error types

use thiserror::Error;

/// Errors that can occur while reading game data from the local provider
#[derive(Error, Debug)]
pub enum PositionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: provider answered {0:02x?}")]
    HandshakeFailed([u8; 4]),

    #[error("Provider went silent")]
    ProviderSilent,

    #[error("Stream desynchronized on record type {0}")]
    Desynchronized(u32),
}
