//! Position subsystem
//!
//! Reads local game coordinates from the external provider over a named
//! IPC endpoint and validates freshness before anything else sees them.

mod error;
mod source;
mod wire;

pub use error::PositionError;
pub use source::{PositionEvent, PositionSource, ENDPOINT};
pub use wire::{
    parse_record, GameDataRecord, PositionSample, SampleValidator, HANDSHAKE_MAGIC,
    HEARTBEAT_BYTE, MAX_SAMPLE_AGE_MS, MSG_GAME_DATA, RECORD_SIZE,
};
