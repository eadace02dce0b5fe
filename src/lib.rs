//! proxchat - proximity voice chat client
//!
//! Peers broadcast their in-game coordinates and speak; anyone within
//! range on the same map and channel hears them, attenuated by distance
//! and panned by horizontal offset. A signalling server performs
//! introductions only; audio and position flow directly between peers.

pub mod app;
pub mod audio;
pub mod config;
pub mod input;
pub mod network;
pub mod position;

pub use audio::{AudioPipeline, CaptureEngine, FadeEngine};
pub use config::{Config, ConfigStore};
pub use network::{SessionManager, SignalingClient};
pub use position::PositionSource;
