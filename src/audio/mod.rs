//! Audio subsystem
//!
//! Capture, Opus coding, per-peer playback and the spatial mixing facade.

mod capture;
mod codec;
mod device;
mod error;
mod fade;
mod pipeline;
mod playback;
pub mod spatial;

pub use capture::{CaptureControls, CaptureEngine, CaptureEvent};
pub use codec::{
    bytes_to_samples, peak_level, samples_to_bytes, VoiceDecoder, VoiceEncoder, FRAME_MILLIS,
    FRAME_SAMPLES, MAX_PACKET_SIZE, SAMPLE_RATE,
};
pub use device::{list_input_devices, AudioDevice};
pub use error::AudioError;
pub use fade::{FadeEngine, FADE_DURATION, SNAP_EPSILON};
pub use pipeline::{AudioPipeline, PipelineEvent, ACTIVITY_THRESHOLD, TRANSMISSION_TIMEOUT};
pub use playback::PeerSink;
