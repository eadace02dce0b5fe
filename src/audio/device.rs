//! Audio device enumeration and resolution

use cpal::traits::{DeviceTrait, HostTrait};

use super::error::AudioError;

/// Information about an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Display name (also used as the persistent identifier)
    pub name: String,
    /// Whether this is the default device
    pub is_default: bool,
}

/// List available input (capture) devices
pub fn list_input_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    host.input_devices()
        .map(|devices| {
            devices
                .filter_map(|device| {
                    let name = device.name().ok()?;
                    let is_default = default_name.as_ref() == Some(&name);
                    Some(AudioDevice { name, is_default })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve a capture device by name, falling back to the system default
pub fn resolve_input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(wanted))
            .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string())),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default input device".into())),
    }
}

/// Resolve the default playback device
pub fn resolve_output_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("no default output device".into()))
}
