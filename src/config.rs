//! Configuration persistence
//!
//! The settings document lives in `config.json` next to the executable.
//! The schema is closed: every recognised field has a default, numeric
//! fields are clamped on load and unknown keys are preserved verbatim when
//! the document is rewritten. Every mutation rewrites the whole document
//! atomically (write to a temp file, then rename).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::input::Hotkey;

/// Config file name
pub const CONFIG_FILE: &str = "config.json";

/// Fatal-error log name, written beside the config file
pub const FATAL_LOG_FILE: &str = "fatal.log";

/// Peer volume changes smaller than this are not persisted
pub const PEER_VOLUME_EPSILON: f32 = 0.001;

/// Errors raised by the config store
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Signaling endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketServerConfig {
    #[serde(rename = "Host", default = "default_host")]
    pub host: String,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for WebSocketServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Audio-related settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioSettings {
    /// Master output scale (0..1)
    #[serde(rename = "VolumeScale", default = "default_volume_scale")]
    pub volume_scale: f32,

    /// Microphone gain (0..5)
    #[serde(rename = "InputVolumeScale", default = "default_input_volume_scale")]
    pub input_volume_scale: f32,

    /// Peak level below which nothing is broadcast (0..1)
    #[serde(rename = "MinBroadcastThreshold", default = "default_broadcast_threshold")]
    pub min_broadcast_threshold: f32,

    /// Capture device name; `null` selects the system default
    #[serde(rename = "SelectedInputDevice", default)]
    pub selected_input_device: Option<String>,

    /// Push-to-talk instead of voice activation
    #[serde(rename = "IsPushToTalk", default)]
    pub is_push_to_talk: bool,

    #[serde(rename = "PushToTalkKey", default)]
    pub push_to_talk_key: Option<Hotkey>,

    #[serde(rename = "MuteSelfKey", default)]
    pub mute_self_key: Option<Hotkey>,
}

fn default_volume_scale() -> f32 {
    0.5
}

fn default_input_volume_scale() -> f32 {
    1.0
}

fn default_broadcast_threshold() -> f32 {
    0.02
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            volume_scale: default_volume_scale(),
            input_volume_scale: default_input_volume_scale(),
            min_broadcast_threshold: default_broadcast_threshold(),
            selected_input_device: None,
            is_push_to_talk: false,
            push_to_talk_key: None,
            mute_self_key: None,
        }
    }
}

/// Persistent per-peer state, keyed by character name so it survives
/// identity rotation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSettings {
    #[serde(rename = "Volume", default = "default_peer_volume")]
    pub volume: f32,
    #[serde(rename = "IsMuted", default)]
    pub is_muted: bool,
}

fn default_peer_volume() -> f32 {
    1.0
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            volume: default_peer_volume(),
            is_muted: false,
        }
    }
}

/// The whole settings document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(rename = "WebSocketServer", default)]
    pub web_socket_server: WebSocketServerConfig,

    /// Proximity channel filter
    #[serde(rename = "Channel", default)]
    pub channel: i32,

    /// Distance at which audio is fully attenuated
    #[serde(rename = "MaxDistance", alias = "ProximityRange", default = "default_max_distance")]
    pub max_distance: f32,

    #[serde(rename = "AudioSettings", default)]
    pub audio_settings: AudioSettings,

    #[serde(rename = "PeerSettings", default)]
    pub peer_settings: BTreeMap<String, PeerSettings>,

    /// Unknown fields, preserved verbatim on rewrite
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_max_distance() -> f32 {
    100.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_socket_server: WebSocketServerConfig::default(),
            channel: 0,
            max_distance: default_max_distance(),
            audio_settings: AudioSettings::default(),
            peer_settings: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Config {
    /// Clamp numeric fields into their documented ranges
    pub fn clamped(mut self) -> Self {
        self.max_distance = self.max_distance.max(0.0);
        self.audio_settings.volume_scale = self.audio_settings.volume_scale.clamp(0.0, 1.0);
        self.audio_settings.input_volume_scale =
            self.audio_settings.input_volume_scale.clamp(0.0, 5.0);
        self.audio_settings.min_broadcast_threshold =
            self.audio_settings.min_broadcast_threshold.clamp(0.0, 1.0);
        for peer in self.peer_settings.values_mut() {
            peer.volume = peer.volume.clamp(0.0, 1.0);
        }
        self
    }
}

/// Directory holding `config.json` and `fatal.log`: the executable's
/// directory, falling back to the working directory
pub fn config_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Thread-safe store over the settings document
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<Config>,
}

impl ConfigStore {
    /// Load `config.json` from `dir`, writing a defaults document when the
    /// file is absent or malformed. Load failures never abort startup.
    pub fn load_or_default(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);

        let config = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => config.clamped(),
                Err(e) => {
                    warn!("Malformed config at {:?} ({}), using defaults", path, e);
                    Config::default()
                }
            },
            Err(_) => {
                info!("No config at {:?}, writing defaults", path);
                Config::default()
            }
        };

        let store = Self {
            path,
            inner: Mutex::new(config.clone()),
        };

        // Persist defaults (or the normalized document); failure to write
        // is logged and the in-memory document is used as-is
        if let Err(e) = store.persist(&config) {
            warn!("Could not persist config: {}", e);
        }
        store
    }

    /// Current document
    pub fn get(&self) -> Config {
        self.inner.lock().clone()
    }

    /// Mutate the document and persist it atomically
    pub fn update<F: FnOnce(&mut Config)>(&self, mutate: F) -> Result<(), ConfigError> {
        let snapshot = {
            let mut config = self.inner.lock();
            mutate(&mut config);
            *config = config.clone().clamped();
            config.clone()
        };
        self.persist(&snapshot)
    }

    /// Stored settings for a character, defaulting to full volume, unmuted
    pub fn peer_settings(&self, character_name: &str) -> PeerSettings {
        self.inner
            .lock()
            .peer_settings
            .get(character_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Store per-peer state, persisting only when the volume moved by at
    /// least the epsilon or the mute flag changed. Returns whether a write
    /// happened.
    pub fn update_peer(
        &self,
        character_name: &str,
        volume: f32,
        muted: bool,
    ) -> Result<bool, ConfigError> {
        let snapshot = {
            let mut config = self.inner.lock();
            let current = config
                .peer_settings
                .get(character_name)
                .cloned()
                .unwrap_or_default();

            if (current.volume - volume).abs() < PEER_VOLUME_EPSILON && current.is_muted == muted {
                return Ok(false);
            }

            config.peer_settings.insert(
                character_name.to_string(),
                PeerSettings {
                    volume: volume.clamp(0.0, 1.0),
                    is_muted: muted,
                },
            );
            config.clone()
        };
        self.persist(&snapshot)?;
        Ok(true)
    }

    /// Whole-document atomic write: temp file in the same directory, then
    /// rename over the target
    fn persist(&self, config: &Config) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append a fatal error to `fatal.log` in `dir`
pub fn log_fatal(dir: &Path, message: &str) {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    let line = format!("[{}] {}\n", timestamp, message);
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(FATAL_LOG_FILE))
        .and_then(|mut f| f.write_all(line.as_bytes()));

    if let Err(e) = result {
        eprintln!("Could not write fatal log: {}", e);
    }
}

/// Install a process-wide panic hook: append to `fatal.log`, print the
/// panic, exit non-zero. No thread gets to limp on after a panic.
pub fn install_panic_hook(dir: PathBuf) {
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());

        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let message = format!("panic at {}: {}", location, payload);
        log_fatal(&dir, &message);
        eprintln!("fatal: {}", message);
        std::process::exit(70);
    }));
}
