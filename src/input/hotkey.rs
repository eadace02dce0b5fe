//! Process-wide hotkey watcher
//!
//! Push-to-talk and mute-self work regardless of window focus, so they are
//! registered with the OS through a global hotkey manager living on its own
//! thread. Auto-repeat is debounced: holding a key yields one pressed edge
//! and one released edge. Swapping bindings is atomic between key events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors raised while installing hotkeys
#[derive(Error, Debug)]
pub enum HotkeyError {
    #[error("Unknown key: {0}")]
    UnknownKey(String),
}

/// A key plus its exact modifier set.
///
/// Equality is exact-match including modifiers: `Ctrl+F12` does not match
/// a bare `F12`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Hotkey {
    #[serde(rename = "Key", default)]
    pub key: String,
    #[serde(rename = "Ctrl", default)]
    pub ctrl: bool,
    #[serde(rename = "Shift", default)]
    pub shift: bool,
    #[serde(rename = "Alt", default)]
    pub alt: bool,
    #[serde(rename = "Meta", default)]
    pub meta: bool,
}

impl Hotkey {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }

    /// Translate into an OS registration. Key names follow the W3C
    /// `KeyboardEvent.code` convention (`F12`, `KeyV`, `Numpad0`, ...).
    fn to_registration(&self) -> Result<HotKey, HotkeyError> {
        let code: Code = self
            .key
            .parse()
            .map_err(|_| HotkeyError::UnknownKey(self.key.clone()))?;

        let mut mods = Modifiers::empty();
        if self.ctrl {
            mods |= Modifiers::CONTROL;
        }
        if self.shift {
            mods |= Modifiers::SHIFT;
        }
        if self.alt {
            mods |= Modifiers::ALT;
        }
        if self.meta {
            mods |= Modifiers::META;
        }

        let mods = if mods.is_empty() { None } else { Some(mods) };
        Ok(HotKey::new(mods, code))
    }
}

/// Events delivered to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    PushToTalkPressed,
    PushToTalkReleased,
    MuteToggleRequested,
}

/// The two watchable bindings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HotkeyBindings {
    pub push_to_talk: Option<Hotkey>,
    pub mute_self: Option<Hotkey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BindingKind {
    PushToTalk,
    MuteSelf,
}

/// Edge detector: collapses auto-repeat into single press/release edges
#[derive(Default)]
struct EdgeState {
    ptt_down: bool,
    mute_down: bool,
}

impl EdgeState {
    fn on_event(&mut self, kind: BindingKind, state: HotKeyState) -> Option<HotkeyEvent> {
        match (kind, state) {
            (BindingKind::PushToTalk, HotKeyState::Pressed) => {
                if self.ptt_down {
                    None
                } else {
                    self.ptt_down = true;
                    Some(HotkeyEvent::PushToTalkPressed)
                }
            }
            (BindingKind::PushToTalk, HotKeyState::Released) => {
                if self.ptt_down {
                    self.ptt_down = false;
                    Some(HotkeyEvent::PushToTalkReleased)
                } else {
                    None
                }
            }
            (BindingKind::MuteSelf, HotKeyState::Pressed) => {
                // fires on key-down only, once per physical press
                if self.mute_down {
                    None
                } else {
                    self.mute_down = true;
                    Some(HotkeyEvent::MuteToggleRequested)
                }
            }
            (BindingKind::MuteSelf, HotKeyState::Released) => {
                self.mute_down = false;
                None
            }
        }
    }
}

/// Watches the configured hotkeys on a dedicated thread
pub struct HotkeyWatcher {
    running: Arc<AtomicBool>,
    pending: Arc<Mutex<Option<HotkeyBindings>>>,
    thread: Option<JoinHandle<()>>,
}

impl HotkeyWatcher {
    /// Start the watcher with the initial bindings
    pub fn start(
        bindings: HotkeyBindings,
        events: mpsc::UnboundedSender<HotkeyEvent>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(Mutex::new(Some(bindings)));

        let thread_running = running.clone();
        let thread_pending = pending.clone();
        let thread = thread::Builder::new()
            .name("hotkeys".into())
            .spawn(move || watcher_loop(thread_pending, events, thread_running))
            .ok();

        if thread.is_none() {
            warn!("Hotkey watcher thread failed to start");
        }

        Self {
            running,
            pending,
            thread,
        }
    }

    /// Swap the watched bindings; applied atomically between key events
    pub fn update(&self, bindings: HotkeyBindings) {
        *self.pending.lock() = Some(bindings);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HotkeyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watcher_loop(
    pending: Arc<Mutex<Option<HotkeyBindings>>>,
    events: mpsc::UnboundedSender<HotkeyEvent>,
    running: Arc<AtomicBool>,
) {
    // The manager must live on the thread that services it
    let manager = match GlobalHotKeyManager::new() {
        Ok(m) => m,
        Err(e) => {
            warn!("Global hotkeys unavailable: {}", e);
            return;
        }
    };

    let mut registered: Vec<HotKey> = Vec::new();
    let mut by_id: HashMap<u32, BindingKind> = HashMap::new();
    let mut edges = EdgeState::default();
    let receiver = GlobalHotKeyEvent::receiver();

    while running.load(Ordering::SeqCst) {
        // Atomic swap point: no key event is being processed here
        if let Some(bindings) = pending.lock().take() {
            for hotkey in registered.drain(..) {
                if let Err(e) = manager.unregister(hotkey) {
                    debug!("Unregister failed: {}", e);
                }
            }
            by_id.clear();
            edges = EdgeState::default();

            let wanted = [
                (BindingKind::PushToTalk, bindings.push_to_talk),
                (BindingKind::MuteSelf, bindings.mute_self),
            ];
            for (kind, binding) in wanted {
                let Some(binding) = binding else { continue };
                match binding.to_registration() {
                    Ok(hotkey) => match manager.register(hotkey) {
                        Ok(()) => {
                            by_id.insert(hotkey.id(), kind);
                            registered.push(hotkey);
                            info!("Registered {:?} hotkey {:?}", kind, binding);
                        }
                        Err(e) => warn!("Failed to register {:?} hotkey: {}", kind, e),
                    },
                    Err(e) => warn!("Invalid {:?} hotkey: {}", kind, e),
                }
            }
        }

        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                let Some(&kind) = by_id.get(&event.id) else {
                    continue;
                };
                if let Some(out) = edges.on_event(kind, event.state) {
                    if events.send(out).is_err() {
                        break;
                    }
                }
            }
            Err(_) => continue,
        }
    }

    for hotkey in registered {
        let _ = manager.unregister(hotkey);
    }
}
