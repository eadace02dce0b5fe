//! Input subsystem: global hotkeys for push-to-talk and mute

mod hotkey;

pub use hotkey::{Hotkey, HotkeyBindings, HotkeyError, HotkeyEvent, HotkeyWatcher};
