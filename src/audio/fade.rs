//! Per-peer volume fade engine
//!
//! Gain changes never jump: each new target starts a 200 ms linear ramp
//! from the gain applied at that instant. A periodic tick (>= 100 Hz)
//! refreshes the applied values; reads interpolate against the same clock
//! so the applied gain is consistent between ticks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Ramp duration for a gain transition
pub const FADE_DURATION: Duration = Duration::from_millis(200);

/// Differences below this are applied immediately without a ramp
pub const SNAP_EPSILON: f32 = 0.001;

#[derive(Debug, Clone)]
struct Fade {
    start: f32,
    target: f32,
    started_at: Instant,
    applied: f32,
}

impl Fade {
    fn interpolate(&self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.started_at);
        let t = (elapsed.as_secs_f32() / FADE_DURATION.as_secs_f32()).clamp(0.0, 1.0);
        (self.start + (self.target - self.start) * t).clamp(0.0, 1.0)
    }
}

/// Fade engine holding one transition per peer
#[derive(Default)]
pub struct FadeEngine {
    fades: Mutex<HashMap<String, Fade>>,
}

impl FadeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ramp a peer towards `target` over 200 ms.
    ///
    /// `current` is the caller's view of the applied gain and seeds the
    /// ramp for a peer without an existing fade. Mid-fade retargeting
    /// restarts from the value interpolated at this instant.
    pub fn set_target(&self, peer_id: &str, current: f32, target: f32) {
        let target = target.clamp(0.0, 1.0);
        let now = Instant::now();
        let mut fades = self.fades.lock();

        let start = fades
            .get(peer_id)
            .map(|f| f.interpolate(now))
            .unwrap_or_else(|| current.clamp(0.0, 1.0));

        if (target - start).abs() < SNAP_EPSILON {
            fades.insert(
                peer_id.to_string(),
                Fade { start: target, target, started_at: now, applied: target },
            );
            return;
        }

        fades.insert(
            peer_id.to_string(),
            Fade { start, target, started_at: now, applied: start },
        );
    }

    /// Apply a gain immediately, dropping any in-flight ramp
    pub fn set_immediate(&self, peer_id: &str, gain: f32) {
        let gain = gain.clamp(0.0, 1.0);
        self.fades.lock().insert(
            peer_id.to_string(),
            Fade { start: gain, target: gain, started_at: Instant::now(), applied: gain },
        );
    }

    /// Forget a peer
    pub fn remove(&self, peer_id: &str) {
        self.fades.lock().remove(peer_id);
    }

    /// Applied gain for a peer right now (0 for unknown peers)
    pub fn gain(&self, peer_id: &str) -> f32 {
        let now = Instant::now();
        self.fades
            .lock()
            .get_mut(peer_id)
            .map(|f| {
                f.applied = f.interpolate(now);
                f.applied
            })
            .unwrap_or(0.0)
    }

    /// Refresh applied values; called at >= 100 Hz
    pub fn tick(&self) {
        let now = Instant::now();
        for fade in self.fades.lock().values_mut() {
            fade.applied = fade.interpolate(now);
        }
    }

    /// Number of peers currently tracked
    pub fn len(&self) -> usize {
        self.fades.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fades.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_peer_is_silent() {
        let engine = FadeEngine::new();
        assert_eq!(engine.gain("nobody"), 0.0);
    }

    #[test]
    fn test_immediate_set() {
        let engine = FadeEngine::new();
        engine.set_immediate("a", 0.7);
        assert!((engine.gain("a") - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_small_delta_applies_immediately() {
        let engine = FadeEngine::new();
        engine.set_immediate("a", 0.5);
        engine.set_target("a", 0.5, 0.5004);
        // below the epsilon: no ramp, target applied at once
        assert!((engine.gain("a") - 0.5004).abs() < 1e-6);
    }

    #[test]
    fn test_ramp_starts_at_current() {
        let engine = FadeEngine::new();
        engine.set_target("a", 0.0, 1.0);
        let g = engine.gain("a");
        assert!(g < 0.2, "gain jumped to {} instead of ramping", g);
    }

    #[test]
    fn test_converges_within_duration() {
        let engine = FadeEngine::new();
        engine.set_target("a", 0.0, 1.0);
        std::thread::sleep(FADE_DURATION + Duration::from_millis(20));
        engine.tick();
        assert!((engine.gain("a") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_retarget_restarts_from_interpolated_value() {
        let engine = FadeEngine::new();
        engine.set_target("a", 0.0, 1.0);
        std::thread::sleep(Duration::from_millis(100));

        let mid = engine.gain("a");
        assert!(mid > 0.2 && mid < 0.8, "unexpected midpoint {}", mid);

        // reverse direction; ramp must continue from the midpoint, not 1.0
        engine.set_target("a", mid, 0.0);
        let after = engine.gain("a");
        assert!(
            (after - mid).abs() < 0.1,
            "retarget jumped: {} vs midpoint {}",
            after,
            mid
        );
    }

    #[test]
    fn test_gain_clamped_to_unit_range() {
        let engine = FadeEngine::new();
        engine.set_immediate("a", 3.5);
        assert_eq!(engine.gain("a"), 1.0);

        engine.set_immediate("a", -2.0);
        assert_eq!(engine.gain("a"), 0.0);
    }

    #[test]
    fn test_mute_unmute_cycle() {
        let engine = FadeEngine::new();
        engine.set_immediate("a", 0.8);

        // mute drops instantly
        engine.set_immediate("a", 0.0);
        assert_eq!(engine.gain("a"), 0.0);

        // unmute ramps back
        engine.set_target("a", 0.0, 0.8);
        assert!(engine.gain("a") < 0.3);
        std::thread::sleep(FADE_DURATION + Duration::from_millis(20));
        assert!((engine.gain("a") - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_remove() {
        let engine = FadeEngine::new();
        engine.set_immediate("a", 0.5);
        engine.remove("a");
        assert_eq!(engine.gain("a"), 0.0);
        assert!(engine.is_empty());
    }
}
