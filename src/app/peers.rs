//! Peer registry
//!
//! One record per known-nearby peer, keyed by the peer's opaque identity.
//! A record exists while the signalling roster includes the identity or a
//! session for it is still alive; disappearance is forgiven for a grace
//! period before the record (and its session) is torn down.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::network::PeerPosition;

/// How long a peer may be absent from the roster before teardown
pub const ROSTER_GRACE: Duration = Duration::from_secs(5);

/// Everything known about a nearby peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: String,
    /// Last-known remote position; `None` until the first data-channel
    /// message arrives
    pub map_id: Option<u16>,
    pub x: i32,
    pub y: i32,
    pub character_name: Option<String>,
    /// Derived distance from the local position
    pub distance: f32,
    /// Panning factor in [-1, 1]
    pub pan: f32,
    /// Persistent UI volume (0..1), keyed by character name in the store
    pub volume: f32,
    pub muted: bool,
    pub transmitting: bool,
    pub in_roster: bool,
    pub last_seen_in_roster: Instant,
}

impl PeerRecord {
    fn new(id: String, now: Instant) -> Self {
        Self {
            id,
            map_id: None,
            x: 0,
            y: 0,
            character_name: None,
            distance: f32::INFINITY,
            pan: 0.0,
            volume: 1.0,
            muted: false,
            transmitting: false,
            in_roster: true,
            last_seen_in_roster: now,
        }
    }

    pub fn has_known_position(&self) -> bool {
        self.map_id.is_some()
    }
}

/// Result of folding one inbound position into a record
#[derive(Debug, Clone, PartialEq)]
pub struct PositionApplied {
    /// Set when the character name changed; per-peer settings must be
    /// re-sourced under the new name
    pub renamed_to: Option<String>,
}

/// Registry of peer records behind a single mutex
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a roster update in. Present ids get a record (created if
    /// needed) and a fresh roster timestamp; absent ids are only marked
    /// absent. Returns the ids that are new to the registry.
    pub fn apply_roster(&self, ids: &[String], now: Instant) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut added = Vec::new();

        for record in inner.values_mut() {
            if !ids.contains(&record.id) {
                record.in_roster = false;
            }
        }

        for id in ids {
            match inner.get_mut(id) {
                Some(record) => {
                    record.in_roster = true;
                    record.last_seen_in_roster = now;
                }
                None => {
                    inner.insert(id.clone(), PeerRecord::new(id.clone(), now));
                    added.push(id.clone());
                }
            }
        }

        added
    }

    /// Make sure a record exists for an id outside a roster update (a
    /// relayed offer can precede the roster that introduces the peer).
    /// Returns true when a record was created.
    pub fn ensure(&self, id: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(id) {
            return false;
        }
        inner.insert(id.to_string(), PeerRecord::new(id.to_string(), now));
        true
    }

    /// Ids absent from the roster for at least `grace`
    pub fn expired(&self, now: Instant, grace: Duration) -> Vec<String> {
        self.inner
            .lock()
            .values()
            .filter(|r| !r.in_roster && now.duration_since(r.last_seen_in_roster) >= grace)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Apply an inbound data-channel position to a record
    pub fn apply_position(&self, id: &str, pos: &PeerPosition) -> Option<PositionApplied> {
        let mut inner = self.inner.lock();
        let record = inner.get_mut(id)?;

        record.map_id = Some(pos.map_id);
        record.x = pos.x;
        record.y = pos.y;

        let renamed_to = if record.character_name.as_deref() != Some(&pos.character_name) {
            record.character_name = Some(pos.character_name.clone());
            Some(pos.character_name.clone())
        } else {
            None
        };

        Some(PositionApplied { renamed_to })
    }

    pub fn set_spatial(&self, id: &str, distance: f32, pan: f32) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.distance = distance;
            record.pan = pan;
        }
    }

    pub fn set_settings(&self, id: &str, volume: f32, muted: bool) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.volume = volume;
            record.muted = muted;
        }
    }

    /// Returns true when the flag actually changed
    pub fn set_transmitting(&self, id: &str, transmitting: bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(record) if record.transmitting != transmitting => {
                record.transmitting = transmitting;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<PeerRecord> {
        self.inner.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.inner.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn in_roster(&self, id: &str) -> bool {
        self.inner.lock().get(id).map(|r| r.in_roster).unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_roster_adds_new_peers_once() {
        let registry = PeerRegistry::new();
        let now = Instant::now();

        let added = registry.apply_roster(&ids(&["a", "b"]), now);
        assert_eq!(added, ids(&["a", "b"]));

        // repeat roster: nothing new
        let added = registry.apply_roster(&ids(&["a", "b"]), now);
        assert!(added.is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_absent_peer_expires_after_grace() {
        let registry = PeerRegistry::new();
        let t0 = Instant::now();
        registry.apply_roster(&ids(&["a", "b"]), t0);

        // "b" drops out
        registry.apply_roster(&ids(&["a"]), t0 + Duration::from_secs(1));

        // within grace: nothing expires
        assert!(registry
            .expired(t0 + Duration::from_secs(3), ROSTER_GRACE)
            .is_empty());

        // past grace: only "b"
        let gone = registry.expired(t0 + Duration::from_secs(6), ROSTER_GRACE);
        assert_eq!(gone, ids(&["b"]));
    }

    #[test]
    fn test_reappearing_peer_resets_grace() {
        let registry = PeerRegistry::new();
        let t0 = Instant::now();
        registry.apply_roster(&ids(&["a"]), t0);
        registry.apply_roster(&ids(&[]), t0 + Duration::from_secs(1));
        registry.apply_roster(&ids(&["a"]), t0 + Duration::from_secs(4));

        assert!(registry
            .expired(t0 + Duration::from_secs(8), ROSTER_GRACE)
            .is_empty());
        assert!(registry.in_roster("a"));
    }

    #[test]
    fn test_apply_position_updates_coordinates() {
        let registry = PeerRegistry::new();
        registry.apply_roster(&ids(&["a"]), Instant::now());

        let applied = registry
            .apply_position(
                "a",
                &PeerPosition {
                    map_id: 4,
                    x: 12,
                    y: -7,
                    character_name: "Mira".to_string(),
                },
            )
            .unwrap();
        assert_eq!(applied.renamed_to.as_deref(), Some("Mira"));

        let record = registry.get("a").unwrap();
        assert_eq!(record.map_id, Some(4));
        assert_eq!(record.x, 12);
        assert_eq!(record.y, -7);
        assert!(record.has_known_position());
    }

    #[test]
    fn test_apply_position_reports_rename_once() {
        let registry = PeerRegistry::new();
        registry.apply_roster(&ids(&["a"]), Instant::now());

        let pos = PeerPosition {
            map_id: 1,
            x: 0,
            y: 0,
            character_name: "Mira".to_string(),
        };
        assert!(registry.apply_position("a", &pos).unwrap().renamed_to.is_some());
        assert!(registry.apply_position("a", &pos).unwrap().renamed_to.is_none());

        let renamed = PeerPosition {
            character_name: "Rook".to_string(),
            ..pos
        };
        assert_eq!(
            registry.apply_position("a", &renamed).unwrap().renamed_to.as_deref(),
            Some("Rook")
        );
    }

    #[test]
    fn test_position_for_unknown_peer_is_ignored() {
        let registry = PeerRegistry::new();
        let pos = PeerPosition {
            map_id: 1,
            x: 0,
            y: 0,
            character_name: "Ghost".to_string(),
        };
        assert!(registry.apply_position("nobody", &pos).is_none());
    }

    #[test]
    fn test_set_transmitting_reports_changes() {
        let registry = PeerRegistry::new();
        registry.apply_roster(&ids(&["a"]), Instant::now());

        assert!(registry.set_transmitting("a", true));
        assert!(!registry.set_transmitting("a", true));
        assert!(registry.set_transmitting("a", false));
        assert!(!registry.set_transmitting("missing", true));
    }

    #[test]
    fn test_new_record_defaults() {
        let registry = PeerRegistry::new();
        registry.apply_roster(&ids(&["a"]), Instant::now());
        let record = registry.get("a").unwrap();

        assert_eq!(record.volume, 1.0);
        assert!(!record.muted);
        assert!(!record.transmitting);
        assert!(!record.has_known_position());
        assert_eq!(record.pan, 0.0);
    }
}
