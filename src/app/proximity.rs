//! Proximity coordinator
//!
//! The control loop between position data, the signalling roster and the
//! audio pipeline. It decides which sessions exist, how far away every
//! peer is and what gain and pan they get. It never talks to the
//! signalling socket itself: outbound messages are returned to the
//! orchestrator for routing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::AudioPipeline;
use crate::config::ConfigStore;
use crate::network::{negotiation_role, ClientMessage, PeerPosition, SessionManager};
use crate::position::PositionSample;

use super::peers::{PeerRegistry, ROSTER_GRACE};

/// Minimum spacing between UpdatePosition messages (<= 10 Hz)
pub const POSITION_SEND_INTERVAL: Duration = Duration::from_millis(100);

/// Coordinates peers, sessions and spatial audio
pub struct ProximityCoordinator {
    registry: PeerRegistry,
    sessions: Arc<SessionManager>,
    pipeline: Arc<AudioPipeline>,
    store: Arc<ConfigStore>,
    client_id: Mutex<String>,
    local: Mutex<Option<PositionSample>>,
    last_update_sent: Mutex<Option<Instant>>,
}

impl ProximityCoordinator {
    pub fn new(
        sessions: Arc<SessionManager>,
        pipeline: Arc<AudioPipeline>,
        store: Arc<ConfigStore>,
        client_id: String,
    ) -> Self {
        Self {
            registry: PeerRegistry::new(),
            sessions,
            pipeline,
            store,
            client_id: Mutex::new(client_id),
            local: Mutex::new(None),
            last_update_sent: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> String {
        self.client_id.lock().clone()
    }

    /// Swap in a freshly generated identity (explicit reconnect)
    pub fn set_client_id(&self, id: String) {
        *self.client_id.lock() = id;
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Local position as the data-channel payload, if known
    pub fn local_peer_position(&self) -> Option<PeerPosition> {
        self.local.lock().as_ref().map(|s| PeerPosition {
            map_id: s.map_id,
            x: s.x,
            y: s.y,
            character_name: s.character_name.clone(),
        })
    }

    /// Ingest a fresh local sample.
    ///
    /// Recomputes every peer's spatial state, pushes the position to all
    /// open data channels and returns the (rate-limited) UpdatePosition
    /// message for the signalling server, if one is due.
    pub async fn on_local_sample(&self, sample: PositionSample) -> Option<ClientMessage> {
        *self.local.lock() = Some(sample.clone());

        let payload = PeerPosition {
            map_id: sample.map_id,
            x: sample.x,
            y: sample.y,
            character_name: sample.character_name.clone(),
        };
        self.sessions.broadcast_position(&payload).await;

        self.refresh_all_peers();

        let now = Instant::now();
        let mut last_sent = self.last_update_sent.lock();
        let due = last_sent
            .map(|at| now.duration_since(at) >= POSITION_SEND_INTERVAL)
            .unwrap_or(true);
        if !due {
            return None;
        }
        *last_sent = Some(now);

        let config = self.store.get();
        Some(ClientMessage::UpdatePosition {
            client_id: self.client_id(),
            map_id: sample.map_id,
            x: sample.x,
            y: sample.y,
            channel: config.channel,
        })
    }

    /// Reconcile the signalling roster: records and sessions for present
    /// ids, absence bookkeeping for the rest. Session setup is dispatched
    /// one task per peer; a slow handshake must not delay the others.
    pub fn on_roster(&self, ids: Vec<String>) {
        let added = self.registry.apply_roster(&ids, Instant::now());
        if !added.is_empty() {
            info!("New nearby peers: {:?}", added);
        }

        let local_id = self.client_id();
        for peer_id in ids {
            let role = negotiation_role(&local_id, &peer_id);
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                if let Err(e) = sessions.ensure_session(&peer_id, role).await {
                    warn!("Could not open session to {}: {}", peer_id, e);
                }
            });
        }
    }

    /// Tear down peers absent from the roster past the grace period
    pub async fn sweep(&self) {
        for peer_id in self.registry.expired(Instant::now(), ROSTER_GRACE) {
            info!("Peer {} left proximity", peer_id);
            self.sessions.close(&peer_id).await;
            self.pipeline.remove_peer(&peer_id);
            self.registry.remove(&peer_id);
        }
    }

    /// Record a peer we learned about outside a roster update
    pub fn note_peer(&self, peer_id: &str) {
        if self.registry.ensure(peer_id, Instant::now()) {
            debug!("Peer {} introduced ahead of the roster", peer_id);
        }
    }

    /// Inbound position from a peer's data channel
    pub fn on_peer_position(&self, peer_id: &str, position: &PeerPosition) {
        let Some(applied) = self.registry.apply_position(peer_id, position) else {
            debug!("Position from unknown peer {} dropped", peer_id);
            return;
        };

        // Settings follow the character name; the old entry stays in the
        // store for when that character comes back
        if let Some(name) = applied.renamed_to {
            let settings = self.store.peer_settings(&name);
            self.registry
                .set_settings(peer_id, settings.volume, settings.is_muted);
        }

        self.refresh_peer(peer_id);
    }

    /// Transmission flag bookkeeping (driven by the audio pipeline)
    pub fn on_transmission_changed(&self, peer_id: &str, transmitting: bool) {
        self.registry.set_transmitting(peer_id, transmitting);
    }

    /// A session went away; rebuild it if the peer is still nearby
    pub fn on_session_closed(&self, peer_id: &str) {
        self.pipeline.remove_peer(peer_id);

        if self.registry.in_roster(peer_id) {
            let role = negotiation_role(&self.client_id(), peer_id);
            debug!("Rebuilding session for nearby peer {}", peer_id);
            let sessions = self.sessions.clone();
            let peer_id = peer_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = sessions.ensure_session(&peer_id, role).await {
                    warn!("Session rebuild for {} failed: {}", peer_id, e);
                }
            });
        }
    }

    /// UI volume change; persists under the character name when known
    pub fn set_peer_volume(&self, peer_id: &str, volume: f32) {
        let Some(record) = self.registry.get(peer_id) else { return };
        let volume = volume.clamp(0.0, 1.0);

        self.registry.set_settings(peer_id, volume, record.muted);
        if let Some(name) = &record.character_name {
            if let Err(e) = self.store.update_peer(name, volume, record.muted) {
                warn!("Could not persist volume for {}: {}", name, e);
            }
        }
        self.refresh_peer(peer_id);
    }

    /// UI mute change; persists under the character name when known
    pub fn set_peer_muted(&self, peer_id: &str, muted: bool) {
        let Some(record) = self.registry.get(peer_id) else { return };

        self.registry.set_settings(peer_id, record.volume, muted);
        if let Some(name) = &record.character_name {
            if let Err(e) = self.store.update_peer(name, record.volume, muted) {
                warn!("Could not persist mute for {}: {}", name, e);
            }
        }
        self.refresh_peer(peer_id);
    }

    /// Recompute one peer's distance/pan and push it to the pipeline
    pub fn refresh_peer(&self, peer_id: &str) {
        let local = self.local.lock().clone();
        let Some(record) = self.registry.get(peer_id) else { return };
        let max_distance = self.store.get().max_distance;

        let (distance, delta_x) = match (&local, record.map_id) {
            (Some(local), Some(map_id)) => {
                spatial_for(local, map_id, record.x, record.y, max_distance)
            }
            // No position on either side yet: fully attenuated
            _ => (max_distance, 0.0),
        };

        let pan = crate::audio::spatial::pan(delta_x, distance, max_distance);
        self.registry.set_spatial(peer_id, distance, pan);
        self.pipeline
            .update_peer(peer_id, distance, delta_x, record.volume, record.muted);
    }

    fn refresh_all_peers(&self) {
        for record in self.registry.snapshot() {
            self.refresh_peer(&record.id);
        }
    }
}

/// Distance and horizontal offset between the local sample and a peer.
///
/// Peers on another map are at full range with no pan.
fn spatial_for(
    local: &PositionSample,
    peer_map_id: u16,
    peer_x: i32,
    peer_y: i32,
    max_distance: f32,
) -> (f32, f32) {
    if local.map_id != peer_map_id {
        return (max_distance, 0.0);
    }

    let dx = (peer_x - local.x) as f64;
    let dy = (peer_y - local.y) as f64;
    let distance = (dx * dx + dy * dy).sqrt() as f32;
    (distance, dx as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FadeEngine, PipelineEvent};
    use crate::network::{new_voice_track, MediaSink, RtcFactory, SessionEvent, SessionState};
    use tokio::sync::mpsc;

    fn sample(map_id: u16, x: i32, y: i32) -> PositionSample {
        PositionSample {
            timestamp_ms: 0,
            success: true,
            map_id,
            map_name: "map".to_string(),
            x,
            y,
            character_name: "Local".to_string(),
        }
    }

    struct Fixture {
        coordinator: Arc<ProximityCoordinator>,
        sessions: Arc<SessionManager>,
        store: Arc<ConfigStore>,
        _sess_rx: mpsc::UnboundedReceiver<SessionEvent>,
        _pipe_rx: mpsc::UnboundedReceiver<PipelineEvent>,
        _dir: tempfile::TempDir,
    }

    /// Session setup runs in spawned tasks; poll until it lands
    async fn wait_for_state(sessions: &SessionManager, peer_id: &str, state: SessionState) {
        for _ in 0..250 {
            if sessions.session_state(peer_id).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {} never reached {:?}", peer_id, state);
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::load_or_default(dir.path()));

        let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();
        let fader = Arc::new(FadeEngine::new());
        let pipeline = Arc::new(AudioPipeline::new(fader, 0.5, 100.0, pipe_tx));

        let (sess_tx, sess_rx) = mpsc::unbounded_channel();
        let factory = RtcFactory::new(None).unwrap();
        let sink: MediaSink = Arc::new(|_: &str, _: &[u8]| {});
        let sessions = Arc::new(SessionManager::new(factory, new_voice_track(), sess_tx, sink));

        let coordinator = Arc::new(ProximityCoordinator::new(
            sessions.clone(),
            pipeline,
            store.clone(),
            "aaaa".to_string(),
        ));
        Fixture {
            coordinator,
            sessions,
            store,
            _sess_rx: sess_rx,
            _pipe_rx: pipe_rx,
            _dir: dir,
        }
    }

    #[test]
    fn test_spatial_same_map() {
        let local = sample(1, 0, 0);
        let (distance, dx) = spatial_for(&local, 1, 30, 40, 100.0);
        assert!((distance - 50.0).abs() < 1e-4);
        assert_eq!(dx, 30.0);
    }

    #[test]
    fn test_spatial_cross_map_is_full_range() {
        let local = sample(1, 0, 0);
        let (distance, dx) = spatial_for(&local, 2, 3, 4, 100.0);
        assert_eq!(distance, 100.0);
        assert_eq!(dx, 0.0);
    }

    #[tokio::test]
    async fn test_roster_creates_sessions_with_tie_break() {
        let f = fixture();

        // local "aaaa": initiator towards "bbbb", responder towards "0000"
        f.coordinator
            .on_roster(vec!["bbbb".to_string(), "0000".to_string()]);

        wait_for_state(&f.sessions, "bbbb", SessionState::Offering).await;
        wait_for_state(&f.sessions, "0000", SessionState::New).await;
        assert_eq!(f.sessions.session_count().await, 2);
        assert_eq!(f.coordinator.registry().len(), 2);

        f.sessions.close_all().await;
    }

    #[tokio::test]
    async fn test_roster_is_idempotent_for_sessions() {
        let f = fixture();

        f.coordinator.on_roster(vec!["bbbb".to_string()]);
        f.coordinator.on_roster(vec!["bbbb".to_string()]);

        wait_for_state(&f.sessions, "bbbb", SessionState::Offering).await;
        // give any racing duplicate task time to lose and clean up
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.sessions.session_count().await, 1);

        f.sessions.close_all().await;
    }

    #[tokio::test]
    async fn test_sweep_closes_expired_peers() {
        let f = fixture();

        f.coordinator.on_roster(vec!["bbbb".to_string()]);
        wait_for_state(&f.sessions, "bbbb", SessionState::Offering).await;
        f.coordinator.on_roster(vec![]);

        // grace has not passed yet
        f.coordinator.sweep().await;
        assert_eq!(f.sessions.session_count().await, 1);

        // shrink the clock instead of sleeping: mark the record stale
        f.coordinator
            .registry()
            .apply_roster(&["bbbb".to_string()], Instant::now() - ROSTER_GRACE);
        f.coordinator.on_roster(vec![]);
        f.coordinator.sweep().await;

        assert_eq!(f.sessions.session_count().await, 0);
        assert!(f.coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_peer_position_drives_spatial_state() {
        let f = fixture();

        f.coordinator.on_roster(vec!["bbbb".to_string()]);
        let _ = f.coordinator.on_local_sample(sample(1, 0, 0)).await;

        f.coordinator.on_peer_position(
            "bbbb",
            &PeerPosition {
                map_id: 1,
                x: 30,
                y: 40,
                character_name: "Mira".to_string(),
            },
        );

        let record = f.coordinator.registry().get("bbbb").unwrap();
        assert!((record.distance - 50.0).abs() < 1e-3);
        assert!(record.pan > 0.0);

        f.sessions.close_all().await;
    }

    #[tokio::test]
    async fn test_cross_map_peer_fully_attenuated() {
        let f = fixture();

        f.coordinator.on_roster(vec!["bbbb".to_string()]);
        let _ = f.coordinator.on_local_sample(sample(1, 0, 0)).await;

        f.coordinator.on_peer_position(
            "bbbb",
            &PeerPosition {
                map_id: 2,
                x: 5,
                y: 5,
                character_name: "Mira".to_string(),
            },
        );

        let record = f.coordinator.registry().get("bbbb").unwrap();
        assert_eq!(record.distance, 100.0);
        assert_eq!(record.pan, 0.0);

        f.sessions.close_all().await;
    }

    #[tokio::test]
    async fn test_update_position_rate_limit() {
        let f = fixture();

        let first = f.coordinator.on_local_sample(sample(1, 0, 0)).await;
        assert!(matches!(first, Some(ClientMessage::UpdatePosition { .. })));

        // immediately after: suppressed
        let second = f.coordinator.on_local_sample(sample(1, 1, 0)).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_update_position_carries_channel_and_identity() {
        let f = fixture();
        f.coordinator.set_client_id("fresh-id".to_string());

        match f.coordinator.on_local_sample(sample(3, 7, -9)).await {
            Some(ClientMessage::UpdatePosition {
                client_id,
                map_id,
                x,
                y,
                channel,
            }) => {
                assert_eq!(client_id, "fresh-id");
                assert_eq!(map_id, 3);
                assert_eq!(x, 7);
                assert_eq!(y, -9);
                assert_eq!(channel, 0);
            }
            other => panic!("expected UpdatePosition, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rename_resources_settings_from_store() {
        let f = fixture();
        f.store.update_peer("Mira", 0.3, true).unwrap();

        f.coordinator.on_roster(vec!["bbbb".to_string()]);
        let _ = f.coordinator.on_local_sample(sample(1, 0, 0)).await;

        let pos = |name: &str| PeerPosition {
            map_id: 1,
            x: 1,
            y: 1,
            character_name: name.to_string(),
        };

        // first name: stored settings apply
        f.coordinator.on_peer_position("bbbb", &pos("Mira"));
        let record = f.coordinator.registry().get("bbbb").unwrap();
        assert_eq!(record.volume, 0.3);
        assert!(record.muted);

        // renamed character: settings re-sourced under the new name
        f.coordinator.on_peer_position("bbbb", &pos("Rook"));
        let record = f.coordinator.registry().get("bbbb").unwrap();
        assert_eq!(record.volume, 1.0);
        assert!(!record.muted);

        // the old entry is retained in the store
        assert_eq!(f.store.peer_settings("Mira").volume, 0.3);

        f.sessions.close_all().await;
    }

    #[tokio::test]
    async fn test_session_closed_rebuilds_for_nearby_peer() {
        let f = fixture();

        f.coordinator.on_roster(vec!["bbbb".to_string()]);
        wait_for_state(&f.sessions, "bbbb", SessionState::Offering).await;
        f.sessions.close("bbbb").await;
        assert_eq!(f.sessions.session_count().await, 0);

        f.coordinator.on_session_closed("bbbb");
        wait_for_state(&f.sessions, "bbbb", SessionState::Offering).await;
        assert_eq!(f.sessions.session_count().await, 1);

        // a peer gone from the roster is not rebuilt
        f.coordinator.on_roster(vec![]);
        f.sessions.close("bbbb").await;
        f.coordinator.on_session_closed("bbbb");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_set_peer_volume_persists_by_character_name() {
        let f = fixture();

        f.coordinator.on_roster(vec!["bbbb".to_string()]);
        let _ = f.coordinator.on_local_sample(sample(1, 0, 0)).await;
        f.coordinator.on_peer_position(
            "bbbb",
            &PeerPosition {
                map_id: 1,
                x: 0,
                y: 0,
                character_name: "Mira".to_string(),
            },
        );

        f.coordinator.set_peer_volume("bbbb", 0.25);
        f.coordinator.set_peer_muted("bbbb", true);

        let stored = f.store.peer_settings("Mira");
        assert_eq!(stored.volume, 0.25);
        assert!(stored.is_muted);

        f.sessions.close_all().await;
    }
}
