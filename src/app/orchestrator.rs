//! Application orchestrator
//!
//! Owns every subsystem and routes their typed events. Subsystems never
//! hold references to each other; everything flows through the channels
//! selected on here. The orchestrator is also where error events become
//! session teardowns and status lines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::audio::{
    AudioPipeline, CaptureControls, CaptureEngine, CaptureEvent, FadeEngine, PipelineEvent,
};
use crate::config::{config_dir, Config, ConfigStore};
use crate::input::{HotkeyBindings, HotkeyEvent, HotkeyWatcher};
use crate::network::{
    negotiation_role, new_client_id, new_voice_track, ClientMessage, MediaSink, Role, RtcFactory,
    SessionEvent, SessionManager, SignalingClient, SignalingEvent, SignalingSender,
};
use crate::position::{PositionEvent, PositionSource};

use super::proximity::ProximityCoordinator;

/// Fade engine tick period (>= 100 Hz)
const FADE_TICK: Duration = Duration::from_millis(10);

/// Transmission-timeout sweep period
const TRANSMISSION_SWEEP: Duration = Duration::from_millis(100);

/// Roster grace sweep period
const ROSTER_SWEEP: Duration = Duration::from_secs(1);

/// Delay before requesting a roster refresh after a transport failure
const REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Orchestrator options from the command line
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Periodically dump internal state (debug builds only)
    pub debug_panel: bool,
}

struct App {
    controls: Arc<CaptureControls>,
    pipeline: Arc<AudioPipeline>,
    sessions: Arc<SessionManager>,
    coordinator: Arc<ProximityCoordinator>,
    signaling: SignalingClient,
    last_level: f32,
}

/// Build every subsystem, connect to signalling and run until Ctrl+C
pub async fn run(options: AppOptions) -> Result<()> {
    let dir = config_dir();
    crate::config::install_panic_hook(dir.clone());

    let store = Arc::new(ConfigStore::load_or_default(&dir));
    let config = store.get();
    info!(
        "Starting with signaling {}:{}, channel {}, range {}",
        config.web_socket_server.host,
        config.web_socket_server.port,
        config.channel,
        config.max_distance
    );

    // Event channels, one per subsystem
    let (signaling_tx, mut signaling_rx) = mpsc::unbounded_channel::<SignalingEvent>();
    let (session_tx, mut session_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (capture_tx, mut capture_rx) = mpsc::unbounded_channel::<CaptureEvent>();
    let (pipeline_tx, mut pipeline_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let (position_tx, mut position_rx) = mpsc::unbounded_channel::<PositionEvent>();
    let (hotkey_tx, mut hotkey_rx) = mpsc::unbounded_channel::<HotkeyEvent>();

    // Fade engine with its 100 Hz tick thread
    let fader = Arc::new(FadeEngine::new());
    let fade_stop = Arc::new(AtomicBool::new(false));
    let fade_thread = {
        let fader = fader.clone();
        let stop = fade_stop.clone();
        thread::Builder::new()
            .name("fade-tick".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    fader.tick();
                    thread::sleep(FADE_TICK);
                }
            })
            .context("fade tick thread")?
    };

    let pipeline = Arc::new(AudioPipeline::new(
        fader,
        config.audio_settings.volume_scale,
        config.max_distance,
        pipeline_tx,
    ));

    // Session manager; inbound media goes straight to the pipeline from
    // the per-track reader tasks
    let factory = RtcFactory::new(None)?;
    let media_pipeline = pipeline.clone();
    let media_sink: MediaSink =
        Arc::new(move |peer_id: &str, payload: &[u8]| media_pipeline.play(peer_id, payload));
    let sessions = Arc::new(SessionManager::new(
        factory,
        new_voice_track(),
        session_tx,
        media_sink,
    ));

    let client_id = new_client_id();
    info!("Client identity {}", client_id);
    let coordinator = Arc::new(ProximityCoordinator::new(
        sessions.clone(),
        pipeline.clone(),
        store.clone(),
        client_id,
    ));

    // Signalling is mandatory; everything else degrades gracefully
    let signaling = SignalingClient::connect(
        &config.web_socket_server.host,
        config.web_socket_server.port,
        signaling_tx,
    )
    .await
    .context("connecting to signaling server")?;

    let controls = Arc::new(CaptureControls::new(
        config.audio_settings.is_push_to_talk,
        config.audio_settings.input_volume_scale,
        config.audio_settings.min_broadcast_threshold,
    ));
    let mut capture = match CaptureEngine::start(
        config.audio_settings.selected_input_device.clone(),
        controls.clone(),
        capture_tx,
    ) {
        Ok(engine) => Some(engine),
        Err(e) => {
            // Listen-only mode still works
            error!("Capture unavailable: {}", e);
            None
        }
    };

    let mut hotkeys = HotkeyWatcher::start(bindings_from(&config), hotkey_tx);
    let mut position = PositionSource::start(position_tx);

    // Ask for the current roster straight away
    if let Err(e) = signaling.send(ClientMessage::RequestPeerRefresh) {
        warn!("Initial peer refresh failed: {}", e);
    }

    let mut app = App {
        controls,
        pipeline,
        sessions,
        coordinator,
        signaling,
        last_level: 0.0,
    };

    let mut roster_sweep = tokio::time::interval(ROSTER_SWEEP);
    let mut transmission_sweep = tokio::time::interval(TRANSMISSION_SWEEP);
    let mut debug_dump = tokio::time::interval(Duration::from_secs(5));
    let debug_panel = options.debug_panel && cfg!(debug_assertions);

    loop {
        tokio::select! {
            Some(event) = signaling_rx.recv() => app.handle_signaling(event).await,
            Some(event) = session_rx.recv() => app.handle_session(event).await,
            Some(event) = capture_rx.recv() => app.handle_capture(event).await,
            Some(event) = pipeline_rx.recv() => app.handle_pipeline(event),
            Some(event) = position_rx.recv() => app.handle_position(event).await,
            Some(event) = hotkey_rx.recv() => app.handle_hotkey(event),
            _ = roster_sweep.tick() => app.coordinator.sweep().await,
            _ = transmission_sweep.tick() => app.pipeline.sweep_transmission(),
            _ = debug_dump.tick(), if debug_panel => app.dump_debug_state().await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            else => break,
        }
    }

    // Teardown in reverse dependency order
    position.stop();
    hotkeys.stop();
    if let Some(capture) = capture.as_mut() {
        capture.stop();
    }
    app.signaling.disconnect();
    app.sessions.close_all().await;
    fade_stop.store(true, Ordering::SeqCst);
    let _ = fade_thread.join();

    Ok(())
}

fn bindings_from(config: &Config) -> HotkeyBindings {
    HotkeyBindings {
        push_to_talk: config.audio_settings.push_to_talk_key.clone(),
        mute_self: config.audio_settings.mute_self_key.clone(),
    }
}

/// Ask for a fresh roster after a short delay so the proximity
/// coordinator can rebuild the torn-down session
async fn refresh_after(sender: SignalingSender, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Err(e) = sender.send(ClientMessage::RequestPeerRefresh) {
        debug!("Peer refresh not sent: {}", e);
    }
}

impl App {
    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::NearbyPeers(ids) => {
                debug!("Nearby peers: {} ids", ids.len());
                self.coordinator.on_roster(ids);
            }
            SignalingEvent::Offer { sender_id, offer } => {
                // Glare guard: only the larger identity may offer to us
                if negotiation_role(&self.coordinator.client_id(), &sender_id) != Role::Responder {
                    warn!("Ignoring offer from {}: tie-break says we initiate", sender_id);
                    return;
                }
                self.coordinator.note_peer(&sender_id);

                // Negotiation runs off the event lane so one peer's
                // handshake never stalls audio relay for the others
                let sessions = self.sessions.clone();
                let refresh = self.signaling.sender();
                tokio::spawn(async move {
                    if let Err(e) = sessions.apply_remote_offer(&sender_id, &offer).await {
                        warn!("Offer from {} failed: {}", sender_id, e);
                        sessions.close(&sender_id).await;
                        refresh_after(refresh, REFRESH_DELAY).await;
                    }
                });
            }
            SignalingEvent::Answer { sender_id, answer } => {
                let sessions = self.sessions.clone();
                let refresh = self.signaling.sender();
                tokio::spawn(async move {
                    if let Err(e) = sessions.apply_remote_answer(&sender_id, &answer).await {
                        warn!("Answer from {} failed: {}", sender_id, e);
                        sessions.close(&sender_id).await;
                        refresh_after(refresh, REFRESH_DELAY).await;
                    }
                });
            }
            SignalingEvent::IceCandidate { sender_id, candidate } => {
                if let Err(e) = self.sessions.add_remote_ice(&sender_id, &candidate).await {
                    debug!("Candidate from {} rejected: {}", sender_id, e);
                }
            }
            SignalingEvent::ServerError(message) => {
                warn!("Signaling server error: {}", message);
            }
            SignalingEvent::Disconnected => {
                // No automatic reconnect; a manual reconnect regenerates
                // the client identity
                warn!("Signaling disconnected, closing all sessions");
                self.sessions.close_all().await;
            }
        }
    }

    async fn handle_session(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::OfferReady { peer_id, sdp } => {
                self.relay_or_teardown(
                    ClientMessage::SendOffer {
                        target_id: peer_id.clone(),
                        offer: sdp,
                    },
                    &peer_id,
                )
                .await;
            }
            SessionEvent::AnswerReady { peer_id, sdp } => {
                self.relay_or_teardown(
                    ClientMessage::SendAnswer {
                        target_id: peer_id.clone(),
                        answer: sdp,
                    },
                    &peer_id,
                )
                .await;
            }
            SessionEvent::LocalCandidate { peer_id, candidate } => {
                self.relay_or_teardown(
                    ClientMessage::SendIceCandidate {
                        target_id: peer_id.clone(),
                        candidate,
                    },
                    &peer_id,
                )
                .await;
            }
            SessionEvent::DataChannelOpened { peer_id } => {
                info!("Position channel open to {}", peer_id);
                if let Some(pos) = self.coordinator.local_peer_position() {
                    self.sessions.send_position(&peer_id, &pos).await;
                }
            }
            SessionEvent::PositionReceived { peer_id, position } => {
                self.coordinator.on_peer_position(&peer_id, &position);
            }
            SessionEvent::TransportConnected { peer_id } => {
                info!("Connected to {}", peer_id);
                self.coordinator.refresh_peer(&peer_id);
            }
            SessionEvent::TransportFailed { peer_id } => {
                warn!("Transport to {} failed", peer_id);
                self.sessions.close(&peer_id).await;
                self.request_refresh_later();
            }
            SessionEvent::TransportClosed { peer_id } => {
                debug!("Transport to {} closed", peer_id);
                self.sessions.close(&peer_id).await;
                self.coordinator.on_session_closed(&peer_id);
            }
        }
    }

    async fn handle_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Level(level) => {
                trace!("Mic level {:.3}", level);
                self.last_level = level;
            }
            CaptureEvent::Packet(packet) => {
                self.sessions.write_media(&packet).await;
            }
        }
    }

    fn handle_pipeline(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::TransmissionChanged { peer_id, transmitting } => {
                debug!("Peer {} transmitting: {}", peer_id, transmitting);
                self.coordinator.on_transmission_changed(&peer_id, transmitting);
            }
        }
    }

    async fn handle_position(&mut self, event: PositionEvent) {
        match event {
            PositionEvent::Sample(sample) => {
                if let Some(message) = self.coordinator.on_local_sample(sample).await {
                    if let Err(e) = self.signaling.send(message) {
                        warn!("Position update not sent: {}", e);
                    }
                }
            }
            PositionEvent::Connected => info!("Game-data provider connected"),
            PositionEvent::Disconnected => warn!("Game-data provider disconnected"),
        }
    }

    fn handle_hotkey(&mut self, event: HotkeyEvent) {
        match event {
            HotkeyEvent::PushToTalkPressed => {
                debug!("PTT pressed");
                self.controls.set_ptt_active(true);
            }
            HotkeyEvent::PushToTalkReleased => {
                debug!("PTT released");
                self.controls.set_ptt_active(false);
            }
            HotkeyEvent::MuteToggleRequested => {
                let muted = self.controls.toggle_muted();
                info!("Self-mute {}", if muted { "on" } else { "off" });
            }
        }
    }

    /// Send a signalling message on behalf of a session; a failed send
    /// tears that session down and reports the disconnect
    async fn relay_or_teardown(&mut self, message: ClientMessage, peer_id: &str) {
        if let Err(e) = self.signaling.send(message) {
            warn!("Signaling send for {} failed ({}), closing session", peer_id, e);
            self.sessions.close(peer_id).await;
        }
    }

    fn request_refresh_later(&self) {
        tokio::spawn(refresh_after(self.signaling.sender(), REFRESH_DELAY));
    }

    /// Debug-build state dump behind `--debug`
    async fn dump_debug_state(&self) {
        let sessions = self.sessions.snapshot().await;
        let peers = self.coordinator.registry().snapshot();
        let stats = self.signaling.stats();
        info!(
            "[debug] level {:.3} | {} sessions | {} peers | signaling {}tx/{}rx/{}bad",
            self.last_level,
            sessions.len(),
            peers.len(),
            stats.messages_sent,
            stats.messages_received,
            stats.malformed_frames
        );
        for (id, role, state) in sessions {
            info!("[debug]   session {} {:?} {:?}", id, role, state);
        }
        for peer in peers {
            info!(
                "[debug]   peer {} {:?} d={:.1} pan={:.2} vol={:.2} tx={}",
                peer.id,
                peer.character_name,
                peer.distance,
                peer.pan,
                peer.volume,
                peer.transmitting
            );
        }
    }
}
