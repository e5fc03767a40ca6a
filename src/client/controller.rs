//! Session client controller
//!
//! `SessionClient::join` acquires local media, joins through the relay with
//! bounded retries, and spawns one event-loop task that owns every piece of
//! mutable session state: the reducer, the peer map, the quality controller
//! and the screen share. The returned `SessionHandle` talks to that task
//! through a command channel.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;

use super::core::{Command, SessionCore};
use super::media::{acquire_local_media, LocalMedia, LocalTrack, MediaDevices, TrackSource};
use super::negotiation::{PeerState, Politeness};
use super::peer::{build_api, rtc_configuration, PeerContext, PeerEvent, PeerHandle};
use super::signaling::{JoinRequest, RelayEvent, RelayLink};
use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::quality::{
    ConnectionQuality, QualityCommand, QualityController, QualityLevel, RawPeerStats,
    StatsCollector, VideoProfile,
};
use crate::signaling::{Role, SignalMessage};
use crate::telemetry::{TelemetryDispatcher, TelemetryRecord};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// `retries` extra attempts are used up. The n-th retry waits `step * n`.
pub async fn with_join_retries<T, F, Fut>(retries: u32, step: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut n = 0;
    loop {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && n < retries => {
                n += 1;
                let delay = step * n;
                warn!("Join attempt {} failed: {}; retrying in {:?}", n, e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Entry point for joining live sessions
pub struct SessionClient {
    config: ConfigStore,
    devices: Arc<dyn MediaDevices>,
    telemetry: TelemetryDispatcher,
    events: Arc<EventBus>,
}

impl SessionClient {
    pub fn new(config: ConfigStore, devices: Arc<dyn MediaDevices>) -> Result<Self> {
        let telemetry = TelemetryDispatcher::from_config(&config.get().telemetry)?;
        Ok(Self {
            config,
            devices,
            telemetry,
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryDispatcher) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Subscribe before joining to see the initial membership events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Join a session. Failures carry a human-readable reason and are also
    /// published as `session.error` with their retryability.
    pub async fn join(
        &self,
        session_id: &str,
        identity: &str,
        token: &str,
        role: Role,
    ) -> Result<SessionHandle> {
        let result = self.try_join(session_id, identity, token, role).await;
        if let Err(e) = &result {
            warn!(session_id, identity, "Join failed: {}", e);
            self.events.publish(SessionEvent::SessionError {
                message: e.to_string(),
                retryable: e.is_retryable(),
            });
        }
        result
    }

    async fn try_join(
        &self,
        session_id: &str,
        identity: &str,
        token: &str,
        role: Role,
    ) -> Result<SessionHandle> {
        let config = self.config.get();
        let client = &config.client;

        let media = acquire_local_media(
            self.devices.as_ref(),
            Duration::from_secs(client.media_timeout_secs),
        )
        .await?;
        if media.is_audio_only() {
            info!(session_id, "No camera, joining audio-only");
        }

        let request = JoinRequest {
            relay_url: client.relay_url.clone(),
            session_id: session_id.to_string(),
            identity: identity.to_string(),
            token: token.to_string(),
            role,
        };
        let handshake_timeout = Duration::from_secs(client.handshake_timeout_secs);

        let joined = with_join_retries(
            client.join_retries,
            Duration::from_secs(client.join_backoff_step_secs),
            |attempt| {
                let request = &request;
                async move {
                    if attempt > 0 {
                        info!(session_id = %request.session_id, attempt, "Retrying join");
                    }
                    RelayLink::connect(request, handshake_timeout).await
                }
            },
        )
        .await
        .and_then(|link| Ok((link, Arc::new(build_api()?))));

        let (link, api) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };

        let mut core = SessionCore::new(session_id, identity, role);
        let initial = core.joined(&link.participants);

        let audio_only = media.is_audio_only();
        let initial_profile = if audio_only {
            VideoProfile::new(QualityLevel::AudioOnly, QualityLevel::AudioOnly.bitrate_kbps())
        } else {
            VideoProfile::default()
        };
        let (profile_tx, profile_rx) = watch::channel(initial_profile);

        // Keeps a video sender on every peer even without a camera
        let placeholder = LocalTrack::new(TrackSource::Camera, identity);
        placeholder.set_enabled(false);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        self.events.publish(SessionEvent::SessionJoined {
            session_id: session_id.to_string(),
            participants: link.participants.len(),
            audio_only,
        });

        let session = SessionLoop {
            core,
            api,
            rtc_config: rtc_configuration(&config.ice),
            peers: HashMap::new(),
            media,
            placeholder,
            screen: None,
            quality: QualityController::with_profile(config.quality.clone(), initial_profile),
            config: self.config.clone(),
            stats: StatsCollector::new(),
            stats_pending: false,
            stats_interval: Duration::from_secs(client.stats_interval_secs.max(1)),
            telemetry: self.telemetry.clone(),
            throttler: LogThrottler::default(),
            events: self.events.clone(),
            profile_tx,
            relay_tx: link.outbound,
            relay_rx: link.inbound,
            peer_tx,
            peer_rx,
            internal_tx,
            internal_rx,
            control_rx,
        };

        let task = tokio::spawn(session.run(initial));

        Ok(SessionHandle {
            session_id: session_id.to_string(),
            identity: identity.to_string(),
            audio_only,
            devices: self.devices.clone(),
            control: control_tx,
            events: self.events.clone(),
            profile: profile_rx,
            task,
        })
    }
}

/// Point-in-time view of one remote participant
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSnapshot {
    pub identity: String,
    /// Unknown until the relay's membership broadcast arrives
    pub role: Option<Role>,
    pub state: PeerState,
    /// (kind, track id)
    pub tracks: Vec<(String, String)>,
}

enum ControlCommand {
    ShareScreen {
        track: Arc<LocalTrack>,
        ack: oneshot::Sender<Result<()>>,
    },
    StopScreenShare {
        ack: oneshot::Sender<()>,
    },
    Participants {
        reply: oneshot::Sender<Vec<ParticipantSnapshot>>,
    },
    OutgoingVideo {
        identity: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Leave {
        ack: oneshot::Sender<()>,
    },
}

enum Internal {
    Stats(Vec<(String, RawPeerStats)>),
    RepairDone { attempt: u32 },
}

/// Handle to a joined session
pub struct SessionHandle {
    session_id: String,
    identity: String,
    audio_only: bool,
    devices: Arc<dyn MediaDevices>,
    control: mpsc::UnboundedSender<ControlCommand>,
    events: Arc<EventBus>,
    profile: watch::Receiver<VideoProfile>,
    task: JoinHandle<Result<()>>,
}

fn session_ended() -> AppError {
    AppError::Internal("Session has ended".to_string())
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Joined without a camera
    pub fn is_audio_only(&self) -> bool {
        self.audio_only
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Resolution and bitrate the encoder should currently target
    pub fn video_profile(&self) -> watch::Receiver<VideoProfile> {
        self.profile.clone()
    }

    /// Capture the screen and put it on every video sender
    pub async fn start_screen_share(&self) -> Result<()> {
        let track = self.devices.open_screen().await?;
        let (ack, done) = oneshot::channel();
        if self
            .control
            .send(ControlCommand::ShareScreen {
                track: track.clone(),
                ack,
            })
            .is_err()
        {
            track.stop();
            return Err(session_ended());
        }
        done.await.map_err(|_| session_ended())?
    }

    /// Stop sharing and restore the camera
    pub async fn stop_screen_share(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(ControlCommand::StopScreenShare { ack })
            .map_err(|_| session_ended())?;
        done.await.map_err(|_| session_ended())
    }

    pub async fn participants(&self) -> Result<Vec<ParticipantSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlCommand::Participants { reply })
            .map_err(|_| session_ended())?;
        rx.await.map_err(|_| session_ended())
    }

    /// Id of the video track currently sent to `identity`
    pub async fn outgoing_video_track_id(&self, identity: &str) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlCommand::OutgoingVideo {
                identity: identity.to_string(),
                reply,
            })
            .map_err(|_| session_ended())?;
        rx.await.map_err(|_| session_ended())
    }

    /// (kind, track id) of tracks received from `identity`
    pub async fn remote_tracks(&self, identity: &str) -> Result<Vec<(String, String)>> {
        self.participants()
            .await?
            .into_iter()
            .find(|p| p.identity == identity)
            .map(|p| p.tracks)
            .ok_or_else(|| AppError::NotFound(format!("participant {}", identity)))
    }

    /// Leave the session and release all media
    pub async fn leave(self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.control.send(ControlCommand::Leave { ack }).is_ok() {
            let _ = done.await;
        }
        self.wait().await
    }

    /// Wait until the session ends on its own (relay lost or blocked)
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| AppError::Internal(format!("Session task failed: {}", e)))?
    }
}

/// Owner of all live session state; runs on one task
struct SessionLoop {
    core: SessionCore,
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    peers: HashMap<String, PeerHandle>,
    media: LocalMedia,
    placeholder: Arc<LocalTrack>,
    screen: Option<Arc<LocalTrack>>,
    quality: QualityController,
    config: ConfigStore,
    stats: StatsCollector,
    stats_pending: bool,
    stats_interval: Duration,
    telemetry: TelemetryDispatcher,
    throttler: LogThrottler,
    events: Arc<EventBus>,
    profile_tx: watch::Sender<VideoProfile>,
    relay_tx: mpsc::UnboundedSender<SignalMessage>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
}

async fn wait_ended(track: Option<&LocalTrack>) {
    match track {
        Some(track) => track.ended().await,
        None => std::future::pending().await,
    }
}

impl SessionLoop {
    async fn run(mut self, initial: Vec<Command>) -> Result<()> {
        let _ = self.execute(initial).await;

        let mut stats_tick = tokio::time::interval(self.stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_tick.tick().await;

        let mut leave_ack = None;

        let outcome = loop {
            let screen = self.screen.clone();

            tokio::select! {
                event = self.relay_rx.recv() => match event {
                    Some(RelayEvent::Message(message)) => {
                        let commands = self.core.handle(message);
                        if let Some(outcome) = self.execute(commands).await {
                            break outcome;
                        }
                    }
                    Some(RelayEvent::Closed) | None => {
                        break Err(AppError::Handshake(
                            "Connection to the classroom server was lost".to_string(),
                        ));
                    }
                },

                Some(event) = self.peer_rx.recv() => {
                    let commands = match event {
                        PeerEvent::StateChanged { identity, state } => {
                            self.core.peer_state_changed(&identity, state)
                        }
                        PeerEvent::RemoteTrack { identity, kind, track_id } => {
                            self.core.remote_track(&identity, &kind, &track_id)
                        }
                    };
                    let _ = self.execute(commands).await;
                }

                Some(internal) = self.internal_rx.recv() => match internal {
                    Internal::Stats(samples) => {
                        self.stats_pending = false;
                        self.on_stats(&samples, Instant::now());
                    }
                    Internal::RepairDone { attempt } => {
                        info!(attempt, "ICE restart wave complete");
                        self.quality.repair_completed(Instant::now());
                    }
                },

                command = self.control_rx.recv() => match command {
                    Some(ControlCommand::Leave { ack }) => {
                        leave_ack = Some(ack);
                        let _ = self.relay_tx.send(SignalMessage::LeaveVideoSession {
                            session_id: self.core.session_id().to_string(),
                        });
                        break Ok(());
                    }
                    Some(ControlCommand::ShareScreen { track, ack }) => {
                        self.share_screen(track).await;
                        let _ = ack.send(Ok(()));
                    }
                    Some(ControlCommand::StopScreenShare { ack }) => {
                        self.stop_screen_share().await;
                        let _ = ack.send(());
                    }
                    Some(ControlCommand::Participants { reply }) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(ControlCommand::OutgoingVideo { identity, reply }) => {
                        let track_id = match self.peers.get(&identity) {
                            Some(peer) => peer.video_track_id().await,
                            None => None,
                        };
                        let _ = reply.send(track_id);
                    }
                    None => {
                        debug!("Session handle dropped, leaving");
                        let _ = self.relay_tx.send(SignalMessage::LeaveVideoSession {
                            session_id: self.core.session_id().to_string(),
                        });
                        break Ok(());
                    }
                },

                _ = stats_tick.tick() => self.poll_stats(),

                _ = wait_ended(screen.as_deref()) => {
                    info!("Screen share ended by the user");
                    self.stop_screen_share().await;
                }
            }
        };

        self.shutdown(&outcome);
        if let Some(ack) = leave_ack {
            let _ = ack.send(());
        }
        outcome
    }

    /// Perform reducer commands. Returns the session outcome on termination.
    async fn execute(&mut self, commands: Vec<Command>) -> Option<Result<()>> {
        for command in commands {
            match command {
                Command::CreatePeer {
                    identity,
                    politeness,
                } => self.create_peer(identity, politeness).await,
                Command::SendOffer {
                    identity,
                    ice_restart,
                } => {
                    if let Some(peer) = self.peers.get(&identity) {
                        // Failures are logged by the peer worker
                        drop(peer.make_offer(ice_restart));
                    }
                }
                Command::ApplyOffer {
                    identity,
                    sdp,
                    ice_restart,
                } => {
                    if let Some(peer) = self.peers.get(&identity) {
                        peer.remote_offer(sdp, ice_restart);
                    }
                }
                Command::ApplyAnswer { identity, sdp } => {
                    if let Some(peer) = self.peers.get(&identity) {
                        peer.remote_answer(sdp);
                    }
                }
                Command::AddCandidate {
                    identity,
                    candidate,
                } => {
                    if let Some(peer) = self.peers.get(&identity) {
                        peer.remote_candidate(candidate);
                    }
                }
                Command::ClosePeer { identity } => {
                    if let Some(peer) = self.peers.remove(&identity) {
                        peer.close();
                    }
                }
                Command::Emit(event) => self.events.publish(event),
                Command::Terminate { reason } => return Some(Err(AppError::Blocked(reason))),
            }
        }
        None
    }

    async fn create_peer(&mut self, identity: String, politeness: Politeness) {
        let ctx = PeerContext {
            session_id: self.core.session_id().to_string(),
            local_identity: self.core.local().identity.clone(),
            remote_identity: identity.clone(),
            politeness,
            signal_tx: self.relay_tx.clone(),
            event_tx: self.peer_tx.clone(),
        };
        let video = self.outgoing_video();

        match PeerHandle::create(self.api.clone(), self.rtc_config.clone(), ctx, &self.media.audio, &video).await {
            Ok(peer) => {
                if let Some(stale) = self.peers.insert(identity, peer) {
                    stale.close();
                }
            }
            Err(e) => warn!("Could not create peer connection to {}: {}", identity, e),
        }
    }

    /// Track the video senders should carry right now
    fn outgoing_video(&self) -> Arc<LocalTrack> {
        self.screen
            .clone()
            .or_else(|| self.media.video.clone())
            .unwrap_or_else(|| self.placeholder.clone())
    }

    fn sync_video_enabled(&self) {
        let enabled = self.profile_tx.borrow().video_enabled;
        if let Some(camera) = &self.media.video {
            camera.set_enabled(enabled);
        }
        if let Some(screen) = &self.screen {
            screen.set_enabled(enabled);
        }
    }

    async fn replace_video_everywhere(&self, track: &LocalTrack) {
        for peer in self.peers.values() {
            if let Err(e) = peer.replace_video_track(track).await {
                warn!("Peer {}: {}", peer.identity(), e);
            }
        }
    }

    async fn share_screen(&mut self, track: Arc<LocalTrack>) {
        if let Some(previous) = self.screen.take() {
            previous.stop();
        }
        self.replace_video_everywhere(&track).await;
        self.screen = Some(track);
        self.sync_video_enabled();
        info!(session_id = %self.core.session_id(), "Screen share started");
        self.events.publish(SessionEvent::ScreenShareStarted);
    }

    async fn stop_screen_share(&mut self) {
        let Some(screen) = self.screen.take() else {
            return;
        };
        screen.stop();
        let camera = self.outgoing_video();
        self.replace_video_everywhere(&camera).await;
        self.sync_video_enabled();
        info!(session_id = %self.core.session_id(), "Screen share stopped, camera restored");
        self.events.publish(SessionEvent::ScreenShareStopped);
    }

    fn snapshot(&self) -> Vec<ParticipantSnapshot> {
        let mut snapshot: Vec<ParticipantSnapshot> = self
            .core
            .participants()
            .map(|p| ParticipantSnapshot {
                identity: p.identity.clone(),
                role: p.role,
                state: p.state,
                tracks: p.tracks.clone(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshot
    }

    fn poll_stats(&mut self) {
        if self.stats_pending || self.peers.is_empty() {
            return;
        }
        self.stats_pending = true;

        let peers: Vec<PeerHandle> = self.peers.values().cloned().collect();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut samples = Vec::with_capacity(peers.len());
            for peer in &peers {
                samples.push((peer.identity().to_string(), peer.stats().await));
            }
            let _ = tx.send(Internal::Stats(samples));
        });
    }

    fn on_stats(&mut self, samples: &[(String, RawPeerStats)], now: Instant) {
        // Peers that left while stats were in flight
        let samples: Vec<(String, RawPeerStats)> = samples
            .iter()
            .filter(|(identity, _)| self.peers.contains_key(identity))
            .cloned()
            .collect();

        let Some(metrics) = self.stats.sample(&samples, now) else {
            return;
        };
        // Policy edits take effect on the next tick
        let config = self.config.get();
        self.quality.set_policy(config.quality.clone());
        let health = config.health.score(&metrics);

        self.telemetry.dispatch(TelemetryRecord::new(
            self.core.session_id(),
            &self.core.local().identity,
            metrics,
            health,
        ));

        // A failed transport is critical whatever the counters say
        let quality = if self.core.transport_degraded() {
            ConnectionQuality::Critical
        } else {
            health.quality
        };
        if !quality.is_healthy() {
            warn_throttled!(
                self.throttler,
                "degraded_quality",
                score = health.score,
                loss = metrics.packet_loss,
                rtt_ms = metrics.rtt_ms,
                "Connection quality {}",
                quality
            );
        }

        for command in self.quality.evaluate(quality, now) {
            match command {
                QualityCommand::BandChanged(quality) => {
                    self.events.publish(SessionEvent::QualityChanged {
                        quality,
                        score: health.score,
                    });
                }
                QualityCommand::ApplyProfile(profile) => self.apply_profile(profile),
                QualityCommand::RestartIce { attempt } => self.start_repair(attempt),
            }
        }
    }

    fn apply_profile(&mut self, profile: VideoProfile) {
        info!(
            level = %profile.level,
            max_bitrate_kbps = profile.max_bitrate_kbps,
            "Applying video profile"
        );
        self.profile_tx.send_replace(profile);
        self.sync_video_enabled();
        self.events.publish(SessionEvent::LevelChanged {
            level: profile.level,
            max_bitrate_kbps: profile.max_bitrate_kbps,
        });
    }

    fn start_repair(&mut self, attempt: u32) {
        let acks: Vec<_> = self
            .core
            .restart_ice()
            .into_iter()
            .filter_map(|command| match command {
                Command::SendOffer {
                    identity,
                    ice_restart,
                } => self.peers.get(&identity).map(|p| p.make_offer(ice_restart)),
                _ => None,
            })
            .collect();

        self.events.publish(SessionEvent::RepairStarted {
            attempt,
            peers: acks.len(),
        });

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let results = futures::future::join_all(acks).await;
            let failed = results.iter().filter(|r| !matches!(r, Ok(Ok(())))).count();
            if failed > 0 {
                warn!(attempt, failed, "Some ICE restart offers failed");
            }
            let _ = tx.send(Internal::RepairDone { attempt });
        });
    }

    fn shutdown(&mut self, outcome: &Result<()>) {
        for command in self.core.leave() {
            if let Command::ClosePeer { identity } = command {
                if let Some(peer) = self.peers.remove(&identity) {
                    peer.close();
                }
            }
        }
        for (_, peer) in self.peers.drain() {
            peer.close();
        }

        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.media.stop();
        self.placeholder.stop();

        match outcome {
            Ok(()) => info!(session_id = %self.core.session_id(), "Left session"),
            Err(AppError::Blocked(_)) => {}
            Err(e) => {
                warn!(session_id = %self.core.session_id(), "Session ended: {}", e);
                self.events.publish(SessionEvent::SessionError {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
        self.events.publish(SessionEvent::SessionEnded);
    }
}
