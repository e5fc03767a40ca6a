//! Peer connection per remote participant
//!
//! Each `PeerHandle` owns one `RTCPeerConnection` with exactly one audio
//! sender (the microphone) and one video sender (camera or screen). All
//! negotiation for the peer runs on a dedicated worker task so offers,
//! answers and candidates are applied in the order they arrived.
//!
//! webrtc-rs cannot roll back a local offer, so a polite peer that loses an
//! offer collision replaces its transport with a fresh one carrying the same
//! two tracks, then answers the winning offer. Callbacks from a replaced
//! transport are discarded by generation.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::media::LocalTrack;
use super::negotiation::{CandidateDecision, Negotiator, OfferDecision, PeerState, Politeness};
use crate::config::IceServersConfig;
use crate::error::{AppError, Result};
use crate::quality::RawPeerStats;
use crate::signaling::{IceCandidate, SignalMessage};

/// Build the shared WebRTC API (codecs + default interceptors)
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Peer connection configuration from the STUN/TURN list
pub fn rtc_configuration(ice: &IceServersConfig) -> RTCConfiguration {
    let mut ice_servers = vec![];

    for stun_url in ice.stun_servers.iter().filter(|s| !s.is_empty()) {
        ice_servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in &ice.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

/// Notifications from a peer to the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged { identity: String, state: PeerState },
    RemoteTrack { identity: String, kind: String, track_id: String },
}

/// Wiring for one peer
pub struct PeerContext {
    pub session_id: String,
    pub local_identity: String,
    pub remote_identity: String,
    pub politeness: Politeness,
    /// Outbound relay messages
    pub signal_tx: mpsc::UnboundedSender<SignalMessage>,
    pub event_tx: mpsc::UnboundedSender<PeerEvent>,
}

enum PeerCommand {
    MakeOffer {
        ice_restart: bool,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    RemoteOffer {
        sdp: String,
        ice_restart: bool,
    },
    RemoteAnswer {
        sdp: String,
    },
    RemoteCandidate(IceCandidate),
    LocalCandidate(IceCandidate),
    ReplaceVideo {
        track: Arc<dyn TrackLocal + Send + Sync>,
        ack: oneshot::Sender<Result<()>>,
    },
    Close,
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::Idle),
        RTCPeerConnectionState::Connecting => Some(PeerState::Negotiating),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

/// One negotiated connection with its two senders
struct Transport {
    pc: Arc<RTCPeerConnection>,
    audio_sender: Arc<RTCRtpSender>,
    video_sender: Arc<RTCRtpSender>,
}

/// Opens transports for one peer and wires their callbacks
struct TransportFactory {
    api: Arc<API>,
    config: RTCConfiguration,
    identity: String,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    commands: mpsc::WeakUnboundedSender<PeerCommand>,
    receiving_video: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl TransportFactory {
    async fn open(
        &self,
        audio: Arc<dyn TrackLocal + Send + Sync>,
        video: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Transport> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let audio_sender = pc
            .add_track(audio)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add audio track: {}", e)))?;
        let video_sender = pc
            .add_track(video)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

        // Senders must be read for RTCP to be processed by the interceptors
        for sender in [audio_sender.clone(), video_sender.clone()] {
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.install_handlers(&pc, generation);

        Ok(Transport {
            pc,
            audio_sender,
            video_sender,
        })
    }

    fn install_handlers(&self, pc: &RTCPeerConnection, generation: u64) {
        // Connection state
        let current = self.generation.clone();
        let event_tx = self.event_tx.clone();
        let identity = self.identity.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if current.load(Ordering::SeqCst) == generation {
                if let Some(state) = map_state(s) {
                    info!("Peer {} connection state: {}", identity, state);
                    let _ = event_tx.send(PeerEvent::StateChanged {
                        identity: identity.clone(),
                        state,
                    });
                }
            }
            Box::pin(async {})
        }));

        // Local candidates go through the worker so they follow the offer/answer
        let current = self.generation.clone();
        let weak = self.commands.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if current.load(Ordering::SeqCst) == generation {
                if let (Some(c), Some(tx)) = (candidate, weak.upgrade()) {
                    match c.to_json() {
                        Ok(init) => {
                            let _ = tx.send(PeerCommand::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => debug!("Failed to serialize ICE candidate: {}", e),
                    }
                }
            }
            Box::pin(async {})
        }));

        // Remote tracks
        let current = self.generation.clone();
        let event_tx = self.event_tx.clone();
        let identity = self.identity.clone();
        let receiving_video = self.receiving_video.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            if current.load(Ordering::SeqCst) == generation {
                let kind = match track.kind() {
                    RTPCodecType::Audio => "audio",
                    RTPCodecType::Video => {
                        receiving_video.store(true, Ordering::SeqCst);
                        "video"
                    }
                    _ => "unknown",
                };
                let track_id = track.id().to_string();
                info!("Received {} track {} from {}", kind, track_id, identity);
                let _ = event_tx.send(PeerEvent::RemoteTrack {
                    identity: identity.clone(),
                    kind: kind.to_string(),
                    track_id,
                });
            }

            Box::pin(async move {
                // Playback is the embedding application's job; keep the buffers drained
                while track.read_rtp().await.is_ok() {}
            })
        }));
    }
}

/// Controller-side handle to one peer connection
#[derive(Clone)]
pub struct PeerHandle {
    identity: String,
    transport: Arc<ArcSwap<Transport>>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    receiving_video: Arc<AtomicBool>,
}

fn worker_gone() -> AppError {
    AppError::Internal("Peer connection is closed".to_string())
}

impl PeerHandle {
    /// Create the connection, attach both senders and start the worker
    pub async fn create(
        api: Arc<API>,
        config: RTCConfiguration,
        ctx: PeerContext,
        audio: &LocalTrack,
        video: &LocalTrack,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiving_video = Arc::new(AtomicBool::new(false));

        let factory = TransportFactory {
            api,
            config,
            identity: ctx.remote_identity.clone(),
            event_tx: ctx.event_tx.clone(),
            commands: tx.downgrade(),
            receiving_video: receiving_video.clone(),
            generation: Arc::new(AtomicU64::new(0)),
        };
        let transport = Arc::new(ArcSwap::from_pointee(
            factory.open(audio.rtc_track(), video.rtc_track()).await?,
        ));

        info!(
            "Peer connection to {} created ({:?})",
            ctx.remote_identity, ctx.politeness
        );

        let handle = Self {
            identity: ctx.remote_identity.clone(),
            transport: transport.clone(),
            commands: tx,
            receiving_video,
        };

        let worker = PeerWorker {
            negotiator: Negotiator::new(ctx.politeness),
            ctx,
            factory,
            transport,
        };
        tokio::spawn(worker.run(rx));

        Ok(handle)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queue an offer; the receiver resolves once it was sent (or failed)
    pub fn make_offer(&self, ice_restart: bool) -> oneshot::Receiver<Result<()>> {
        let (ack, done) = oneshot::channel();
        let _ = self.commands.send(PeerCommand::MakeOffer {
            ice_restart,
            ack: Some(ack),
        });
        done
    }

    pub fn remote_offer(&self, sdp: String, ice_restart: bool) {
        let _ = self
            .commands
            .send(PeerCommand::RemoteOffer { sdp, ice_restart });
    }

    pub fn remote_answer(&self, sdp: String) {
        let _ = self.commands.send(PeerCommand::RemoteAnswer { sdp });
    }

    pub fn remote_candidate(&self, candidate: IceCandidate) {
        let _ = self.commands.send(PeerCommand::RemoteCandidate(candidate));
    }

    /// Swap the video sender's track in place; no renegotiation
    pub async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(PeerCommand::ReplaceVideo {
                track: track.rtc_track(),
                ack,
            })
            .map_err(|_| worker_gone())?;
        done.await.map_err(|_| worker_gone())??;
        debug!("Peer {} video sender now carries {}", self.identity, track.id());
        Ok(())
    }

    pub async fn audio_track_id(&self) -> Option<String> {
        let transport = self.transport.load_full();
        transport.audio_sender.track().await.map(|t| t.id().to_string())
    }

    pub async fn video_track_id(&self) -> Option<String> {
        let transport = self.transport.load_full();
        transport.video_sender.track().await.map(|t| t.id().to_string())
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.transport.load().pc.signaling_state()
    }

    /// Cumulative transport counters for the stats collector
    pub async fn stats(&self) -> RawPeerStats {
        let pc = self.transport.load().pc.clone();
        let report = pc.get_stats().await;
        let mut raw = RawPeerStats {
            expects_video: self.receiving_video.load(Ordering::SeqCst),
            ..Default::default()
        };
        let mut rtts = Vec::new();

        for stat in report.reports.values() {
            match stat {
                StatsReportType::RemoteInboundRTP(remote) => {
                    raw.packets_received += remote.packets_received;
                    raw.packets_lost += remote.packets_lost.max(0) as u64;
                    if let Some(rtt) = remote.round_trip_time {
                        rtts.push(rtt * 1000.0);
                    }
                }
                StatsReportType::InboundRTP(inbound) if inbound.kind == "video" => {
                    raw.video_packets_received += inbound.packets_received;
                    raw.video_bytes_received += inbound.bytes_received;
                }
                StatsReportType::InboundRTP(inbound) if inbound.kind == "audio" => {
                    raw.audio_bytes_received += inbound.bytes_received;
                }
                _ => {}
            }
        }

        if !rtts.is_empty() {
            raw.rtt_ms = Some(rtts.iter().sum::<f64>() / rtts.len() as f64);
        }
        raw
    }

    /// Stop the worker and close the transport
    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }
}

struct PeerWorker {
    ctx: PeerContext,
    factory: TransportFactory,
    transport: Arc<ArcSwap<Transport>>,
    negotiator: Negotiator,
}

impl PeerWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PeerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PeerCommand::MakeOffer { ice_restart, ack } => {
                    let result = self.make_offer(ice_restart).await;
                    if let Err(e) = &result {
                        warn!("Offer to {} failed: {}", self.ctx.remote_identity, e);
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
                PeerCommand::RemoteOffer { sdp, ice_restart } => {
                    if let Err(e) = self.accept_offer(sdp, ice_restart).await {
                        warn!("Handling offer from {} failed: {}", self.ctx.remote_identity, e);
                        self.negotiator.exchange_failed();
                    }
                }
                PeerCommand::RemoteAnswer { sdp } => {
                    if let Err(e) = self.accept_answer(sdp).await {
                        warn!("Handling answer from {} failed: {}", self.ctx.remote_identity, e);
                        self.negotiator.exchange_failed();
                    }
                }
                PeerCommand::RemoteCandidate(candidate) => {
                    match self.negotiator.on_remote_candidate(candidate) {
                        CandidateDecision::Apply(c) => self.add_candidate(c).await,
                        CandidateDecision::Queued => {
                            debug!("Queued early ICE candidate from {}", self.ctx.remote_identity)
                        }
                        CandidateDecision::Dropped => {
                            debug!("Dropped ICE candidate for ignored offer from {}", self.ctx.remote_identity)
                        }
                    }
                }
                PeerCommand::LocalCandidate(candidate) => {
                    self.send(SignalMessage::IceCandidate {
                        session_id: self.ctx.session_id.clone(),
                        target_identity: self.ctx.remote_identity.clone(),
                        from_identity: None,
                        candidate,
                    });
                }
                PeerCommand::ReplaceVideo { track, ack } => {
                    let _ = ack.send(self.replace_video(track).await);
                }
                PeerCommand::Close => break,
            }
        }

        if let Err(e) = self.pc().close().await {
            debug!("Closing peer {}: {}", self.ctx.remote_identity, e);
        }
        debug!("Peer worker for {} stopped", self.ctx.remote_identity);
    }

    fn pc(&self) -> Arc<RTCPeerConnection> {
        self.transport.load().pc.clone()
    }

    fn send(&self, message: SignalMessage) {
        if self.ctx.signal_tx.send(message).is_err() {
            debug!("Relay link gone, dropping message for {}", self.ctx.remote_identity);
        }
    }

    fn negotiation_error(&self, e: impl std::fmt::Display) -> AppError {
        AppError::Negotiation {
            peer: self.ctx.remote_identity.clone(),
            reason: e.to_string(),
        }
    }

    async fn make_offer(&mut self, ice_restart: bool) -> Result<()> {
        if !self.negotiator.begin_offer(ice_restart) {
            debug!("Negotiation with {} already in flight, skipping offer", self.ctx.remote_identity);
            return Ok(());
        }

        match self.create_local_offer(ice_restart).await {
            Ok(offer) => {
                self.negotiator.offer_sent();
                info!(
                    "Sending {}offer to {}",
                    if ice_restart { "ICE restart " } else { "" },
                    self.ctx.remote_identity
                );
                self.send(SignalMessage::Offer {
                    session_id: self.ctx.session_id.clone(),
                    target_identity: self.ctx.remote_identity.clone(),
                    from_identity: None,
                    sdp: offer.sdp,
                    ice_restart,
                });
                Ok(())
            }
            Err(e) => {
                self.negotiator.offer_failed();
                Err(e)
            }
        }
    }

    async fn create_local_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription> {
        let pc = self.pc();
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = pc
            .create_offer(options)
            .await
            .map_err(|e| self.negotiation_error(e))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| self.negotiation_error(e))?;
        Ok(offer)
    }

    /// Abandon our local offer by moving both tracks onto a fresh transport
    async fn replace_transport(&self) -> Result<()> {
        let old = self.transport.load_full();
        let audio = old
            .audio_sender
            .track()
            .await
            .ok_or_else(|| self.negotiation_error("audio sender has no track"))?;
        let video = old
            .video_sender
            .track()
            .await
            .ok_or_else(|| self.negotiation_error("video sender has no track"))?;

        let fresh = self.factory.open(audio, video).await?;
        self.transport.store(Arc::new(fresh));

        if let Err(e) = old.pc.close().await {
            debug!("Closing abandoned transport to {}: {}", self.ctx.remote_identity, e);
        }
        Ok(())
    }

    async fn replace_video(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        let transport = self.transport.load_full();
        transport
            .video_sender
            .replace_track(Some(track))
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to replace video track: {}", e)))
    }

    async fn accept_offer(&mut self, sdp: String, ice_restart: bool) -> Result<()> {
        match self.negotiator.on_remote_offer() {
            OfferDecision::Ignore => {
                info!("Offer collision with {}, keeping our offer", self.ctx.remote_identity);
                return Ok(());
            }
            OfferDecision::RollbackThenAccept => {
                info!("Offer collision with {}, abandoning our offer", self.ctx.remote_identity);
                self.replace_transport().await?;
            }
            OfferDecision::Accept => {}
        }

        if ice_restart {
            info!("Peer {} requested ICE restart", self.ctx.remote_identity);
        }

        let pc = self.pc();
        let offer = RTCSessionDescription::offer(sdp).map_err(|e| self.negotiation_error(e))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| self.negotiation_error(e))?;

        for candidate in self.negotiator.remote_description_applied() {
            self.add_candidate(candidate).await;
        }

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| self.negotiation_error(e))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| self.negotiation_error(e))?;

        self.negotiator.answer_sent();
        self.send(SignalMessage::Answer {
            session_id: self.ctx.session_id.clone(),
            target_identity: self.ctx.remote_identity.clone(),
            from_identity: None,
            sdp: answer.sdp,
        });
        Ok(())
    }

    async fn accept_answer(&mut self, sdp: String) -> Result<()> {
        if !self.negotiator.on_remote_answer() {
            debug!("Ignoring answer from {} with no outstanding offer", self.ctx.remote_identity);
            return Ok(());
        }

        let answer = RTCSessionDescription::answer(sdp).map_err(|e| self.negotiation_error(e))?;
        self.pc()
            .set_remote_description(answer)
            .await
            .map_err(|e| self.negotiation_error(e))?;

        for candidate in self.negotiator.remote_description_applied() {
            self.add_candidate(candidate).await;
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        if let Err(e) = self.pc().add_ice_candidate(init).await {
            warn!("Failed to add ICE candidate from {}: {}", self.ctx.remote_identity, e);
        }
    }
}
