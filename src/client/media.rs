//! Local media
//!
//! Tracks handed to peer connections, the device abstraction that produces
//! them, and the bounded acquisition used at join time.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// One outbound media track
///
/// Disabling keeps the track attached to its sender but drops samples, so
/// re-enabling needs no renegotiation. Stopping is final and fires `ended`.
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: CancellationToken,
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: &str) -> Arc<Self> {
        let id = format!("{:?}-{}", source, uuid::Uuid::new_v4()).to_lowercase();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec_for(source.kind()),
            id.clone(),
            stream_id.to_string(),
        ));
        Arc::new(Self {
            id,
            source,
            rtc,
            enabled: AtomicBool::new(true),
            ended: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Track as attached to an RTP sender
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!("Track {} {}", self.id, if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Write one encoded sample; dropped while disabled or after stop
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(());
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to write sample: {}", e)))
    }

    /// Stop the track for good
    pub fn stop(&self) {
        if !self.ended.is_cancelled() {
            info!("Track {} stopped", self.id);
            self.ended.cancel();
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Resolves once the track has stopped, whoever stopped it
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Camera and microphone owned by the session controller
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub audio: Arc<LocalTrack>,
    /// `None` after falling back to audio-only
    pub video: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn is_audio_only(&self) -> bool {
        self.video.is_none()
    }

    pub fn stop(&self) {
        self.audio.stop();
        if let Some(video) = &self.video {
            video.stop();
        }
    }
}

/// Source of capture tracks
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>>;
    async fn open_camera(&self) -> Result<Arc<LocalTrack>>;
    async fn open_screen(&self) -> Result<Arc<LocalTrack>>;
}

/// Acquire camera and microphone within `timeout`
///
/// A missing camera degrades to audio-only; a missing microphone is fatal.
/// Tracks that opened before a timeout are stopped.
pub async fn acquire_local_media(devices: &dyn MediaDevices, timeout: Duration) -> Result<LocalMedia> {
    let opened = Mutex::new(Vec::new());

    let acquire = async {
        let (microphone, camera) = tokio::join!(
            record(&opened, devices.open_microphone()),
            record(&opened, devices.open_camera())
        );

        let audio = match microphone {
            Ok(audio) => audio,
            Err(e) => {
                if let Ok(camera) = &camera {
                    camera.stop();
                }
                return Err(e);
            }
        };

        let video = match camera {
            Ok(video) => Some(video),
            Err(e) => {
                warn!("Camera unavailable, continuing audio-only: {}", e);
                None
            }
        };

        Ok(LocalMedia { audio, video })
    };

    match tokio::time::timeout(timeout, acquire).await {
        Ok(result) => result,
        Err(_) => {
            for track in opened.lock().drain(..) {
                track.stop();
            }
            Err(AppError::MediaTimeout(timeout.as_secs()))
        }
    }
}

async fn record(
    opened: &Mutex<Vec<Arc<LocalTrack>>>,
    open: impl Future<Output = Result<Arc<LocalTrack>>>,
) -> Result<Arc<LocalTrack>> {
    let track = open.await?;
    opened.lock().push(track.clone());
    Ok(track)
}

/// Opus DTX silence frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Devices for headless participants
///
/// The microphone emits Opus silence every 20ms; camera and screen tracks
/// are attached but carry no frames.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDevices {
    pub stream_id: String,
    pub camera_unavailable: bool,
    pub microphone_unavailable: bool,
    /// Artificial delay before devices open
    pub open_delay: Duration,
}

impl SyntheticDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            ..Default::default()
        }
    }

    async fn delay(&self) {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>> {
        self.delay().await;
        if self.microphone_unavailable {
            return Err(AppError::MediaAcquisition("no microphone found".to_string()));
        }

        let track = LocalTrack::new(TrackSource::Microphone, &self.stream_id);
        let pump = track.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(20));
            loop {
                tokio::select! {
                    _ = pump.ended() => break,
                    _ = interval.tick() => {
                        let sample = Sample {
                            data: Bytes::from_static(&OPUS_SILENCE),
                            duration: Duration::from_millis(20),
                            ..Default::default()
                        };
                        // No bound sender yet is not an error worth reporting
                        let _ = pump.write_sample(&sample).await;
                    }
                }
            }
        });
        Ok(track)
    }

    async fn open_camera(&self) -> Result<Arc<LocalTrack>> {
        self.delay().await;
        if self.camera_unavailable {
            return Err(AppError::MediaAcquisition("camera permission denied".to_string()));
        }
        Ok(LocalTrack::new(TrackSource::Camera, &self.stream_id))
    }

    async fn open_screen(&self) -> Result<Arc<LocalTrack>> {
        Ok(LocalTrack::new(TrackSource::Screen, &self.stream_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_camera_failure_falls_back_to_audio_only() {
        let devices = SyntheticDevices {
            camera_unavailable: true,
            ..SyntheticDevices::new("s")
        };
        let media = acquire_local_media(&devices, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(media.is_audio_only());
        media.stop();
    }

    #[tokio::test]
    async fn test_microphone_failure_is_fatal() {
        let devices = SyntheticDevices {
            microphone_unavailable: true,
            ..SyntheticDevices::new("s")
        };
        let err = acquire_local_media(&devices, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MediaAcquisition(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_devices_time_out() {
        let devices = SyntheticDevices {
            open_delay: Duration::from_secs(30),
            ..SyntheticDevices::new("s")
        };
        let err = acquire_local_media(&devices, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MediaTimeout(10)));
        assert!(err.to_string().contains("10 seconds"));
    }

    /// Microphone opens at once, camera never answers
    #[derive(Default)]
    struct HangingCamera {
        microphone: Mutex<Option<Arc<LocalTrack>>>,
    }

    #[async_trait]
    impl MediaDevices for HangingCamera {
        async fn open_microphone(&self) -> Result<Arc<LocalTrack>> {
            let track = LocalTrack::new(TrackSource::Microphone, "s");
            *self.microphone.lock() = Some(track.clone());
            Ok(track)
        }

        async fn open_camera(&self) -> Result<Arc<LocalTrack>> {
            std::future::pending().await
        }

        async fn open_screen(&self) -> Result<Arc<LocalTrack>> {
            Ok(LocalTrack::new(TrackSource::Screen, "s"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_tracks_already_opened() {
        let devices = HangingCamera::default();
        let err = acquire_local_media(&devices, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MediaTimeout(10)));

        let microphone = devices.microphone.lock().clone().unwrap();
        assert!(microphone.is_ended());
    }

    #[tokio::test]
    async fn test_stop_fires_ended() {
        let track = LocalTrack::new(TrackSource::Screen, "s");
        assert_eq!(track.kind(), TrackKind::Video);
        let waiter = track.clone();
        let handle = tokio::spawn(async move { waiter.ended().await });
        track.stop();
        handle.await.unwrap();
        assert!(track.is_ended());
    }

    #[test]
    fn test_ended_pending_until_stop() {
        let track = LocalTrack::new(TrackSource::Camera, "s");
        let mut ended = tokio_test::task::spawn(track.ended());
        tokio_test::assert_pending!(ended.poll());

        track.stop();
        assert!(ended.is_woken());
        tokio_test::assert_ready!(ended.poll());
    }

    #[test]
    fn test_disabled_track_keeps_identity() {
        let track = LocalTrack::new(TrackSource::Camera, "s");
        let id = track.rtc_track().id().to_string();
        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert_eq!(track.rtc_track().id(), id);
    }
}
