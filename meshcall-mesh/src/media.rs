//! Local media capture
//!
//! This module handles:
//! - Local tracks (microphone, screen) that can be attached to any number
//!   of connections
//! - Muting by gating samples rather than detaching the track
//! - Capture backends and the synthetic one used by the demo and tests
//! - Listen-only fallback when no microphone is available

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;
use crate::types::{TrackId, TrackKind, TrackSource};

/// One Opus frame of silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Local media track shared by every connection it is attached to
#[derive(Clone)]
pub struct LocalTrack {
    id: TrackId,
    kind: TrackKind,
    source: TrackSource,
    enabled: Arc<AtomicBool>,
    rtp_track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    #[must_use]
    pub fn new(id: TrackId, source: TrackSource, stream_id: &str) -> Self {
        let (kind, capability) = match source {
            TrackSource::Microphone => (
                TrackKind::Audio,
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
            ),
            TrackSource::Screen => (
                TrackKind::Video,
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            ),
        };

        let rtp_track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.to_string(),
            stream_id.to_string(),
        ));

        Self {
            id,
            kind,
            source,
            enabled: Arc::new(AtomicBool::new(true)),
            rtp_track,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub const fn source(&self) -> TrackSource {
        self.source
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp_track)
    }

    /// Write one media sample to every bound connection.
    ///
    /// Returns `false` when the track is disabled and the sample was dropped.
    pub async fn write_sample(&self, sample: &Sample) -> webrtc::error::Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.rtp_track.write_sample(sample).await?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// An active screen capture
pub struct ScreenCapture {
    pub track: LocalTrack,
    /// Resolves when the capture is ended outside the application
    /// (the platform's own "stop sharing" control)
    pub ended: oneshot::Receiver<()>,
}

/// Source of local capture devices
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_microphone(&self, stream_id: &str) -> Result<LocalTrack, MediaError>;

    async fn open_screen(&self, stream_id: &str) -> Result<ScreenCapture, MediaError>;

    /// Stop the device behind `track`
    fn release(&self, track: &LocalTrack);
}

struct ActiveCapture {
    source: TrackSource,
    pump: CancellationToken,
    ended: Option<oneshot::Sender<()>>,
}

/// Capture backend that fabricates devices
///
/// Availability of each device is fixed at construction; with sample
/// generation on, microphones emit Opus silence every 20ms.
pub struct SyntheticCapture {
    microphone_available: bool,
    screen_permitted: bool,
    generate_samples: bool,
    active: DashMap<TrackId, ActiveCapture>,
}

impl SyntheticCapture {
    #[must_use]
    pub fn new(microphone_available: bool, screen_permitted: bool) -> Self {
        Self {
            microphone_available,
            screen_permitted,
            generate_samples: false,
            active: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn with_sample_generation(mut self, enabled: bool) -> Self {
        self.generate_samples = enabled;
        self
    }

    /// Number of devices currently held open
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Simulate the user ending a screen share from the platform UI
    pub fn end_screen_share(&self) -> bool {
        let mut ended = false;
        for mut entry in self.active.iter_mut() {
            if entry.source == TrackSource::Screen {
                if let Some(tx) = entry.ended.take() {
                    ended |= tx.send(()).is_ok();
                }
            }
        }
        ended
    }

    fn spawn_silence(&self, track: &LocalTrack) -> CancellationToken {
        let token = CancellationToken::new();
        if !self.generate_samples {
            return token;
        }

        let cancel = token.clone();
        let track = track.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OPUS_FRAME);
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: OPUS_FRAME,
                ..Default::default()
            };
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = track.write_sample(&sample).await {
                            trace!(track_id = %track.id(), error = %e, "Dropped synthetic sample");
                        }
                    }
                }
            }
            debug!(track_id = %track.id(), "Synthetic sample generator stopped");
        });
        token
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn open_microphone(&self, stream_id: &str) -> Result<LocalTrack, MediaError> {
        if !self.microphone_available {
            return Err(MediaError::NoDevice("no microphone attached".to_string()));
        }

        let id = TrackId::new(format!("mic-{}", nanoid::nanoid!(10)));
        let track = LocalTrack::new(id.clone(), TrackSource::Microphone, stream_id);
        let pump = self.spawn_silence(&track);
        self.active.insert(
            id,
            ActiveCapture {
                source: TrackSource::Microphone,
                pump,
                ended: None,
            },
        );
        Ok(track)
    }

    async fn open_screen(&self, stream_id: &str) -> Result<ScreenCapture, MediaError> {
        if !self.screen_permitted {
            return Err(MediaError::PermissionDenied(
                "screen capture was not granted".to_string(),
            ));
        }

        let id = TrackId::new(format!("screen-{}", nanoid::nanoid!(10)));
        let track = LocalTrack::new(id.clone(), TrackSource::Screen, stream_id);
        let (ended_tx, ended_rx) = oneshot::channel();
        self.active.insert(
            id,
            ActiveCapture {
                source: TrackSource::Screen,
                pump: CancellationToken::new(),
                ended: Some(ended_tx),
            },
        );
        Ok(ScreenCapture {
            track,
            ended: ended_rx,
        })
    }

    fn release(&self, track: &LocalTrack) {
        if let Some((_, capture)) = self.active.remove(track.id()) {
            capture.pump.cancel();
            debug!(track_id = %track.id(), source = ?capture.source, "Released capture device");
        }
    }
}

/// The participant's own capture state
///
/// Owns at most one microphone track and one screen track. Attaching them
/// to connections is the coordinator's job; this type only tracks what is
/// being captured.
pub struct LocalMediaSource {
    stream_id: String,
    backend: Arc<dyn CaptureBackend>,
    microphone: Option<LocalTrack>,
    screen: Option<LocalTrack>,
    muted: bool,
}

impl LocalMediaSource {
    pub fn new(stream_id: impl Into<String>, backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            stream_id: stream_id.into(),
            backend,
            microphone: None,
            screen: None,
            muted: false,
        }
    }

    /// Open the microphone. On failure the source stays listen-only.
    pub async fn acquire_microphone(&mut self) -> Result<(), MediaError> {
        if self.microphone.is_some() {
            return Ok(());
        }
        let track = self.backend.open_microphone(&self.stream_id).await?;
        track.set_enabled(!self.muted);
        info!(track_id = %track.id(), "Microphone acquired");
        self.microphone = Some(track);
        Ok(())
    }

    #[must_use]
    pub const fn is_listen_only(&self) -> bool {
        self.microphone.is_none()
    }

    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Gate outgoing audio; attached connections are left untouched
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(track) = &self.microphone {
            track.set_enabled(!muted);
        }
    }

    #[must_use]
    pub const fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    #[must_use]
    pub fn screen_track_id(&self) -> Option<&TrackId> {
        self.screen.as_ref().map(LocalTrack::id)
    }

    /// Begin a screen capture. Returns the new track and its external-end signal.
    pub async fn start_screen_share(
        &mut self,
    ) -> Result<(LocalTrack, oneshot::Receiver<()>), MediaError> {
        if self.screen.is_some() {
            return Err(MediaError::AlreadyActive);
        }
        let capture = self.backend.open_screen(&self.stream_id).await?;
        info!(track_id = %capture.track.id(), "Screen capture started");
        self.screen = Some(capture.track.clone());
        Ok((capture.track, capture.ended))
    }

    /// Stop the screen capture, returning the track that must be detached
    pub fn stop_screen_share(&mut self) -> Option<LocalTrack> {
        let track = self.screen.take()?;
        self.backend.release(&track);
        info!(track_id = %track.id(), "Screen capture stopped");
        Some(track)
    }

    /// Everything that should be attached to a new connection
    #[must_use]
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.microphone
            .iter()
            .chain(self.screen.iter())
            .cloned()
            .collect()
    }

    pub fn stop_all(&mut self) {
        self.stop_screen_share();
        if let Some(track) = self.microphone.take() {
            self.backend.release(&track);
        }
    }
}

impl Drop for LocalMediaSource {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(backend: &Arc<SyntheticCapture>) -> LocalMediaSource {
        LocalMediaSource::new("alice", Arc::clone(backend) as Arc<dyn CaptureBackend>)
    }

    fn silence() -> Sample {
        Sample {
            data: Bytes::from_static(&OPUS_SILENCE),
            duration: OPUS_FRAME,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_muted_track_drops_samples() {
        let track = LocalTrack::new(TrackId::from("mic-1"), TrackSource::Microphone, "alice");
        assert_eq!(track.kind(), TrackKind::Audio);

        assert!(track.write_sample(&silence()).await.unwrap());

        track.set_enabled(false);
        assert!(!track.write_sample(&silence()).await.unwrap());
    }

    #[tokio::test]
    async fn test_mute_applies_to_microphone() {
        let backend = Arc::new(SyntheticCapture::default());
        let mut media = source(&backend);

        // Muting before the device opens still takes effect
        media.set_muted(true);
        media.acquire_microphone().await.unwrap();

        let tracks = media.tracks();
        assert_eq!(tracks.len(), 1);
        assert!(!tracks[0].is_enabled());

        media.set_muted(false);
        assert!(tracks[0].is_enabled());
        assert!(!media.is_muted());
    }

    #[tokio::test]
    async fn test_missing_microphone_is_listen_only() {
        let backend = Arc::new(SyntheticCapture::new(false, true));
        let mut media = source(&backend);

        let err = media.acquire_microphone().await.unwrap_err();
        assert!(matches!(err, MediaError::NoDevice(_)));
        assert!(media.is_listen_only());
        assert!(media.tracks().is_empty());
    }

    #[tokio::test]
    async fn test_screen_share_lifecycle() {
        let backend = Arc::new(SyntheticCapture::default());
        let mut media = source(&backend);
        media.acquire_microphone().await.unwrap();

        let (track, _ended) = media.start_screen_share().await.unwrap();
        assert_eq!(track.kind(), TrackKind::Video);
        assert_eq!(media.screen_track_id(), Some(track.id()));
        assert_eq!(media.tracks().len(), 2);
        assert_eq!(backend.active_count(), 2);

        let Err(err) = media.start_screen_share().await else {
            panic!("second screen share was started");
        };
        assert_eq!(err, MediaError::AlreadyActive);

        let stopped = media.stop_screen_share().unwrap();
        assert_eq!(stopped.id(), track.id());
        assert!(media.stop_screen_share().is_none());
        assert_eq!(backend.active_count(), 1);
    }

    #[tokio::test]
    async fn test_screen_permission_denied() {
        let backend = Arc::new(SyntheticCapture::new(true, false));
        let mut media = source(&backend);

        let Err(err) = media.start_screen_share().await else {
            panic!("screen share started without permission");
        };
        assert!(matches!(err, MediaError::PermissionDenied(_)));
        assert!(!media.is_sharing_screen());
    }

    #[tokio::test]
    async fn test_external_end_signal() {
        let backend = Arc::new(SyntheticCapture::default());
        let mut media = source(&backend);

        let (_track, ended) = media.start_screen_share().await.unwrap();
        assert!(backend.end_screen_share());
        assert!(ended.await.is_ok());
    }

    #[tokio::test]
    async fn test_release_does_not_signal_external_end() {
        let backend = Arc::new(SyntheticCapture::default());
        let mut media = source(&backend);

        let (_track, ended) = media.start_screen_share().await.unwrap();
        media.stop_screen_share();
        assert!(ended.await.is_err());
    }

    #[tokio::test]
    async fn test_drop_releases_devices() {
        let backend = Arc::new(SyntheticCapture::default());
        {
            let mut media = source(&backend);
            media.acquire_microphone().await.unwrap();
            media.start_screen_share().await.unwrap();
            assert_eq!(backend.active_count(), 2);
        }
        assert_eq!(backend.active_count(), 0);
    }
}
