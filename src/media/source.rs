use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{OutgoingTracks, Track, TrackSource};
use crate::error::MediaError;

/// Result of asking for camera and microphone together. Either half may
/// fail on its own.
#[derive(Debug)]
pub struct CapturedMedia {
    pub audio: Result<Track, MediaError>,
    pub video: Result<Track, MediaError>,
}

/// Access to local capture devices.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn acquire_camera_and_mic(&self, want_audio: bool, want_video: bool) -> CapturedMedia;

    /// Ask the platform for a screen capture. The user may refuse.
    async fn acquire_screen(&self) -> Result<Track, MediaError>;
}

/// Device-free capture: hands out tracks that carry whatever the caller
/// writes into them. Denial switches simulate refused permissions.
#[derive(Default)]
pub struct SyntheticCapture {
    deny_microphone: AtomicBool,
    deny_camera: AtomicBool,
    deny_screen: AtomicBool,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_microphone(self, deny: bool) -> Self {
        self.deny_microphone.store(deny, Ordering::Relaxed);
        self
    }

    pub fn deny_camera(self, deny: bool) -> Self {
        self.deny_camera.store(deny, Ordering::Relaxed);
        self
    }

    pub fn deny_screen(self, deny: bool) -> Self {
        self.deny_screen.store(deny, Ordering::Relaxed);
        self
    }
}

#[async_trait]
impl CaptureDevices for SyntheticCapture {
    async fn acquire_camera_and_mic(&self, want_audio: bool, want_video: bool) -> CapturedMedia {
        let audio = if !want_audio {
            Err(MediaError::DeviceUnavailable("microphone"))
        } else if self.deny_microphone.load(Ordering::Relaxed) {
            Err(MediaError::PermissionDenied("microphone"))
        } else {
            Ok(Track::new(TrackSource::Microphone))
        };
        let video = if !want_video {
            Err(MediaError::DeviceUnavailable("camera"))
        } else if self.deny_camera.load(Ordering::Relaxed) {
            Err(MediaError::PermissionDenied("camera"))
        } else {
            Ok(Track::new(TrackSource::Camera))
        };
        CapturedMedia { audio, video }
    }

    async fn acquire_screen(&self) -> Result<Track, MediaError> {
        if self.deny_screen.load(Ordering::Relaxed) {
            return Err(MediaError::ScreenShareRejected);
        }
        Ok(Track::new(TrackSource::Screen))
    }
}

/// Owns the local outgoing tracks. Links share these track objects, so
/// enabling or disabling one is visible everywhere at once.
pub struct MediaTrackSource {
    capture: Arc<dyn CaptureDevices>,
    audio: Option<Track>,
    camera: Option<Track>,
    screen: Option<Track>,
}

impl MediaTrackSource {
    pub fn new(capture: Arc<dyn CaptureDevices>) -> Self {
        Self {
            capture,
            audio: None,
            camera: None,
            screen: None,
        }
    }

    /// Acquire camera and microphone. Whatever is refused is returned; the
    /// session continues with what was granted (possibly receive-only).
    pub async fn acquire(&mut self, want_audio: bool, want_video: bool) -> Vec<MediaError> {
        let captured = self
            .capture
            .acquire_camera_and_mic(want_audio, want_video)
            .await;
        let mut denied = Vec::new();
        match captured.audio {
            Ok(track) => self.audio = Some(track),
            Err(e) => {
                if want_audio {
                    warn!("Microphone unavailable: {}. Continuing without audio.", e);
                    denied.push(e);
                }
            }
        }
        match captured.video {
            Ok(track) => self.camera = Some(track),
            Err(e) => {
                if want_video {
                    warn!("Camera unavailable: {}. Continuing without video.", e);
                    denied.push(e);
                }
            }
        }
        info!(
            "Local media ready: audio={} video={}",
            self.audio.is_some(),
            self.camera.is_some()
        );
        denied
    }

    /// The tracks to transmit right now. Video is the screen while sharing,
    /// the camera otherwise.
    pub fn current_tracks(&self) -> OutgoingTracks {
        OutgoingTracks {
            audio: self.audio.clone(),
            video: self.screen.clone().or_else(|| self.camera.clone()),
        }
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(track) = &self.audio {
            track.set_enabled(enabled);
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(track) = &self.camera {
            track.set_enabled(enabled);
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio.as_ref().map(Track::is_enabled).unwrap_or(false)
    }

    pub fn video_enabled(&self) -> bool {
        self.camera.as_ref().map(Track::is_enabled).unwrap_or(false)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn screen_track(&self) -> Option<&Track> {
        self.screen.as_ref()
    }

    /// Start capturing the screen. The caller must push the returned track
    /// to every link via `PeerLinkRegistry::replace_outgoing_video`.
    pub async fn start_screen_share(&mut self) -> Result<Track, MediaError> {
        if let Some(track) = &self.screen {
            return Ok(track.clone());
        }
        let track = self.capture.acquire_screen().await?;
        info!("Screen sharing started");
        self.screen = Some(track.clone());
        Ok(track)
    }

    /// Stop the screen capture. Returns the camera track (if any) that
    /// should go back on the wire.
    pub fn stop_screen_share(&mut self) -> Result<Option<Track>, MediaError> {
        let track = self.screen.take().ok_or(MediaError::NotSharing)?;
        track.stop();
        info!("Screen sharing stopped");
        Ok(self.camera.clone())
    }

    /// Stop and drop every local track.
    pub fn stop_all(&mut self) {
        for track in [self.audio.take(), self.camera.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;

    #[tokio::test]
    async fn denied_camera_leaves_audio_only() {
        let capture = Arc::new(SyntheticCapture::new().deny_camera(true));
        let mut source = MediaTrackSource::new(capture);
        let denied = source.acquire(true, true).await;

        assert_eq!(denied, vec![MediaError::PermissionDenied("camera")]);
        let tracks = source.current_tracks();
        assert!(tracks.audio.is_some());
        assert!(tracks.video.is_none());
    }

    #[tokio::test]
    async fn unrequested_devices_are_not_denials() {
        let mut source = MediaTrackSource::new(Arc::new(SyntheticCapture::new()));
        assert!(source.acquire(true, false).await.is_empty());
        assert!(source.current_tracks().video.is_none());
    }

    #[tokio::test]
    async fn screen_replaces_camera_until_stopped() {
        let mut source = MediaTrackSource::new(Arc::new(SyntheticCapture::new()));
        source.acquire(true, true).await;
        let camera = source.current_tracks().video.unwrap();

        let screen = source.start_screen_share().await.unwrap();
        assert!(source.current_tracks().video.unwrap().same_as(&screen));
        // A second start reuses the running capture
        assert!(source.start_screen_share().await.unwrap().same_as(&screen));

        let fallback = source.stop_screen_share().unwrap().unwrap();
        assert!(fallback.same_as(&camera));
        assert!(screen.is_stopped());
        assert_eq!(source.stop_screen_share().unwrap_err(), MediaError::NotSharing);
    }

    #[tokio::test]
    async fn toggles_flip_shared_flags() {
        let mut source = MediaTrackSource::new(Arc::new(SyntheticCapture::new()));
        source.acquire(true, true).await;
        let tracks = source.current_tracks();

        source.set_audio_enabled(false);
        source.set_video_enabled(false);
        assert!(!tracks.audio.unwrap().is_enabled());
        assert!(!tracks.video.as_ref().unwrap().is_enabled());
        assert_eq!(tracks.video.unwrap().kind(), TrackKind::Video);
        assert!(!source.audio_enabled());
    }

    #[tokio::test]
    async fn rejected_screen_share_is_reported() {
        let capture = Arc::new(SyntheticCapture::new().deny_screen(true));
        let mut source = MediaTrackSource::new(capture);
        source.acquire(true, true).await;
        assert_eq!(
            source.start_screen_share().await.unwrap_err(),
            MediaError::ScreenShareRejected
        );
        assert!(!source.is_screen_sharing());
    }
}
