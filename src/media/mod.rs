pub mod connection;
pub mod engine;
pub mod loopback;
pub mod peer;
pub mod rtc;
pub mod source;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{ConnectionError, MediaError};
use crate::signal::ParticipantId;

use self::peer::NegotiationState;

/// Stream id shared by every outgoing track so remote sides group them.
const LOCAL_STREAM_ID: &str = "meshlink";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

struct TrackInner {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    local: Arc<TrackLocalStaticSample>,
    ended: watch::Sender<bool>,
}

/// An outgoing capture track. Clones share the same underlying track, so
/// flipping `enabled` is seen by every connection transmitting it.
#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackInner>,
}

impl Track {
    pub fn new(source: TrackSource) -> Self {
        let id = format!("{:?}-{}", source, uuid::Uuid::new_v4()).to_lowercase();
        let codec = match source.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
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
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id,
                source,
                enabled: AtomicBool::new(true),
                local,
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    /// The webrtc-rs track bound to every sender transmitting this track.
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.local.clone()
    }

    /// Push one encoded frame. Frames written while disabled or stopped are
    /// dropped, which is what muting means on the wire.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), ConnectionError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.inner
            .local
            .write_sample(sample)
            .await
            .map_err(|e| ConnectionError::op("write sample", e))
    }

    /// Stop the capture. Returns false when it was already stopped.
    pub fn stop(&self) -> bool {
        self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track is stopped, by us or by the platform.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn same_as(&self, other: &Track) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The tracks every new link starts transmitting.
#[derive(Debug, Clone, Default)]
pub struct OutgoingTracks {
    pub audio: Option<Track>,
    pub video: Option<Track>,
}

impl OutgoingTracks {
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.audio.iter().chain(self.video.iter())
    }
}

/// Commands sent to a running engine.
#[derive(Debug)]
pub enum EngineCommand {
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    StartScreenShare {
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    StopScreenShare,
    /// Manual retry: initiate to `peer_id` regardless of the id ordering,
    /// unless a live link already exists.
    Connect { peer_id: ParticipantId },
    Leave,
}

/// One row of the session snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub peer_id: ParticipantId,
    pub state: NegotiationState,
    pub connected: bool,
}

/// Snapshot published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub local_id: Option<ParticipantId>,
    pub joined: bool,
    pub links: Vec<LinkSummary>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl SessionState {
    pub fn stable_links(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.state == NegotiationState::Stable)
            .count()
    }
}

/// Handle for sending commands to the engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    pub command_tx: mpsc::Sender<EngineCommand>,
    pub state_rx: watch::Receiver<SessionState>,
}

impl EngineHandle {
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.send(EngineCommand::SetAudioEnabled(enabled)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.send(EngineCommand::SetVideoEnabled(enabled)).await
    }

    pub async fn start_screen_share(&self) -> Result<(), MediaError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::StartScreenShare { reply }).await?;
        rx.await.map_err(|_| MediaError::EngineStopped)?
    }

    pub async fn stop_screen_share(&self) -> Result<(), MediaError> {
        self.send(EngineCommand::StopScreenShare).await
    }

    pub async fn connect(&self, peer_id: ParticipantId) -> Result<(), MediaError> {
        self.send(EngineCommand::Connect { peer_id }).await
    }

    pub async fn leave(&self) -> Result<(), MediaError> {
        self.send(EngineCommand::Leave).await
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    async fn send(&self, cmd: EngineCommand) -> Result<(), MediaError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| MediaError::EngineStopped)
    }
}
