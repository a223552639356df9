//! webrtc-rs binding of the connection capability surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use super::connection::{
    ConnectionFactory, ConnectionState, PeerConnection, PeerEventSink, SignalingState,
};
use super::{Track, TrackKind};
use crate::config::EngineConfig;
use crate::error::ConnectionError;
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
    }
}

fn map_codec_type(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| ConnectionError::op("parse SDP", e))
}

/// Creates one `RTCPeerConnection` per remote participant.
pub struct RtcConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnectionFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ice_servers: config.rtc_ice_servers(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ConnectionError::Create(format!("failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| ConnectionError::Create(format!("failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| ConnectionError::Create(e.to_string()))?,
        );

        // Connection state change
        let sink_state = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink_state.clone();
            Box::pin(async move {
                info!("WebRTC connection to {} state: {}", sink.peer_id(), state);
                sink.connection_state(map_connection_state(state)).await;
            })
        }));

        // Signaling state change
        let sink_signaling = events.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let sink = sink_signaling.clone();
            Box::pin(async move {
                debug!("Signaling state with {}: {}", sink.peer_id(), state);
                sink.signaling_state(map_signaling_state(state)).await;
            })
        }));

        // Remote tracks
        let sink_track = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink_track.clone();
            Box::pin(async move {
                let Some(kind) = map_codec_type(track.kind()) else {
                    return;
                };
                info!("Received remote {:?} track from {}", kind, sink.peer_id());
                sink.remote_track(kind).await;
                // Drain RTP so the interceptors keep running
                let peer = sink.peer_id().clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while track.read(&mut buf).await.is_ok() {}
                    debug!("Remote {:?} track from {} ended", kind, peer);
                });
            })
        }));

        // ICE candidate gathering
        let sink_ice = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.ice_candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })
                        .await;
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        info!("Created WebRTC peer connection for {}", events.peer_id());
        Ok(Arc::new(RtcConnection {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    /// Outgoing sender per kind, so a cleared sender can be refilled.
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_track(&self, track: &Track) -> Result<(), ConnectionError> {
        let rtp_sender = self
            .pc
            .add_track(track.rtc_track())
            .await
            .map_err(|e| ConnectionError::op("add track", e))?;

        self.senders
            .lock()
            .await
            .insert(track.kind(), rtp_sender.clone());

        // Read incoming RTCP packets (needed by webrtc crate for proper operation)
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<&Track>) -> Result<bool, ConnectionError> {
        let Some(sender) = self.senders.lock().await.get(&kind).cloned() else {
            return Ok(false);
        };
        sender
            .replace_track(track.map(Track::rtc_track))
            .await
            .map_err(|e| ConnectionError::op("replace track", e))?;
        Ok(true)
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| ConnectionError::op("create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ConnectionError::op("create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| ConnectionError::op("set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let desc = to_rtc_description(desc)?;
        let state = self.pc.signaling_state();
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| ConnectionError::InvalidState {
                state: state.to_string(),
                reason: e.to_string(),
            })
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| ConnectionError::op("roll back local offer", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| ConnectionError::op("add ICE candidate", e))
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc
            .close()
            .await
            .map_err(|e| ConnectionError::op("close peer connection", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_map_through() {
        for state in [
            RTCPeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed,
            RTCPeerConnectionState::Closed,
        ] {
            assert!(map_connection_state(state).is_terminal());
        }
        assert!(!map_connection_state(RTCPeerConnectionState::Connected).is_terminal());
    }

    #[test]
    fn pranswer_counts_as_offer_side() {
        assert_eq!(
            map_signaling_state(RTCSignalingState::HaveLocalPranswer),
            SignalingState::HaveLocalOffer
        );
        assert_eq!(
            map_signaling_state(RTCSignalingState::Unspecified),
            SignalingState::Stable
        );
    }
}
