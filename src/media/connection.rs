use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{Track, TrackKind};
use crate::error::ConnectionError;
use crate::signal::{IceCandidate, ParticipantId, SessionDescription};

/// Generation of a link. A participant id can get a new link after a
/// teardown; events from the old connection carry the old id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the link is torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Events emitted by connection objects back to the engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Local ICE candidate gathered; must reach the remote peer.
    IceCandidate {
        peer_id: ParticipantId,
        link_id: LinkId,
        candidate: IceCandidate,
    },
    RemoteTrack {
        peer_id: ParticipantId,
        link_id: LinkId,
        kind: TrackKind,
    },
    ConnectionStateChanged {
        peer_id: ParticipantId,
        link_id: LinkId,
        state: ConnectionState,
    },
    SignalingStateChanged {
        peer_id: ParticipantId,
        link_id: LinkId,
        state: SignalingState,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &ParticipantId {
        match self {
            PeerEvent::IceCandidate { peer_id, .. }
            | PeerEvent::RemoteTrack { peer_id, .. }
            | PeerEvent::ConnectionStateChanged { peer_id, .. }
            | PeerEvent::SignalingStateChanged { peer_id, .. } => peer_id,
        }
    }

    pub fn link_id(&self) -> LinkId {
        match self {
            PeerEvent::IceCandidate { link_id, .. }
            | PeerEvent::RemoteTrack { link_id, .. }
            | PeerEvent::ConnectionStateChanged { link_id, .. }
            | PeerEvent::SignalingStateChanged { link_id, .. } => *link_id,
        }
    }
}

/// Where a connection reports its events. Bound to one peer and one link.
#[derive(Clone)]
pub struct PeerEventSink {
    peer_id: ParticipantId,
    link_id: LinkId,
    tx: mpsc::Sender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(peer_id: ParticipantId, link_id: LinkId, tx: mpsc::Sender<PeerEvent>) -> Self {
        Self { peer_id, link_id, tx }
    }

    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub async fn ice_candidate(&self, candidate: IceCandidate) {
        let _ = self
            .tx
            .send(PeerEvent::IceCandidate {
                peer_id: self.peer_id.clone(),
                link_id: self.link_id,
                candidate,
            })
            .await;
    }

    pub async fn remote_track(&self, kind: TrackKind) {
        let _ = self
            .tx
            .send(PeerEvent::RemoteTrack {
                peer_id: self.peer_id.clone(),
                link_id: self.link_id,
                kind,
            })
            .await;
    }

    pub async fn connection_state(&self, state: ConnectionState) {
        let _ = self
            .tx
            .send(PeerEvent::ConnectionStateChanged {
                peer_id: self.peer_id.clone(),
                link_id: self.link_id,
                state,
            })
            .await;
    }

    pub async fn signaling_state(&self, state: SignalingState) {
        let _ = self
            .tx
            .send(PeerEvent::SignalingStateChanged {
                peer_id: self.peer_id.clone(),
                link_id: self.link_id,
                state,
            })
            .await;
    }
}

/// Capability surface the engine needs from a platform connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &Track) -> Result<(), ConnectionError>;

    /// Swap the track on the existing sender of `kind` without
    /// renegotiating; `None` leaves the sender idle. `Ok(false)` when there
    /// is no sender of that kind.
    async fn replace_track(&self, kind: TrackKind, track: Option<&Track>) -> Result<bool, ConnectionError>;

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ConnectionError>;

    /// Revert an in-progress local offer back to `Stable`.
    async fn rollback(&self) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Builds connection objects wired to an event sink.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}
