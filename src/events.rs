use serde::Serialize;
use tokio::sync::broadcast;

use crate::media::TrackKind;
use crate::signal::ParticipantId;

/// Session events for whatever sits on top of the engine (CLI, UI bridge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    Joined { local_id: ParticipantId },
    PeerConnected { peer_id: ParticipantId },
    /// Covers normal departure, network failure and abandoned negotiation.
    PeerDisconnected { peer_id: ParticipantId },
    RemoteTrack { peer_id: ParticipantId, kind: TrackKind },
    ScreenShareEnded,
    /// A capture capability was refused; the session carries on without it.
    CaptureDenied { reason: String },
    /// Our own roster entry was removed (kicked).
    Evicted,
    Left,
}

pub type EventSender = broadcast::Sender<EngineEvent>;
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
