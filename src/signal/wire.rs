//! JSON frames exchanged between the relay server and `WsRelayClient`.

use serde::{Deserialize, Serialize};

use super::{ParticipantId, SignalEnvelope, SignalKind};

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Publish {
        request_id: String,
        to: Option<ParticipantId>,
        kind: SignalKind,
        payload: String,
    },
    /// Remove a participant from the room. Removing yourself is a leave,
    /// removing someone else is a kick.
    Remove { participant_id: ParticipantId },
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every socket: roster snapshot taken at join time.
    Welcome {
        participant_id: ParticipantId,
        participants: Vec<ParticipantId>,
    },
    Envelope(SignalEnvelope),
    Published {
        request_id: String,
        sequence: u64,
    },
    ParticipantAdded { participant_id: ParticipantId },
    ParticipantRemoved { participant_id: ParticipantId },
    Error {
        request_id: Option<String>,
        message: String,
    },
}
