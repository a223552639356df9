pub mod memory;
pub mod wire;
pub mod ws;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RelayError;

pub use memory::MemoryRelay;
pub use ws::WsRelayClient;

/// Identifier of one connection attempt by one participant. A user that
/// reconnects gets a fresh id. Ordering is plain lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for `user`: `"{user}-{unix_millis}"`.
    pub fn generate(user: &str) -> Self {
        Self(format!("{}-{}", user, Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic initiator rule: the greater id creates the offer.
    pub fn initiates_to(&self, remote: &ParticipantId) -> bool {
        self > remote
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Announce,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Announce => "announce",
        }
    }
}

/// A sequenced message on a room's relay stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: ParticipantId,
    /// `None` is a broadcast to the whole room.
    pub to: Option<ParticipantId>,
    pub kind: SignalKind,
    pub payload: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl SignalEnvelope {
    /// Whether `local` should process this envelope: never its own, and
    /// never one addressed to somebody else.
    pub fn is_for(&self, local: &ParticipantId) -> bool {
        if &self.from == local {
            return false;
        }
        match &self.to {
            Some(to) => to == local,
            None => true,
        }
    }
}

/// An envelope before the relay has sequenced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSignal {
    pub from: ParticipantId,
    pub to: Option<ParticipantId>,
    pub kind: SignalKind,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate payload, field-compatible with `RTCIceCandidateInit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Presence announcement payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub audio: bool,
    pub video: bool,
}

/// Room-scoped publish/subscribe channel for setup metadata.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Append a signal to the room stream. Returns the assigned sequence.
    async fn publish(&self, signal: OutboundSignal) -> Result<u64, RelayError>;

    /// Replay every envelope published so far, then stream new ones.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, RelayError>;
}
