use thiserror::Error;

use crate::signal::ParticipantId;

/// Failures reported by a platform connection object.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to create peer connection: {0}")]
    Create(String),
    #[error("failed to {op}: {reason}")]
    Operation { op: &'static str, reason: String },
    #[error("description rejected in signaling state {state}: {reason}")]
    InvalidState { state: String, reason: String },
    #[error("connection is closed")]
    Closed,
}

impl ConnectionError {
    pub fn op(op: &'static str, reason: impl ToString) -> Self {
        Self::Operation {
            op,
            reason: reason.to_string(),
        }
    }
}

/// Failures of the signal relay or roster transport.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error("relay channel closed")]
    Closed,
    #[error("relay rejected request: {0}")]
    Rejected(String),
    #[error("relay protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Local capture failures. Capability denial is recoverable: the session
/// continues in a reduced mode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(&'static str),
    #[error("no {0} device available")]
    DeviceUnavailable(&'static str),
    #[error("screen share was rejected")]
    ScreenShareRejected,
    #[error("screen share is not active")]
    NotSharing,
    #[error("media engine is not running")]
    EngineStopped,
}

/// Errors raised while negotiating with a single remote participant.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("connection error with {peer}: {source}")]
    Connection {
        peer: ParticipantId,
        #[source]
        source: ConnectionError,
    },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("malformed {kind} payload from {peer}: {source}")]
    Payload {
        peer: ParticipantId,
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("answer from {0} could not be applied after rollback")]
    Unrecoverable(ParticipantId),
}

impl NegotiationError {
    pub fn connection(peer: &ParticipantId, source: ConnectionError) -> Self {
        Self::Connection {
            peer: peer.clone(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
