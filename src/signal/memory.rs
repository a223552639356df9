use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{OutboundSignal, SignalEnvelope, SignalRelay};
use crate::error::RelayError;

#[derive(Default)]
struct RelayLog {
    history: Vec<SignalEnvelope>,
    last_sequence: u64,
    subscribers: Vec<mpsc::UnboundedSender<SignalEnvelope>>,
}

impl RelayLog {
    fn append(&mut self, envelope: SignalEnvelope) {
        self.last_sequence = self.last_sequence.max(envelope.sequence);
        // Drop subscribers whose receiver is gone
        self.subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
        self.history.push(envelope);
    }
}

/// In-process relay for one room. Keeps the full envelope log so late
/// subscribers get a replay. Used directly by tests and the loopback mode,
/// and per room by the relay server.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    log: Arc<Mutex<RelayLog>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope that was sequenced elsewhere (the relay client
    /// mirrors the server stream this way). Redelivered sequences are
    /// dropped.
    pub async fn ingest(&self, envelope: SignalEnvelope) {
        let mut log = self.log.lock().await;
        if envelope.sequence <= log.last_sequence {
            debug!("Relay mirror skipping redelivered sequence {}", envelope.sequence);
            return;
        }
        log.append(envelope);
    }

    /// Snapshot of the whole log.
    pub async fn history(&self) -> Vec<SignalEnvelope> {
        self.log.lock().await.history.clone()
    }
}

#[async_trait]
impl SignalRelay for MemoryRelay {
    async fn publish(&self, signal: OutboundSignal) -> Result<u64, RelayError> {
        let mut log = self.log.lock().await;
        let sequence = log.last_sequence + 1;
        let envelope = SignalEnvelope {
            from: signal.from,
            to: signal.to,
            kind: signal.kind,
            payload: signal.payload,
            sequence,
            created_at: Utc::now(),
        };
        debug!(
            "Relay #{}: {} {} -> {}",
            sequence,
            envelope.kind.as_str(),
            envelope.from,
            envelope.to.as_ref().map(|t| t.as_str()).unwrap_or("*")
        );
        log.append(envelope);
        Ok(sequence)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Replay and registration happen under one lock so nothing slips
        // between the two.
        let mut log = self.log.lock().await;
        for envelope in &log.history {
            tx.send(envelope.clone()).map_err(|_| RelayError::Closed)?;
        }
        log.subscribers.push(tx);
        Ok(rx)
    }
}
