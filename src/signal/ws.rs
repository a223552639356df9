use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::wire::{ClientMessage, ServerMessage};
use super::{MemoryRelay, OutboundSignal, ParticipantId, SignalEnvelope, SignalRelay};
use crate::error::RelayError;
use crate::roster::{MemoryRoster, Roster, RosterEvent};

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Result<u64, RelayError>>>>>;

/// Relay and roster over one WebSocket to a `meshlink relay` server.
///
/// Server frames are mirrored into a local `MemoryRelay`/`MemoryRoster`, so
/// subscribing after connect still sees the full replay.
pub struct WsRelayClient {
    local_id: ParticipantId,
    outbound: mpsc::Sender<ClientMessage>,
    pending: PendingAcks,
    mirror: MemoryRelay,
    roster: MemoryRoster,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsRelayClient {
    /// Connect to `base_url` (e.g. `ws://127.0.0.1:9850`) and join `room_id`
    /// as `participant`. Returns once the server's roster snapshot arrived.
    pub async fn connect(
        base_url: &str,
        room_id: &str,
        participant: &ParticipantId,
    ) -> Result<Self, RelayError> {
        let url = format!(
            "{}/rooms/{}/ws?participant={}",
            base_url.trim_end_matches('/'),
            room_id,
            participant
        );
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Connect(format!("{}: {}", url, e)))?;
        let (mut sink, mut stream) = socket.split();

        let mirror = MemoryRelay::new();
        let roster = MemoryRoster::new();

        // The welcome frame always comes first
        let participants = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Welcome { participants, .. } => break participants,
                    other => debug!("Ignoring frame before welcome: {:?}", other),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RelayError::Connect(e.to_string())),
                None => return Err(RelayError::Closed),
            }
        };
        info!("Joined room {} with {} participant(s) present", room_id, participants.len());
        roster.reset(participants).await;

        let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(256);
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize relay frame: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_mirror = mirror.clone();
        let reader_roster = roster.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay socket error: {}", e);
                        break;
                    }
                };
                let msg = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Malformed relay frame: {}", e);
                        continue;
                    }
                };
                match msg {
                    ServerMessage::Envelope(envelope) => reader_mirror.ingest(envelope).await,
                    ServerMessage::Published { request_id, sequence } => {
                        if let Some(tx) = reader_pending.lock().await.remove(&request_id) {
                            let _ = tx.send(Ok(sequence));
                        }
                    }
                    ServerMessage::Error { request_id, message } => {
                        warn!("Relay error: {}", message);
                        if let Some(id) = request_id {
                            if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                let _ = tx.send(Err(RelayError::Rejected(message)));
                            }
                        }
                    }
                    ServerMessage::ParticipantAdded { participant_id } => {
                        reader_roster.join(participant_id).await;
                    }
                    ServerMessage::ParticipantRemoved { participant_id } => {
                        reader_roster.remove(&participant_id).await;
                    }
                    ServerMessage::Welcome { .. } => debug!("Duplicate welcome frame ignored"),
                }
            }
            info!("Relay connection closed");
            for (_, tx) in reader_pending.lock().await.drain() {
                let _ = tx.send(Err(RelayError::Closed));
            }
        });

        Ok(Self {
            local_id: participant.clone(),
            outbound,
            pending,
            mirror,
            roster,
            reader,
            writer,
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Ask the server to remove another participant from the room.
    pub async fn kick(&self, participant: &ParticipantId) -> Result<(), RelayError> {
        self.outbound
            .send(ClientMessage::Remove {
                participant_id: participant.clone(),
            })
            .await
            .map_err(|_| RelayError::Closed)
    }
}

impl Drop for WsRelayClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl SignalRelay for WsRelayClient {
    async fn publish(&self, signal: OutboundSignal) -> Result<u64, RelayError> {
        if signal.from != self.local_id {
            return Err(RelayError::Rejected(format!(
                "cannot publish as {} on a socket joined as {}",
                signal.from, self.local_id
            )));
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        let msg = ClientMessage::Publish {
            request_id: request_id.clone(),
            to: signal.to,
            kind: signal.kind,
            payload: signal.payload,
        };
        if self.outbound.send(msg).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(RelayError::Closed);
        }
        rx.await.map_err(|_| RelayError::Closed)?
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>, RelayError> {
        self.mirror.subscribe().await
    }
}

#[async_trait]
impl Roster for WsRelayClient {
    async fn list(&self) -> Result<Vec<ParticipantId>, RelayError> {
        self.roster.list().await
    }

    async fn watch(&self) -> Result<mpsc::UnboundedReceiver<RosterEvent>, RelayError> {
        self.roster.watch().await
    }

    async fn leave(&self, participant: &ParticipantId) -> Result<(), RelayError> {
        self.kick(participant).await
    }
}
