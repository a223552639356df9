use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::error::RelayError;
use crate::signal::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "participant_id")]
pub enum RosterEvent {
    Added(ParticipantId),
    Removed(ParticipantId),
}

/// Who is present in the room. Bookkeeping itself lives outside the engine;
/// this is only the view it needs.
#[async_trait]
pub trait Roster: Send + Sync {
    /// Snapshot of participants currently present.
    async fn list(&self) -> Result<Vec<ParticipantId>, RelayError>;

    /// Live join/leave stream starting after the moment of the call.
    async fn watch(&self) -> Result<mpsc::UnboundedReceiver<RosterEvent>, RelayError>;

    /// Remove `participant` from the room (leave or kick).
    async fn leave(&self, participant: &ParticipantId) -> Result<(), RelayError>;
}

#[derive(Default)]
struct RosterState {
    participants: Vec<ParticipantId>,
    watchers: Vec<mpsc::UnboundedSender<RosterEvent>>,
}

impl RosterState {
    fn notify(&mut self, event: RosterEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// In-process roster for one room.
#[derive(Clone, Default)]
pub struct MemoryRoster {
    state: Arc<Mutex<RosterState>>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant. Joining twice is a no-op.
    pub async fn join(&self, participant: ParticipantId) {
        let mut state = self.state.lock().await;
        if state.participants.contains(&participant) {
            return;
        }
        info!("Participant {} joined the room", participant);
        state.participants.push(participant.clone());
        state.notify(RosterEvent::Added(participant));
    }

    /// Remove a participant; returns false when it was not present.
    pub async fn remove(&self, participant: &ParticipantId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.participants.len();
        state.participants.retain(|p| p != participant);
        if state.participants.len() == before {
            return false;
        }
        info!("Participant {} left the room", participant);
        state.notify(RosterEvent::Removed(participant.clone()));
        true
    }

    /// Replace the snapshot wholesale without emitting events. Used by the
    /// relay client when the server sends its initial roster.
    pub async fn reset(&self, participants: Vec<ParticipantId>) {
        self.state.lock().await.participants = participants;
    }
}

#[async_trait]
impl Roster for MemoryRoster {
    async fn list(&self) -> Result<Vec<ParticipantId>, RelayError> {
        Ok(self.state.lock().await.participants.clone())
    }

    async fn watch(&self) -> Result<mpsc::UnboundedReceiver<RosterEvent>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.watchers.push(tx);
        Ok(rx)
    }

    async fn leave(&self, participant: &ParticipantId) -> Result<(), RelayError> {
        self.remove(participant).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_and_remove_notify_watchers() {
        let roster = MemoryRoster::new();
        roster.join("a".into()).await;
        let mut events = roster.watch().await.unwrap();

        roster.join("b".into()).await;
        roster.join("b".into()).await;
        assert!(roster.remove(&"a".into()).await);
        assert!(!roster.remove(&"a".into()).await);

        assert_eq!(events.recv().await, Some(RosterEvent::Added("b".into())));
        assert_eq!(events.recv().await, Some(RosterEvent::Removed("a".into())));
        assert!(events.try_recv().is_err());
        assert_eq!(roster.list().await.unwrap(), vec![ParticipantId::from("b")]);
    }
}
