use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as TokioMutex;
use tracing::info;

use crate::roster::MemoryRoster;
use crate::signal::MemoryRelay;

/// Signal log and roster of one room.
#[derive(Clone, Default)]
pub struct RoomState {
    pub relay: MemoryRelay,
    pub roster: MemoryRoster,
}

/// Shared by every relay route and socket.
#[derive(Clone, Default)]
pub struct RelayState {
    rooms: Arc<TokioMutex<HashMap<String, RoomState>>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Room `room_id`, created on first use.
    pub async fn room(&self, room_id: &str) -> RoomState {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!("Opened room {}", room_id);
                RoomState::default()
            })
            .clone()
    }

    /// Room `room_id` if anyone ever joined it.
    pub async fn existing_room(&self, room_id: &str) -> Option<RoomState> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
