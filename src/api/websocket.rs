use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::roster::{Roster, RosterEvent};
use crate::signal::wire::{ClientMessage, ServerMessage};
use crate::signal::{OutboundSignal, ParticipantId, SignalRelay};
use crate::state::{RelayState, RoomState};

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub participant: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(params): Query<JoinParams>,
    State(state): State<RelayState>,
) -> Response {
    let participant = match params.participant {
        Some(id) if !id.trim().is_empty() => ParticipantId::new(id),
        _ => return (StatusCode::BAD_REQUEST, "missing participant").into_response(),
    };
    let room = state.room(&room_id).await;
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, room, participant))
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize relay frame: {}", e);
            true
        }
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    room_id: String,
    room: RoomState,
    participant: ParticipantId,
) {
    // Watch before joining so no roster change slips between snapshot and stream
    let Ok(mut roster_rx) = room.roster.watch().await else {
        return;
    };
    room.roster.join(participant.clone()).await;
    let participants = room.roster.list().await.unwrap_or_default();
    info!("{} connected to room {}", participant, room_id);

    let welcome = ServerMessage::Welcome {
        participant_id: participant.clone(),
        participants,
    };
    if !send(&mut socket, &welcome).await {
        room.roster.remove(&participant).await;
        return;
    }

    let Ok(mut relay_rx) = room.relay.subscribe().await else {
        room.roster.remove(&participant).await;
        return;
    };

    loop {
        tokio::select! {
            // Replayed log first, then live envelopes
            Some(envelope) = relay_rx.recv() => {
                if envelope.to.as_ref().is_some_and(|to| *to != participant) {
                    continue;
                }
                if !send(&mut socket, &ServerMessage::Envelope(envelope)).await {
                    break;
                }
            }
            Some(event) = roster_rx.recv() => {
                let (msg, kicked) = match event {
                    RosterEvent::Added(id) => (ServerMessage::ParticipantAdded { participant_id: id }, false),
                    RosterEvent::Removed(id) => {
                        let kicked = id == participant;
                        (ServerMessage::ParticipantRemoved { participant_id: id }, kicked)
                    }
                };
                if !send(&mut socket, &msg).await || kicked {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&room, &participant, &text).await;
                        if let Some(reply) = reply {
                            if !send(&mut socket, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    room.roster.remove(&participant).await;
    info!("{} disconnected from room {}", participant, room_id);
}

async fn handle_client_message(
    room: &RoomState,
    participant: &ParticipantId,
    text: &str,
) -> Option<ServerMessage> {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::Error {
                request_id: None,
                message: format!("malformed frame: {}", e),
            })
        }
    };
    match msg {
        ClientMessage::Publish {
            request_id,
            to,
            kind,
            payload,
        } => {
            // The sender is whoever owns the socket
            let signal = OutboundSignal {
                from: participant.clone(),
                to,
                kind,
                payload,
            };
            match room.relay.publish(signal).await {
                Ok(sequence) => Some(ServerMessage::Published { request_id, sequence }),
                Err(e) => Some(ServerMessage::Error {
                    request_id: Some(request_id),
                    message: e.to_string(),
                }),
            }
        }
        ClientMessage::Remove { participant_id } => {
            if participant_id != *participant {
                info!("{} removed {} from the room", participant, participant_id);
            }
            if !room.roster.remove(&participant_id).await {
                debug!("{} was not in the room", participant_id);
            }
            None
        }
    }
}
