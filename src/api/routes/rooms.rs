use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::roster::Roster;
use crate::signal::ParticipantId;
use crate::state::RelayState;

pub async fn get_participants(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<ParticipantId>>, (StatusCode, String)> {
    let Some(room) = state.existing_room(&room_id).await else {
        return Err((StatusCode::NOT_FOUND, format!("no room {}", room_id)));
    };
    room.roster
        .list()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
