use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::RelayState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub rooms: usize,
}

pub async fn get_health(State(state): State<RelayState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        rooms: state.room_count().await,
    })
}
