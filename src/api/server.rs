use std::io;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::config::RelayServerConfig;
use crate::state::RelayState;

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(routes::health::get_health))
        .route("/rooms/:room_id/participants", get(routes::rooms::get_participants))
        // WebSocket
        .route("/rooms/:room_id/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the relay on an already bound listener.
pub async fn serve_relay(listener: TcpListener, state: RelayState) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Relay server listening on ws://{}", addr);
    }
    axum::serve(listener, build_router(state)).await
}

pub async fn start_relay_server(config: &RelayServerConfig, state: RelayState) -> io::Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    serve_relay(listener, state).await
}
