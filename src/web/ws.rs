//! WebSocket signaling endpoint
//!
//! `GET /ws` upgrades to the signaling protocol described in
//! [`crate::webrtc::signaling`]. Each connection becomes one
//! [`SignalingSession`] with its own peer connection.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

use crate::state::AppState;
use crate::webrtc::SignalingSession;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();
    let (session_id, cancel) = state.sessions.register().await;

    // Tracks are attached before any offer can be read
    let peer = match state.peers.create(&session_id, &state.tracks).await {
        Ok(peer) => peer,
        Err(e) => {
            warn!(session_id = %session_id, "Failed to create peer connection: {}", e);
            let _ = sender.send(Message::Close(None)).await;
            state.sessions.remove(&session_id).await;
            return;
        }
    };

    info!(session_id = %session_id, "Viewer connected");

    SignalingSession::new(
        session_id,
        peer,
        state.controller.clone(),
        state.sessions.clone(),
        cancel,
    )
    .run(receiver, sender)
    .await;
}
