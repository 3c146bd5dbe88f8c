use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::playback::PlaybackState;
use crate::state::AppState;
use crate::webrtc::{BridgeStats, SessionInfo};

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Playback status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub state: PlaybackState,
    pub sessions: usize,
    pub container_path: String,
    pub source: &'static str,
    pub samples: BridgeStats,
    pub viewers: Vec<SessionInfo>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let viewers = state.sessions.list().await;

    Json(StatusResponse {
        state: state.controller.state(),
        sessions: viewers.len(),
        container_path: state.config.media.container_path.display().to_string(),
        source: state.controller.source_name(),
        samples: state.bridge.stats(),
        viewers,
    })
}
