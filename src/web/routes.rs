use axum::{
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::static_files::static_file_router;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new().route("/status", get(handlers::status));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", any(ws_handler))
        .nest("/api", api_routes)
        .merge(static_file_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
