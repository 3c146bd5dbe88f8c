use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed signaling message; ends the offending session only
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The media source refused a play/pause/seek
    #[error("Playback control error: {0}")]
    Control(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unrecoverable pipeline failure (bus error, emission queue gone)
    #[error("Media source error: {0}")]
    MediaSource(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure writing a sample to an outbound track
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer or track was already closed; expected during teardown
    #[error("track closed: {0}")]
    Closed(String),

    /// Anything else; the media delivery path is broken for every viewer
    #[error("track write failed: {0}")]
    Write(String),
}

impl TransportError {
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed(_))
    }
}

impl From<crate::webrtc::bridge::BridgeError> for AppError {
    fn from(e: crate::webrtc::bridge::BridgeError) -> Self {
        use crate::webrtc::bridge::BridgeError;
        match e {
            BridgeError::Fatal { source, .. } => AppError::Transport(source),
            BridgeError::Source(message) => AppError::MediaSource(message),
        }
    }
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Protocol(_) | AppError::Control(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
