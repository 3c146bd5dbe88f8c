//! rtwatch - watch a media file together over WebRTC
//!
//! A single transcoding pipeline feeds one H.264 video track and one Opus
//! audio track. Every browser that connects over the WebSocket signaling
//! endpoint receives the same tracks and can play, pause and seek the
//! shared pipeline.

pub mod config;
pub mod error;
pub mod media;
pub mod playback;
pub mod state;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
