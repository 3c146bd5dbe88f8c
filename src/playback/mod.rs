//! Playback control over the single shared pipeline
//!
//! ```text
//! SignalingSession ─┐
//! SignalingSession ─┼──> PlaybackController ──(mutex)──> Pipeline { MediaSource, state }
//! SignalingSession ─┘
//! ```

pub mod controller;

pub use controller::{Pipeline, PlaybackController, PlaybackState};
