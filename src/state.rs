use std::sync::Arc;

use crate::config::AppConfig;
use crate::playback::PlaybackController;
use crate::webrtc::{OutboundTracks, PeerFactory, SampleBridge, SessionRegistry};

/// Application-wide state shared across handlers
///
/// There is exactly one pipeline (behind `controller`) and one pair of
/// outbound tracks; every signaling session gets a handle to both.
pub struct AppState {
    /// Startup configuration
    pub config: AppConfig,
    /// Playback control over the shared pipeline
    pub controller: Arc<PlaybackController>,
    /// Process-lifetime outbound tracks
    pub tracks: OutboundTracks,
    /// Creates one peer connection per session
    pub peers: Arc<dyn PeerFactory>,
    /// Live signaling sessions
    pub sessions: Arc<SessionRegistry>,
    /// Bridge feeding the tracks (for statistics)
    pub bridge: SampleBridge,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        controller: Arc<PlaybackController>,
        tracks: OutboundTracks,
        peers: Arc<dyn PeerFactory>,
        bridge: SampleBridge,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            controller,
            tracks,
            peers,
            sessions: Arc::new(SessionRegistry::new()),
            bridge,
        })
    }
}
