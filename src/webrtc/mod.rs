//! WebRTC delivery and signaling
//!
//! Architecture:
//! ```text
//! MediaSource ──> SamplePump ──> SampleBridge ──> OutboundTracks (video H.264, audio Opus)
//!                                                      │ shared by every peer
//!                                                      v
//! Browser <──── WebSocket /ws ────> SignalingSession ── RTCPeerConnection
//!                                        │
//!                                        v
//!                               PlaybackController
//! ```

pub mod bridge;
pub mod config;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod track;

pub use bridge::{BridgeError, BridgeStats, Delivery, SampleBridge, SamplePump};
pub use config::{MdnsMode, TurnServer, WebRtcConfig};
pub use peer::{PeerFactory, PeerSession, WebRtcPeerFactory};
pub use session::{SessionInfo, SessionRegistry, SessionState, SignalingSession};
pub use signaling::{ControlEvent, ControlMessage};
pub use track::{OutboundTrack, OutboundTracks, SampleSink, TimingMode, TimingPolicy};
