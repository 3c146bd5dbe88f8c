//! WebRTC peer connections
//!
//! Each signaling session owns exactly one peer connection. Both shared
//! outbound tracks are attached when the connection is created, before any
//! offer arrives, so the answer always carries the audio and video sections.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use super::config::{mdns_host_name, WebRtcConfig};
use super::track::OutboundTracks;
use crate::error::{AppError, Result};

/// The transport side of one signaling session
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Apply a remote offer and return the local answer once ICE gathering
    /// has completed
    async fn accept_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription>;

    async fn close(&self) -> Result<()>;
}

/// Creates a peer session with the shared tracks attached
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, session_id: &str, tracks: &OutboundTracks) -> Result<Box<dyn PeerSession>>;
}

/// Factory producing real `RTCPeerConnection`s
pub struct WebRtcPeerFactory {
    config: WebRtcConfig,
}

impl WebRtcPeerFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    async fn new_peer_connection(&self, session_id: &str) -> Result<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        let mode = self.config.mdns_mode.to_webrtc();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(session_id));
        }
        setting_engine.set_include_loopback_candidate(self.config.include_loopback);
        debug!(
            "WebRTC mDNS mode: {} (session {})",
            self.config.mdns_mode.label(),
            session_id
        );

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };

        api.new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))
    }
}

/// Drain RTCP for a sender so NACK and report interceptors keep running
fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut buf).await {}
    });
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, session_id: &str, tracks: &OutboundTracks) -> Result<Box<dyn PeerSession>> {
        let pc = Arc::new(self.new_peer_connection(session_id).await?);

        for track in tracks.all() {
            let sender = pc.add_track(track.as_track_local()).await.map_err(|e| {
                AppError::WebRtc(format!("Failed to add {} track: {}", track.codec().mime_type(), e))
            })?;
            spawn_rtcp_reader(sender);
        }

        let id = session_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let id = id.clone();
            Box::pin(async move {
                info!(session_id = %id, "Peer connection state: {}", s);
            })
        }));

        Ok(Box::new(RtcPeerSession { pc }))
    }
}

/// Peer session backed by an `RTCPeerConnection`
pub struct RtcPeerSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn accept_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::Protocol(format!("Offer rejected: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create answer: {}", e)))?;

        // Subscribe before setting the local description so completion is not missed
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to set local description: {}", e)))?;
        let _ = gather_complete.recv().await;

        self.pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtc("No local description after gathering".to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}
