//! WebRTC configuration

use serde::{Deserialize, Serialize};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// WebRTC configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN server URLs; empty means host candidates only
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// mDNS candidate handling
    pub mdns_mode: MdnsMode,
    /// Also gather loopback host candidates, for viewers on this machine
    #[serde(default)]
    pub include_loopback: bool,
}

impl WebRtcConfig {
    /// ICE servers for `RTCConfiguration`
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// mDNS mode for ICE candidates
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum MdnsMode {
    /// Plain host candidates; browsers on the same LAN still connect
    #[default]
    Disabled,
    /// Resolve `.local` candidates from browsers, announce none
    QueryOnly,
    /// Resolve and announce `.local` candidates
    QueryAndGather,
}

impl MdnsMode {
    pub fn to_webrtc(self) -> MulticastDnsMode {
        match self {
            MdnsMode::Disabled => MulticastDnsMode::Disabled,
            MdnsMode::QueryOnly => MulticastDnsMode::QueryOnly,
            MdnsMode::QueryAndGather => MulticastDnsMode::QueryAndGather,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MdnsMode::Disabled => "disabled",
            MdnsMode::QueryOnly => "query_only",
            MdnsMode::QueryAndGather => "query_and_gather",
        }
    }
}

/// Host name announced over mDNS when gathering `.local` candidates
pub fn mdns_host_name(session_id: &str) -> String {
    format!("{session_id}.local")
}
