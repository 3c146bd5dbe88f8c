//! Signaling wire protocol
//!
//! Every frame is a JSON text message `{"event": "...", "data": "..."}`:
//!
//! | event   | direction       | data                                   |
//! |---------|-----------------|----------------------------------------|
//! | `offer` | client → server | JSON `RTCSessionDescription` (offer)   |
//! | `answer`| server → client | JSON `RTCSessionDescription` (answer)  |
//! | `play`  | client → server | ignored                                |
//! | `pause` | client → server | ignored                                |
//! | `seek`  | client → server | target position in whole seconds       |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{AppError, Result};

/// Raw control message as it travels over the socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub event: String,
    #[serde(default)]
    pub data: String,
}

/// Decoded client event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Offer(String),
    Play,
    Pause,
    Seek(String),
    /// Anything else, ignored by the session
    Unknown(String),
}

impl ControlMessage {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Parse a text frame. Anything but a JSON object with a string `event`
    /// (and string `data` when present) is a protocol error.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AppError::Protocol(format!("Malformed control message: {}", e)))
    }

    /// `answer` message carrying `description`
    pub fn answer(description: &RTCSessionDescription) -> Result<Self> {
        Ok(Self::new("answer", serde_json::to_string(description)?))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_event(self) -> ControlEvent {
        match self.event.as_str() {
            "offer" => ControlEvent::Offer(self.data),
            "play" => ControlEvent::Play,
            "pause" => ControlEvent::Pause,
            "seek" => ControlEvent::Seek(self.data),
            _ => ControlEvent::Unknown(self.event),
        }
    }
}

/// Decode the session description embedded in an `offer`
pub fn parse_offer(data: &str) -> Result<RTCSessionDescription> {
    let description: RTCSessionDescription = serde_json::from_str(data)
        .map_err(|e| AppError::Protocol(format!("Invalid session description: {}", e)))?;

    if description.sdp_type != RTCSdpType::Offer {
        return Err(AppError::Protocol(format!(
            "Expected an offer, got {}",
            description.sdp_type
        )));
    }
    Ok(description)
}

/// Seek target from a `seek` payload: a non-negative decimal number of seconds
pub fn parse_seek(data: &str) -> Option<Duration> {
    let data = data.trim();
    if data.is_empty() || !data.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    data.parse::<u64>().ok().map(Duration::from_secs)
}
