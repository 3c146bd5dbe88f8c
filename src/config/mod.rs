//! Application configuration
//!
//! Built once from the command line at startup and validated before
//! anything is opened. Nothing is persisted.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::media::{SourceKind, SourceSettings};
use crate::webrtc::{TimingMode, WebRtcConfig};

/// Default capacity of the media source → pump queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub media: MediaConfig,
    pub web: WebConfig,
    pub webrtc: WebRtcConfig,
}

/// Media source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// File to stream
    pub container_path: PathBuf,
    /// Source implementation
    pub source: SourceKind,
    /// Track timing policy
    pub timing: TimingMode,
    /// Video frame rate of the file source
    pub fps: u32,
    /// Restart at end of stream
    pub looping: bool,
    /// Buffers queued between the source and the pump
    pub queue_capacity: usize,
}

impl MediaConfig {
    pub fn new(container_path: impl Into<PathBuf>) -> Self {
        Self {
            container_path: container_path.into(),
            source: SourceKind::default(),
            timing: TimingMode::default(),
            fps: 30,
            looping: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            kind: self.source,
            container_path: self.container_path.clone(),
            fps: self.fps,
            looping: self.looping,
        }
    }
}

/// Web server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// `host:port`; a bare `:port` listens on every interface
    pub listen_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_address: ":8080".to_string(),
        }
    }
}

impl WebConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        parse_listen_address(&self.listen_address)
    }
}

/// Parse a listen address, mapping `:port` to `0.0.0.0:port`
pub fn parse_listen_address(address: &str) -> Result<SocketAddr> {
    let address = address.trim();
    let normalized = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };

    normalized
        .parse()
        .map_err(|_| AppError::Config(format!("Invalid listen address: {}", address)))
}

impl AppConfig {
    pub fn new(media: MediaConfig) -> Self {
        Self {
            media,
            web: WebConfig::default(),
            webrtc: WebRtcConfig::default(),
        }
    }

    /// Check everything that can be checked before opening the media source
    pub fn validate(&self) -> Result<()> {
        let path = &self.media.container_path;
        if path.as_os_str().is_empty() {
            return Err(AppError::Config("container path is required".to_string()));
        }
        if !path.is_file() {
            return Err(AppError::Config(format!(
                "container file not found: {}",
                path.display()
            )));
        }
        if !(1..=240).contains(&self.media.fps) {
            return Err(AppError::Config(format!(
                "fps must be between 1 and 240, got {}",
                self.media.fps
            )));
        }
        if self.media.queue_capacity == 0 {
            return Err(AppError::Config("queue capacity must be positive".to_string()));
        }
        self.web.socket_addr()?;

        for url in &self.webrtc.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(AppError::Config(format!("Invalid STUN server URL: {}", url)));
            }
        }
        for turn in &self.webrtc.turn_servers {
            if turn
                .urls
                .iter()
                .any(|url| !url.starts_with("turn:") && !url.starts_with("turns:"))
            {
                return Err(AppError::Config(format!(
                    "Invalid TURN server URL: {:?}",
                    turn.urls
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_address_normalisation() {
        assert_eq!(
            parse_listen_address(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_address("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_address("[::1]:8080").is_ok());
        assert!(matches!(
            parse_listen_address("8080"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_validate() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = AppConfig::new(MediaConfig::new(file.path()));
        assert!(config.validate().is_ok());

        let missing = AppConfig::new(MediaConfig::new("/nonexistent/movie.mkv"));
        assert!(matches!(missing.validate(), Err(AppError::Config(_))));

        let empty = AppConfig::new(MediaConfig::new(""));
        assert!(matches!(empty.validate(), Err(AppError::Config(_))));

        let mut bad_fps = AppConfig::new(MediaConfig::new(file.path()));
        bad_fps.media.fps = 0;
        assert!(bad_fps.validate().is_err());

        let mut bad_stun = AppConfig::new(MediaConfig::new(file.path()));
        bad_stun.webrtc.stun_servers = vec!["http://example.com".to_string()];
        assert!(bad_stun.validate().is_err());
    }

    #[test]
    fn test_source_settings() {
        let mut media = MediaConfig::new("/media/movie.mkv");
        media.looping = false;
        let settings = media.source_settings();
        assert_eq!(settings.kind, SourceKind::Auto);
        assert_eq!(settings.fps, 30);
        assert!(!settings.looping);
    }
}
