//! Shared outbound tracks
//!
//! One track per media kind exists for the whole process. Every peer
//! connection binds the same two tracks, so a sample written once reaches
//! every viewer. `TrackLocalStaticSample` does the RTP packetization.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::TransportError;
use crate::media::TrackKind;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Stream id shared by both tracks so browsers keep them in sync
pub const STREAM_ID: &str = "rtwatch";

/// Sample count for `duration` at `rate`, rounded half up
pub fn sample_count(rate: u32, duration: Duration) -> u64 {
    ((rate as u128 * duration.as_nanos() + NANOS_PER_SEC / 2) / NANOS_PER_SEC) as u64
}

/// How a buffer's duration becomes the transport's time quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "rate")]
pub enum TimingPolicy {
    /// Pass the duration through unchanged
    Duration,
    /// Quantize to whole ticks of the given clock rate
    ClockRate(u32),
}

impl TimingPolicy {
    /// Duration to hand to the track for a buffer lasting `duration`.
    ///
    /// For `ClockRate` the result sits half a tick past the rounded count,
    /// so the track's own truncating conversion lands on exactly that count.
    pub fn sample_time(&self, duration: Duration) -> Duration {
        match *self {
            TimingPolicy::Duration => duration,
            TimingPolicy::ClockRate(0) => duration,
            TimingPolicy::ClockRate(rate) => {
                let count = sample_count(rate, duration) as u128;
                let nanos = (2 * count * NANOS_PER_SEC + NANOS_PER_SEC) / (2 * rate as u128);
                Duration::from_nanos(nanos as u64)
            }
        }
    }
}

/// Process-wide timing choice, resolved per kind into a [`TimingPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TimingMode {
    #[default]
    ClockRate,
    Duration,
}

impl TimingMode {
    pub fn policy_for(&self, kind: TrackKind) -> TimingPolicy {
        match self {
            TimingMode::ClockRate => TimingPolicy::ClockRate(kind.clock_rate()),
            TimingMode::Duration => TimingPolicy::Duration,
        }
    }
}

/// Codec carried by an outbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackCodec {
    H264,
    Opus,
}

impl TrackCodec {
    pub fn for_kind(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Video => TrackCodec::H264,
            TrackKind::Audio => TrackCodec::Opus,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TrackCodec::H264 => "video/H264",
            TrackCodec::Opus => "audio/opus",
        }
    }

    /// RTP codec capability advertised for this codec
    pub fn capability(&self) -> RTCRtpCodecCapability {
        match self {
            TrackCodec::H264 => RTCRtpCodecCapability {
                mime_type: self.mime_type().to_string(),
                clock_rate: TrackKind::Video.clock_rate(),
                channels: 0,
                // Constrained baseline, what x264 with bframes=0 produces
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: vec![],
            },
            TrackCodec::Opus => RTCRtpCodecCapability {
                mime_type: self.mime_type().to_string(),
                clock_rate: TrackKind::Audio.clock_rate(),
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
        }
    }
}

/// Classify a failed track write
pub fn classify_write_error(err: &webrtc::Error) -> TransportError {
    match err {
        webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed => {
            TransportError::Closed(err.to_string())
        }
        _ => {
            // Errors from several bindings arrive joined by newlines
            let message = err.to_string();
            let all_closed = !message.is_empty()
                && message
                    .lines()
                    .all(|line| line.to_ascii_lowercase().contains("closed"));
            if all_closed {
                TransportError::Closed(message)
            } else {
                TransportError::Write(message)
            }
        }
    }
}

/// Destination of bridged samples
#[async_trait]
pub trait SampleSink: Send + Sync {
    fn kind(&self) -> TrackKind;

    fn policy(&self) -> TimingPolicy;

    /// Write one sample whose time quantity has already been converted
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TransportError>;
}

/// Outbound track shared by every session
pub struct OutboundTrack {
    kind: TrackKind,
    codec: TrackCodec,
    policy: TimingPolicy,
    track: Arc<TrackLocalStaticSample>,
}

impl OutboundTrack {
    pub fn new(kind: TrackKind, policy: TimingPolicy) -> Self {
        let codec = TrackCodec::for_kind(kind);
        let track = Arc::new(TrackLocalStaticSample::new(
            codec.capability(),
            kind.sink_name().to_string(),
            STREAM_ID.to_string(),
        ));

        Self {
            kind,
            codec,
            policy,
            track,
        }
    }

    pub fn codec(&self) -> TrackCodec {
        self.codec
    }

    /// Track handle for `RTCPeerConnection::add_track`
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

#[async_trait]
impl SampleSink for OutboundTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn policy(&self) -> TimingPolicy {
        self.policy
    }

    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TransportError> {
        let len = data.len();
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };

        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| classify_write_error(&e))?;

        trace!("{} sample written: {} bytes, {:?}", self.kind, len, duration);
        Ok(())
    }
}

/// The two process-lifetime tracks
#[derive(Clone)]
pub struct OutboundTracks {
    pub video: Arc<OutboundTrack>,
    pub audio: Arc<OutboundTrack>,
}

impl OutboundTracks {
    pub fn new(timing: TimingMode) -> Self {
        Self {
            video: Arc::new(OutboundTrack::new(
                TrackKind::Video,
                timing.policy_for(TrackKind::Video),
            )),
            audio: Arc::new(OutboundTrack::new(
                TrackKind::Audio,
                timing.policy_for(TrackKind::Audio),
            )),
        }
    }

    pub fn get(&self, kind: TrackKind) -> &Arc<OutboundTrack> {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    /// Tracks in the order they are attached to a peer connection
    pub fn all(&self) -> [&Arc<OutboundTrack>; 2] {
        [&self.video, &self.audio]
    }
}
