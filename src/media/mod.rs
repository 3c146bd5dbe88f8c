//! Media source boundary
//!
//! A media source is the transcoding pipeline that produces encoded audio
//! and video access units. Everything behind it (demuxing, decoding,
//! encoding) is opaque to the rest of the crate; the source only has to:
//!
//! - push [`MediaBuffer`]s into the [`SampleEmitter`] it receives in `start`
//! - honour `play`, `pause` and flushing `seek`
//!
//! ```text
//! MediaSource (streaming threads)
//!        |
//!        v  SampleEmitter (bounded queue, stamped with the flush epoch)
//! SamplePump -> SampleBridge -> OutboundTracks
//! ```

pub mod buffer;
pub mod file;
#[cfg(feature = "gstreamer")]
pub mod gst;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use buffer::MediaBuffer;
pub use file::{FileMediaSource, FileSourceConfig};
#[cfg(feature = "gstreamer")]
pub use gst::GstMediaSource;

use crate::error::{AppError, Result};

/// Video RTP clock rate (RFC 6184)
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// Opus RTP clock rate (RFC 7587)
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Name of the pipeline output point for this kind
    pub fn sink_name(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            TrackKind::Audio => AUDIO_CLOCK_RATE,
            TrackKind::Video => VIDEO_CLOCK_RATE,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.sink_name())
    }
}

/// Transcoding pipeline that feeds the outbound tracks.
///
/// Methods are blocking; callers run them off the async executor.
pub trait MediaSource: Send + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Attach the emitter and start producing buffers (the pipeline plays)
    fn start(&mut self, emitter: SampleEmitter) -> Result<()>;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Flushing seek. The source advances the flush epoch of each kind
    /// ([`SampleEmitter::flush`] or [`SampleEmitter::flush_kind`]) at the
    /// point where that kind's stream is flushed, in order with its own
    /// buffers. Once a kind has been flushed, nothing from before `position`
    /// may be emitted for it.
    fn seek(&mut self, position: Duration) -> Result<()>;

    /// Tear the pipeline down at process exit
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Flush epochs shared by the emitter and the pump, one per track kind.
///
/// A seek advances the epoch of each kind at the point where that kind's
/// stream is flushed; buffers stamped with an older epoch of their own kind
/// are stale and are discarded before they reach a track.
#[derive(Debug, Clone, Default)]
pub struct FlushGate {
    epochs: Arc<[AtomicU64; 2]>,
}

impl FlushGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: TrackKind) -> &AtomicU64 {
        match kind {
            TrackKind::Audio => &self.epochs[0],
            TrackKind::Video => &self.epochs[1],
        }
    }

    pub fn current(&self, kind: TrackKind) -> u64 {
        self.slot(kind).load(Ordering::Acquire)
    }

    /// Start a new epoch for `kind`, returning it
    pub fn advance(&self, kind: TrackKind) -> u64 {
        self.slot(kind).fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn advance_all(&self) {
        self.advance(TrackKind::Audio);
        self.advance(TrackKind::Video);
    }

    pub fn is_stale(&self, kind: TrackKind, epoch: u64) -> bool {
        epoch < self.current(kind)
    }
}

/// Check a seek target against the signed 64-bit nanosecond range
/// pipelines address positions with
pub fn seek_nanos(position: Duration) -> Result<u64> {
    u64::try_from(position.as_nanos())
        .ok()
        .filter(|nanos| *nanos <= i64::MAX as u64)
        .ok_or_else(|| AppError::Control(format!("seek position {:?} out of range", position)))
}

/// Item travelling from a media source to the pump
#[derive(Debug)]
pub enum SourceEvent {
    Buffer(MediaBuffer),
    /// The pipeline hit an unrecoverable error
    Fatal(String),
}

/// Handle a media source uses to hand buffers to the pump
#[derive(Debug, Clone)]
pub struct SampleEmitter {
    tx: mpsc::Sender<SourceEvent>,
    gate: FlushGate,
}

impl SampleEmitter {
    /// Create an emitter and the receiving end of its bounded queue
    pub fn channel(capacity: usize, gate: FlushGate) -> (Self, mpsc::Receiver<SourceEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, gate }, rx)
    }

    /// Queue a buffer from a pipeline thread, blocking while the queue is full.
    ///
    /// Must not be called from inside the async runtime. If the pump is gone
    /// the buffer is released and an error returned.
    pub fn emit(&self, mut buffer: MediaBuffer) -> Result<()> {
        buffer.stamp(self.gate.current(buffer.kind()));
        self.tx
            .blocking_send(SourceEvent::Buffer(buffer))
            .map_err(|_| AppError::MediaSource("sample queue closed".to_string()))
    }

    /// Start a new flush epoch for both kinds. Everything emitted before this
    /// call is stale.
    pub fn flush(&self) {
        self.gate.advance_all();
    }

    /// Start a new flush epoch for one kind only, for sources whose streams
    /// flush independently
    pub fn flush_kind(&self, kind: TrackKind) -> u64 {
        self.gate.advance(kind)
    }

    /// Report an unrecoverable pipeline error from a pipeline thread
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.blocking_send(SourceEvent::Fatal(message.into()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Which media source implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// GStreamer when compiled in, the file source otherwise
    #[default]
    Auto,
    Gstreamer,
    File,
}

/// Settings shared by the media source implementations
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub container_path: std::path::PathBuf,
    /// Video pacing of the file source
    pub fps: u32,
    /// Restart from the beginning at end of stream
    pub looping: bool,
}

/// Build the media source selected by `settings`
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn MediaSource>> {
    match settings.kind {
        SourceKind::File => Ok(Box::new(FileMediaSource::open(FileSourceConfig::from_settings(
            settings,
        ))?)),
        #[cfg(feature = "gstreamer")]
        SourceKind::Gstreamer | SourceKind::Auto => Ok(Box::new(GstMediaSource::new(
            &settings.container_path,
            settings.looping,
        )?)),
        #[cfg(not(feature = "gstreamer"))]
        SourceKind::Gstreamer => Err(AppError::Config(
            "this build has no GStreamer support (enable the `gstreamer` feature)".to_string(),
        )),
        #[cfg(not(feature = "gstreamer"))]
        SourceKind::Auto => Ok(Box::new(FileMediaSource::open(FileSourceConfig::from_settings(
            settings,
        ))?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_clock_rates() {
        assert_eq!(TrackKind::Video.clock_rate(), 90000);
        assert_eq!(TrackKind::Audio.clock_rate(), 48000);
        assert_eq!(TrackKind::Video.sink_name(), "video");
        assert_eq!(TrackKind::Audio.to_string(), "audio");
    }

    #[test]
    fn test_flush_gate() {
        let gate = FlushGate::new();
        assert_eq!(gate.current(TrackKind::Video), 0);
        assert!(!gate.is_stale(TrackKind::Video, 0));
        assert_eq!(gate.advance(TrackKind::Video), 1);
        assert!(gate.is_stale(TrackKind::Video, 0));
        assert!(!gate.is_stale(TrackKind::Video, 1));

        gate.advance_all();
        assert_eq!(gate.current(TrackKind::Video), 2);
        assert_eq!(gate.current(TrackKind::Audio), 1);
    }

    #[test]
    fn test_flushing_one_kind_leaves_the_other_fresh() {
        let gate = FlushGate::new();
        let audio_epoch = gate.current(TrackKind::Audio);
        let video_epoch = gate.current(TrackKind::Video);

        gate.advance(TrackKind::Audio);

        assert!(gate.is_stale(TrackKind::Audio, audio_epoch));
        assert!(!gate.is_stale(TrackKind::Video, video_epoch));
    }

    #[test]
    fn test_emitter_stamps_epoch_of_its_kind() {
        let gate = FlushGate::new();
        let (emitter, mut rx) = SampleEmitter::channel(8, gate.clone());

        emitter
            .emit(MediaBuffer::new(TrackKind::Video, vec![1u8], Duration::ZERO))
            .unwrap();
        emitter.flush();
        assert!(gate.is_stale(TrackKind::Video, 0));
        emitter
            .emit(MediaBuffer::new(TrackKind::Video, vec![2u8], Duration::ZERO))
            .unwrap();
        assert_eq!(emitter.flush_kind(TrackKind::Audio), 2);
        emitter
            .emit(MediaBuffer::new(TrackKind::Audio, vec![3u8], Duration::ZERO))
            .unwrap();
        emitter
            .emit(MediaBuffer::new(TrackKind::Video, vec![4u8], Duration::ZERO))
            .unwrap();

        let epochs: Vec<(TrackKind, u64)> = (0..4)
            .map(|_| match rx.blocking_recv().unwrap() {
                SourceEvent::Buffer(b) => (b.kind(), b.epoch()),
                SourceEvent::Fatal(m) => panic!("unexpected fatal: {}", m),
            })
            .collect();
        assert_eq!(
            epochs,
            vec![
                (TrackKind::Video, 0),
                (TrackKind::Video, 1),
                (TrackKind::Audio, 2),
                (TrackKind::Video, 1),
            ]
        );
    }

    #[test]
    fn test_seek_nanos_range() {
        assert_eq!(seek_nanos(Duration::from_secs(30)).unwrap(), 30_000_000_000);
        assert_eq!(seek_nanos(Duration::ZERO).unwrap(), 0);
        assert!(matches!(
            seek_nanos(Duration::from_secs(u64::MAX)),
            Err(AppError::Control(_))
        ));
        assert!(matches!(
            seek_nanos(Duration::from_nanos(i64::MAX as u64 + 1)),
            Err(AppError::Control(_))
        ));
    }

    #[test]
    fn test_emit_after_pump_gone_releases_buffer() {
        use std::sync::atomic::AtomicUsize;

        let (emitter, rx) = SampleEmitter::channel(1, FlushGate::new());
        drop(rx);

        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let buffer = MediaBuffer::new(TrackKind::Audio, vec![0u8], Duration::ZERO)
            .with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(emitter.emit(buffer).is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(emitter.is_closed());
    }
}
