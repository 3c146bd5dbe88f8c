//! Sample bridge: media source buffers -> outbound tracks
//!
//! ```text
//! SourceEvent queue --> SamplePump --(stale epoch? drop)--> SampleBridge::forward
//!                                                               |
//!                                               TimingPolicy + SampleSink::write_sample
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use super::track::{OutboundTracks, SampleSink};
use crate::error::TransportError;
use crate::media::{FlushGate, MediaBuffer, SourceEvent, TrackKind};

/// Outcome of forwarding one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forwarded,
    /// The track or its peers were already closed; the sample is gone
    Dropped,
}

/// Failures that stop media delivery for every viewer
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{kind} track write failed: {source}")]
    Fatal {
        kind: TrackKind,
        #[source]
        source: TransportError,
    },

    #[error("media source failed: {0}")]
    Source(String),
}

/// Bridge counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub flushed: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
}

/// Converts and forwards buffers to the track of their kind
#[derive(Clone)]
pub struct SampleBridge {
    video: Arc<dyn SampleSink>,
    audio: Arc<dyn SampleSink>,
    counters: Arc<Counters>,
}

impl SampleBridge {
    pub fn new(video: Arc<dyn SampleSink>, audio: Arc<dyn SampleSink>) -> Self {
        Self {
            video,
            audio,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn from_tracks(tracks: &OutboundTracks) -> Self {
        Self::new(tracks.video.clone(), tracks.audio.clone())
    }

    fn sink(&self, kind: TrackKind) -> &Arc<dyn SampleSink> {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    /// Forward one buffer.
    ///
    /// The buffer (and the native storage behind it) is released before this
    /// returns, whatever the outcome.
    pub async fn forward(&self, buffer: MediaBuffer) -> Result<Delivery, BridgeError> {
        let kind = buffer.kind();
        let sink = self.sink(kind);
        let sample_time = sink.policy().sample_time(buffer.duration());

        let result = sink.write_sample(buffer.data().clone(), sample_time).await;
        drop(buffer);

        match result {
            Ok(()) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(Delivery::Forwarded)
            }
            Err(e) if e.is_closed() => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping {} sample: {}", kind, e);
                Ok(Delivery::Dropped)
            }
            Err(e) => Err(BridgeError::Fatal { kind, source: e }),
        }
    }

    fn note_flushed(&self) {
        self.counters.flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
        }
    }
}

/// Background task draining the media source queue into the bridge
pub struct SamplePump {
    bridge: SampleBridge,
    rx: mpsc::Receiver<SourceEvent>,
    gate: FlushGate,
}

impl SamplePump {
    pub fn new(bridge: SampleBridge, rx: mpsc::Receiver<SourceEvent>, gate: FlushGate) -> Self {
        Self { bridge, rx, gate }
    }

    /// Run until the media source goes away (`Ok`) or delivery breaks (`Err`)
    pub async fn run(mut self) -> Result<(), BridgeError> {
        info!("Sample pump started");

        while let Some(event) = self.rx.recv().await {
            match event {
                SourceEvent::Buffer(buffer) => {
                    if self.gate.is_stale(buffer.kind(), buffer.epoch()) {
                        trace!(
                            "Discarding flushed {} buffer from epoch {}",
                            buffer.kind(),
                            buffer.epoch()
                        );
                        self.bridge.note_flushed();
                        continue;
                    }

                    if let Err(e) = self.bridge.forward(buffer).await {
                        error!("Media delivery broken: {}", e);
                        return Err(e);
                    }
                }
                SourceEvent::Fatal(message) => {
                    error!("Media source failed: {}", message);
                    return Err(BridgeError::Source(message));
                }
            }
        }

        info!("Sample pump stopped: media source closed its queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SampleEmitter;
    use crate::webrtc::track::TimingPolicy;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Accept,
        Closed,
        Fail,
    }

    struct StubSink {
        kind: TrackKind,
        policy: TimingPolicy,
        behaviour: Behaviour,
        written: Mutex<Vec<(Bytes, Duration)>>,
    }

    impl StubSink {
        fn new(kind: TrackKind, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                kind,
                policy: TimingPolicy::ClockRate(kind.clock_rate()),
                behaviour,
                written: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SampleSink for StubSink {
        fn kind(&self) -> TrackKind {
            self.kind
        }

        fn policy(&self) -> TimingPolicy {
            self.policy
        }

        async fn write_sample(
            &self,
            data: Bytes,
            duration: Duration,
        ) -> Result<(), TransportError> {
            match self.behaviour {
                Behaviour::Accept => {
                    self.written.lock().push((data, duration));
                    Ok(())
                }
                Behaviour::Closed => Err(TransportError::Closed("peer gone".into())),
                Behaviour::Fail => Err(TransportError::Write("srtp failure".into())),
            }
        }
    }

    /// Allocation/release bookkeeping for tracked buffers
    #[derive(Default, Clone)]
    struct Ledger {
        allocated: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Ledger {
        fn buffer(&self, kind: TrackKind, tag: u8, millis: u64) -> MediaBuffer {
            self.allocated.fetch_add(1, Ordering::SeqCst);
            let released = self.released.clone();
            MediaBuffer::new(kind, vec![tag], Duration::from_millis(millis))
                .with_release(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                })
        }

        fn balanced(&self) -> bool {
            self.allocated.load(Ordering::SeqCst) == self.released.load(Ordering::SeqCst)
        }
    }

    /// Emit from a blocking thread, the way pipeline threads do
    async fn emit(emitter: &SampleEmitter, buffer: MediaBuffer) -> crate::error::Result<()> {
        let emitter = emitter.clone();
        tokio::task::spawn_blocking(move || emitter.emit(buffer))
            .await
            .unwrap()
    }

    fn bridge_with(video: Behaviour) -> (SampleBridge, Arc<StubSink>, Arc<StubSink>) {
        let video = StubSink::new(TrackKind::Video, video);
        let audio = StubSink::new(TrackKind::Audio, Behaviour::Accept);
        (
            SampleBridge::new(video.clone(), audio.clone()),
            video,
            audio,
        )
    }

    #[tokio::test]
    async fn test_forward_converts_and_releases() {
        let ledger = Ledger::default();
        let (bridge, video, audio) = bridge_with(Behaviour::Accept);

        let delivery = bridge
            .forward(ledger.buffer(TrackKind::Video, 1, 40))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Forwarded);
        bridge
            .forward(ledger.buffer(TrackKind::Audio, 2, 20))
            .await
            .unwrap();

        assert!(ledger.balanced());
        let video_written = video.written.lock();
        assert_eq!(video_written.len(), 1);
        assert_eq!(video_written[0].0, Bytes::from_static(&[1]));
        assert_eq!(
            TimingPolicy::ClockRate(90000).sample_time(Duration::from_millis(40)),
            video_written[0].1
        );
        assert_eq!(audio.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_track_drops_and_releases() {
        let ledger = Ledger::default();
        let (bridge, _, _) = bridge_with(Behaviour::Closed);

        let delivery = bridge
            .forward(ledger.buffer(TrackKind::Video, 1, 33))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Dropped);
        assert!(ledger.balanced());
        assert_eq!(bridge.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_unexpected_failure_is_fatal_and_releases() {
        let ledger = Ledger::default();
        let (bridge, _, _) = bridge_with(Behaviour::Fail);

        let result = bridge.forward(ledger.buffer(TrackKind::Video, 1, 33)).await;
        assert!(matches!(
            result,
            Err(BridgeError::Fatal {
                kind: TrackKind::Video,
                ..
            })
        ));
        assert!(ledger.balanced());
    }

    #[tokio::test]
    async fn test_pump_discards_pre_seek_buffers() {
        let ledger = Ledger::default();
        let (bridge, video, _) = bridge_with(Behaviour::Accept);
        let gate = FlushGate::new();
        let (emitter, rx) = SampleEmitter::channel(16, gate.clone());

        // Tag 1..=3 before the seek, 10..=12 after it
        for tag in 1..=3 {
            emit(&emitter, ledger.buffer(TrackKind::Video, tag, 33)).await.unwrap();
        }
        emitter.flush();
        for tag in 10..=12 {
            emit(&emitter, ledger.buffer(TrackKind::Video, tag, 33)).await.unwrap();
        }
        drop(emitter);

        SamplePump::new(bridge.clone(), rx, gate).run().await.unwrap();

        let tags: Vec<u8> = video.written.lock().iter().map(|(d, _)| d[0]).collect();
        assert_eq!(tags, vec![10, 11, 12]);
        assert!(ledger.balanced());
        assert_eq!(bridge.stats().flushed, 3);
        assert_eq!(bridge.stats().forwarded, 3);
    }

    #[tokio::test]
    async fn test_pump_flushes_one_kind_without_touching_the_other() {
        let ledger = Ledger::default();
        let (bridge, video, audio) = bridge_with(Behaviour::Accept);
        let gate = FlushGate::new();
        let (emitter, rx) = SampleEmitter::channel(16, gate.clone());

        // Audio flushes first while video is still queued from before its flush
        emit(&emitter, ledger.buffer(TrackKind::Audio, 1, 20)).await.unwrap();
        emit(&emitter, ledger.buffer(TrackKind::Video, 2, 33)).await.unwrap();
        emitter.flush_kind(TrackKind::Audio);
        emit(&emitter, ledger.buffer(TrackKind::Audio, 3, 20)).await.unwrap();
        emit(&emitter, ledger.buffer(TrackKind::Video, 4, 33)).await.unwrap();
        drop(emitter);

        SamplePump::new(bridge.clone(), rx, gate).run().await.unwrap();

        let video_tags: Vec<u8> = video.written.lock().iter().map(|(d, _)| d[0]).collect();
        let audio_tags: Vec<u8> = audio.written.lock().iter().map(|(d, _)| d[0]).collect();
        assert_eq!(video_tags, vec![2, 4]);
        assert_eq!(audio_tags, vec![3]);
        assert_eq!(bridge.stats().flushed, 1);
        assert!(ledger.balanced());
    }

    #[tokio::test]
    async fn test_pump_stops_on_write_failure() {
        let ledger = Ledger::default();
        let (bridge, _, _) = bridge_with(Behaviour::Fail);
        let gate = FlushGate::new();
        let (emitter, rx) = SampleEmitter::channel(16, gate.clone());

        emit(&emitter, ledger.buffer(TrackKind::Video, 1, 33)).await.unwrap();
        emit(&emitter, ledger.buffer(TrackKind::Video, 2, 33)).await.unwrap();

        let result = SamplePump::new(bridge, rx, gate).run().await;
        assert!(matches!(result, Err(BridgeError::Fatal { .. })));

        // The receiver is gone with the pump; the second buffer went with it
        assert!(emitter.is_closed());
        assert!(ledger.balanced());
    }

    #[tokio::test]
    async fn test_pump_surfaces_source_failure() {
        let (bridge, _, _) = bridge_with(Behaviour::Accept);
        let gate = FlushGate::new();
        let (emitter, rx) = SampleEmitter::channel(4, gate.clone());

        let handle = tokio::spawn(SamplePump::new(bridge, rx, gate).run());
        tokio::task::spawn_blocking(move || emitter.fail("decodebin: no suitable plugins"))
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Source(m)) if m.contains("decodebin")));
    }

    #[tokio::test]
    async fn test_pump_preserves_order_per_kind() {
        let (bridge, video, audio) = bridge_with(Behaviour::Accept);
        let gate = FlushGate::new();
        let (emitter, rx) = SampleEmitter::channel(64, gate.clone());

        for tag in 0..20u8 {
            let kind = if tag % 3 == 0 {
                TrackKind::Audio
            } else {
                TrackKind::Video
            };
            let buffer = MediaBuffer::new(kind, vec![tag], Duration::from_millis(20));
            emit(&emitter, buffer).await.unwrap();
        }
        drop(emitter);

        SamplePump::new(bridge, rx, gate).run().await.unwrap();

        let video_tags: Vec<u8> = video.written.lock().iter().map(|(d, _)| d[0]).collect();
        let audio_tags: Vec<u8> = audio.written.lock().iter().map(|(d, _)| d[0]).collect();
        assert!(video_tags.windows(2).all(|w| w[0] < w[1]));
        assert!(audio_tags.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(video_tags.len() + audio_tags.len(), 20);
    }
}
