//! Owned media buffers handed from a media source to the sample bridge

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use super::TrackKind;

type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// One encoded access unit emitted by a media source.
///
/// The buffer owns whatever native storage backs it (a GStreamer sample, a
/// file page...) through an optional release hook. The hook runs exactly once,
/// when the buffer is dropped, so every exit path of the consumer releases it:
/// normal return, early `?` return, or an unwinding panic. `MediaBuffer` is
/// not `Clone`.
pub struct MediaBuffer {
    kind: TrackKind,
    data: Bytes,
    duration: Duration,
    pts: Option<Duration>,
    epoch: u64,
    release: Option<ReleaseFn>,
}

impl MediaBuffer {
    /// Create a buffer with no native storage attached
    pub fn new(kind: TrackKind, data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            kind,
            data: data.into(),
            duration,
            pts: None,
            epoch: 0,
            release: None,
        }
    }

    /// Attach the hook that frees the native storage behind this buffer
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    /// Presentation timestamp in stream time, when the source knows it
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    /// Flush epoch the buffer was emitted in
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn stamp(&mut self, epoch: u64) {
        self.epoch = epoch;
    }
}

impl Drop for MediaBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for MediaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaBuffer")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("duration", &self.duration)
            .field("pts", &self.pts)
            .field("epoch", &self.epoch)
            .field("native", &self.release.is_some())
            .finish()
    }
}
