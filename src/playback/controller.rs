use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::media::{MediaSource, SampleEmitter};

/// Lifecycle of the shared pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
        }
    }
}

/// Turn any media source failure into a control rejection
fn rejected(op: &str, err: AppError) -> AppError {
    match err {
        AppError::Control(_) => err,
        other => AppError::Control(format!("{} rejected: {}", op, other)),
    }
}

/// The media source and its state. Only reachable through the controller lock.
pub struct Pipeline {
    source: Box<dyn MediaSource>,
    state: PlaybackState,
    started: bool,
}

impl Pipeline {
    pub fn new(source: Box<dyn MediaSource>) -> Self {
        Self {
            source,
            state: PlaybackState::Idle,
            started: false,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    fn start(&mut self, emitter: SampleEmitter) -> Result<()> {
        if self.started {
            return Err(AppError::Control("pipeline already started".to_string()));
        }
        self.source.start(emitter)?;
        self.started = true;
        self.state = PlaybackState::Playing;
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        if self.state == PlaybackState::Playing {
            return Ok(());
        }
        self.source.play().map_err(|e| rejected("play", e))?;
        self.state = PlaybackState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.state == PlaybackState::Paused {
            return Ok(());
        }
        self.source.pause().map_err(|e| rejected("pause", e))?;
        self.state = PlaybackState::Paused;
        Ok(())
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.source.seek(position).map_err(|e| rejected("seek", e))
    }

    fn stop(&mut self) -> Result<()> {
        self.source.stop()?;
        self.state = PlaybackState::Idle;
        Ok(())
    }
}

/// Serialized play/pause/seek over the single shared pipeline.
///
/// Every operation locks the pipeline for the whole media source call and
/// runs it on the blocking pool, so concurrent sessions queue up instead of
/// interleaving and the async workers never stall on the pipeline.
pub struct PlaybackController {
    pipeline: Arc<parking_lot::Mutex<Pipeline>>,
    source_name: &'static str,
    state_tx: watch::Sender<PlaybackState>,
}

impl PlaybackController {
    pub fn new(source: Box<dyn MediaSource>) -> Self {
        let source_name = source.name();
        let (state_tx, _) = watch::channel(PlaybackState::Idle);
        Self {
            pipeline: Arc::new(parking_lot::Mutex::new(Pipeline::new(source))),
            source_name,
            state_tx,
        }
    }

    async fn with_pipeline<F>(&self, op: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Pipeline) -> Result<()> + Send + 'static,
    {
        let pipeline = self.pipeline.clone();
        let state_tx = self.state_tx.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = pipeline.lock();
            let result = f(&mut guard);
            state_tx.send_replace(guard.state());
            result
        })
        .await
        .map_err(|e| AppError::Control(format!("{} did not complete: {}", op, e)))?
    }

    /// Start the pipeline; it begins in `Playing`
    pub async fn start(&self, emitter: SampleEmitter) -> Result<()> {
        self.with_pipeline("start", move |p| p.start(emitter)).await?;
        info!("Playback started ({} source)", self.source_name);
        Ok(())
    }

    pub async fn play(&self) -> Result<()> {
        self.with_pipeline("play", |p| p.play()).await?;
        debug!("Playback resumed");
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.with_pipeline("pause", |p| p.pause()).await?;
        debug!("Playback paused");
        Ok(())
    }

    /// Flush seek to `position`; the playing/paused state is kept
    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.with_pipeline("seek", move |p| p.seek(position)).await?;
        info!("Seeked to {}s", position.as_secs());
        Ok(())
    }

    /// Tear the pipeline down at shutdown
    pub async fn shutdown(&self) {
        if let Err(e) = self.with_pipeline("stop", |p| p.stop()).await {
            warn!("Stopping the media source failed: {}", e);
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state_tx.borrow()
    }

    pub fn source_name(&self) -> &'static str {
        self.source_name
    }
}
