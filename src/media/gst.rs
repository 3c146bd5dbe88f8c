//! GStreamer transcoding source
//!
//! Decodes any container GStreamer understands and re-encodes it to
//! H.264 (byte-stream) and Opus, handing each encoded sample to the
//! emitter from the appsink streaming threads.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{seek_nanos, MediaBuffer, MediaSource, SampleEmitter, TrackKind};
use crate::error::{AppError, Result};

const BUS_POLL: gst::ClockTime = gst::ClockTime::from_mseconds(200);

fn pipeline_description(path: &Path) -> String {
    let location = path.display().to_string().replace('"', "\\\"");
    format!(
        "filesrc location=\"{location}\" ! decodebin name=demux \
         ! queue ! x264enc bframes=0 speed-preset=veryfast key-int-max=60 \
         ! video/x-h264,stream-format=byte-stream ! appsink name=video \
         demux. ! queue ! audioconvert ! audioresample ! opusenc ! appsink name=audio"
    )
}

fn clock_time(position: Duration) -> Result<gst::ClockTime> {
    seek_nanos(position).map(gst::ClockTime::from_nseconds)
}

/// Media source backed by a GStreamer pipeline
pub struct GstMediaSource {
    path: PathBuf,
    pipeline: gst::Pipeline,
    looping: bool,
    emitter: Option<SampleEmitter>,
    bus_stop: Arc<AtomicBool>,
    bus_thread: Option<JoinHandle<()>>,
}

impl GstMediaSource {
    /// Build the pipeline for `path`; nothing runs until `start`
    pub fn new(path: &Path, looping: bool) -> Result<Self> {
        if !path.is_file() {
            return Err(AppError::Config(format!(
                "container file not found: {}",
                path.display()
            )));
        }

        gst::init().map_err(|e| AppError::MediaSource(format!("GStreamer init failed: {}", e)))?;

        let pipeline = gst::parse::launch(&pipeline_description(path))
            .map_err(|e| AppError::MediaSource(format!("Failed to build pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| AppError::MediaSource("Launch description is not a pipeline".into()))?;

        Self::with_pipeline(path, pipeline, looping)
    }

    fn with_pipeline(path: &Path, pipeline: gst::Pipeline, looping: bool) -> Result<Self> {
        let source = Self {
            path: path.to_path_buf(),
            pipeline,
            looping,
            emitter: None,
            bus_stop: Arc::new(AtomicBool::new(false)),
            bus_thread: None,
        };
        // Fail early if a sink is missing
        source.app_sink(TrackKind::Video)?;
        source.app_sink(TrackKind::Audio)?;

        Ok(source)
    }

    fn app_sink(&self, kind: TrackKind) -> Result<gst_app::AppSink> {
        self.pipeline
            .by_name(kind.sink_name())
            .and_then(|element| element.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| {
                AppError::MediaSource(format!("appsink '{}' not found", kind.sink_name()))
            })
    }

    fn attach_sink(&self, kind: TrackKind, emitter: SampleEmitter) -> Result<()> {
        let sink = self.app_sink(kind)?;

        // FLUSH_STOP is serialized with the samples of this sink, so the
        // epoch moves after the last pre-seek sample and before the first
        // post-seek one
        let pad = sink
            .static_pad("sink")
            .ok_or_else(|| AppError::MediaSource(format!("appsink '{}' has no sink pad", kind)))?;
        let flusher = emitter.clone();
        pad.add_probe(gst::PadProbeType::EVENT_FLUSH, move |_, info| {
            if let Some(gst::PadProbeData::Event(ref event)) = info.data {
                if let gst::EventView::FlushStop(_) = event.view() {
                    let epoch = flusher.flush_kind(kind);
                    debug!("{} stream flushed, epoch {}", kind, epoch);
                }
            }
            gst::PadProbeReturn::Ok
        });

        sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let duration = buffer
                        .duration()
                        .map(|d| Duration::from_nanos(d.nseconds()))
                        .unwrap_or_default();
                    let mut media = MediaBuffer::new(
                        kind,
                        bytes::Bytes::copy_from_slice(map.as_slice()),
                        duration,
                    );
                    if let Some(pts) = buffer.pts() {
                        media = media.with_pts(Duration::from_nanos(pts.nseconds()));
                    }
                    drop(map);

                    // The sample stays referenced until the bridge is done with it
                    let media = media.with_release(move || drop(sample));

                    emitter.emit(media).map_err(|_| gst::FlowError::Flushing)?;
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
        Ok(())
    }

    fn spawn_bus_watch(&mut self, emitter: SampleEmitter) -> Result<()> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| AppError::MediaSource("pipeline has no bus".into()))?;
        let pipeline = self.pipeline.clone();
        let looping = self.looping;
        let stop = self.bus_stop.clone();

        let handle = std::thread::Builder::new()
            .name("rtwatch-gst-bus".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let Some(msg) = bus.timed_pop(BUS_POLL) else {
                        continue;
                    };

                    match msg.view() {
                        gst::MessageView::Eos(_) if looping => {
                            debug!("End of stream, restarting from the beginning");
                            if let Err(e) = pipeline.seek_simple(
                                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                                gst::ClockTime::ZERO,
                            ) {
                                emitter.fail(format!("Loop seek failed: {}", e));
                                break;
                            }
                        }
                        gst::MessageView::Eos(_) => {
                            info!("End of stream");
                        }
                        gst::MessageView::Error(err) => {
                            let source = err
                                .src()
                                .map(|s| s.path_string().to_string())
                                .unwrap_or_default();
                            error!("Pipeline error from {}: {}", source, err.error());
                            emitter.fail(format!("{}: {}", source, err.error()));
                            break;
                        }
                        gst::MessageView::Warning(w) => {
                            warn!("Pipeline warning: {}", w.error());
                        }
                        _ => {}
                    }
                }
            })?;

        self.bus_thread = Some(handle);
        Ok(())
    }

    fn set_state(&self, state: gst::State) -> Result<()> {
        self.pipeline
            .set_state(state)
            .map(|_| ())
            .map_err(|e| AppError::Control(format!("Failed to set {:?}: {}", state, e)))
    }

    fn ensure_started(&self) -> Result<()> {
        if self.emitter.is_none() {
            return Err(AppError::Control("pipeline not started".into()));
        }
        Ok(())
    }
}

impl MediaSource for GstMediaSource {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn start(&mut self, emitter: SampleEmitter) -> Result<()> {
        if self.emitter.is_some() {
            return Err(AppError::Control("pipeline already started".into()));
        }

        self.attach_sink(TrackKind::Video, emitter.clone())?;
        self.attach_sink(TrackKind::Audio, emitter.clone())?;
        self.spawn_bus_watch(emitter.clone())?;
        self.emitter = Some(emitter);

        self.set_state(gst::State::Playing)?;
        info!("GStreamer pipeline playing {}", self.path.display());
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.ensure_started()?;
        self.set_state(gst::State::Playing)
    }

    fn pause(&mut self) -> Result<()> {
        self.ensure_started()?;
        self.set_state(gst::State::Paused)
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.ensure_started()?;
        let target = clock_time(position)?;
        self.pipeline
            .seek_simple(gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT, target)
            .map_err(|e| AppError::Control(format!("Seek to {:?} rejected: {}", position, e)))
    }

    fn stop(&mut self) -> Result<()> {
        self.bus_stop.store(true, Ordering::Release);
        let result = self.set_state(gst::State::Null);
        if let Some(handle) = self.bus_thread.take() {
            if handle.join().is_err() {
                warn!("GStreamer bus thread panicked");
            }
        }
        result
    }
}

impl Drop for GstMediaSource {
    fn drop(&mut self) {
        self.bus_stop.store(true, Ordering::Release);
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_description_names_sinks() {
        let description = pipeline_description(Path::new("/media/movie \"cut\".mkv"));
        assert!(description.contains("appsink name=video"));
        assert!(description.contains("appsink name=audio"));
        assert!(description.contains("location=\"/media/movie \\\"cut\\\".mkv\""));
    }

    #[test]
    fn test_clock_time_rejects_positions_past_the_pipeline_range() {
        assert_eq!(
            clock_time(Duration::from_secs(90)).unwrap(),
            gst::ClockTime::from_seconds(90)
        );
        assert!(matches!(
            clock_time(Duration::from_secs(u64::MAX)),
            Err(AppError::Control(_))
        ));
    }

    #[test]
    fn test_flush_stop_advances_only_its_own_kind() {
        use crate::media::FlushGate;

        gst::init().unwrap();
        let pipeline = gst::parse::launch(
            "appsrc name=vsrc ! appsink name=video appsrc name=asrc ! appsink name=audio",
        )
        .unwrap()
        .downcast::<gst::Pipeline>()
        .unwrap();
        let source = GstMediaSource::with_pipeline(Path::new("test"), pipeline, false).unwrap();

        let gate = FlushGate::new();
        let (emitter, _rx) = SampleEmitter::channel(4, gate.clone());
        source.attach_sink(TrackKind::Video, emitter.clone()).unwrap();
        source.attach_sink(TrackKind::Audio, emitter).unwrap();
        // Pads only take events once active
        let _ = source.pipeline.set_state(gst::State::Paused);

        let pad = source
            .app_sink(TrackKind::Audio)
            .unwrap()
            .static_pad("sink")
            .unwrap();
        pad.send_event(gst::event::FlushStart::new());
        assert_eq!(gate.current(TrackKind::Audio), 0);
        pad.send_event(gst::event::FlushStop::new(true));

        assert_eq!(gate.current(TrackKind::Audio), 1);
        assert_eq!(gate.current(TrackKind::Video), 0);
        let _ = source.pipeline.set_state(gst::State::Null);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = GstMediaSource::new(Path::new("/nonexistent/movie.mkv"), true);
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
