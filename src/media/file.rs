//! File media source
//!
//! Plays pre-encoded media straight from disk, without a transcoding graph:
//! - video: H.264 Annex-B elementary stream (the container path)
//! - audio: Ogg/Opus file next to it with the same stem (`movie.h264` + `movie.ogg`), optional
//!
//! Each track runs on its own reader thread. Units go out when the wall
//! clock reaches their presentation time, measured from the last (re)start.
//! Seeking reopens the file and resumes from the last keyframe group at or
//! before the requested position.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use webrtc::media::io::h264_reader::{H264Reader, NalUnitType, NAL};

use super::{seek_nanos, MediaBuffer, MediaSource, SampleEmitter, SourceSettings, TrackKind};
use crate::error::{AppError, Result};

const NAL_READ_CAPACITY: usize = 1024 * 1024;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Lateness after which pacing restarts instead of bursting to catch up
const MAX_PACING_LAG: Duration = Duration::from_millis(500);

/// File source configuration
#[derive(Debug, Clone)]
pub struct FileSourceConfig {
    /// H.264 Annex-B stream
    pub video_path: PathBuf,
    /// Ogg/Opus stream
    pub audio_path: Option<PathBuf>,
    /// Video frame rate used for pacing and seeking
    pub fps: u32,
    pub looping: bool,
}

impl FileSourceConfig {
    pub fn from_settings(settings: &SourceSettings) -> Self {
        let video_path = settings.container_path.clone();
        let audio_path = video_path.with_extension("ogg");
        let audio_path = (audio_path != video_path && audio_path.is_file()).then_some(audio_path);

        Self {
            video_path,
            audio_path,
            fps: settings.fps.max(1),
            looping: settings.looping,
        }
    }
}

/// One unit read from disk
struct Unit {
    data: Bytes,
    duration: Duration,
    pts: Duration,
}

/// Per-track reader driven by a worker thread
trait UnitReader: Send + 'static {
    fn kind(&self) -> TrackKind;

    /// Reopen at the nearest decodable point at or before `position`
    fn reposition(&mut self, position: Duration) -> Result<()>;

    /// Next unit, `None` at end of stream
    fn next_unit(&mut self) -> Result<Option<Unit>>;
}

fn open_h264(path: &Path) -> Result<H264Reader<BufReader<File>>> {
    let file = File::open(path)?;
    Ok(H264Reader::new(BufReader::new(file), NAL_READ_CAPACITY))
}

fn is_slice(unit_type: NalUnitType) -> bool {
    matches!(
        unit_type,
        NalUnitType::CodedSliceIdr | NalUnitType::CodedSliceNonIdr
    )
}

/// Whether `nal` is the first slice of a picture.
///
/// `first_mb_in_slice` is the leading ue(v) of the slice header; it is zero
/// exactly when its first bit is set.
fn starts_frame(nal: &NAL) -> bool {
    is_slice(nal.unit_type) && nal.data.get(1).is_some_and(|b| b & 0x80 != 0)
}

/// Locate the keyframe group to resume from for `target_frame`.
///
/// Returns the index of the first NAL of that group (its SPS/PPS when they
/// directly precede the IDR picture) and the frame number of the IDR.
fn find_keyframe(path: &Path, target_frame: u64) -> Result<(usize, u64)> {
    let mut reader = open_h264(path)?;
    let mut frame = 0u64;
    let mut params_start: Option<usize> = None;
    let mut found = (0usize, 0u64);

    let mut index = 0usize;
    while let Ok(nal) = reader.next_nal() {
        match nal.unit_type {
            NalUnitType::SPS | NalUnitType::PPS => {
                params_start.get_or_insert(index);
            }
            unit_type if starts_frame(&nal) => {
                if frame > target_frame {
                    break;
                }
                if unit_type == NalUnitType::CodedSliceIdr {
                    found = (params_start.unwrap_or(index), frame);
                }
                params_start = None;
                frame += 1;
            }
            _ => {}
        }
        index += 1;
    }

    Ok(found)
}

struct H264FileReader {
    path: PathBuf,
    fps: u32,
    frame_duration: Duration,
    reader: H264Reader<BufReader<File>>,
    peeked: Option<NAL>,
    frame_index: u64,
}

impl H264FileReader {
    fn open(path: &Path, fps: u32) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            fps,
            frame_duration: Duration::from_nanos(1_000_000_000 / fps as u64),
            reader: open_h264(path)?,
            peeked: None,
            frame_index: 0,
        })
    }

    fn frame_pts(&self) -> Duration {
        Duration::from_nanos(self.frame_duration.as_nanos() as u64 * self.frame_index)
    }

    fn read_nal(&mut self) -> Option<NAL> {
        if let Some(nal) = self.peeked.take() {
            return Some(nal);
        }
        match self.reader.next_nal() {
            Ok(nal) => Some(nal),
            Err(e) => {
                debug!("H.264 reader stopped: {}", e);
                None
            }
        }
    }
}

impl UnitReader for H264FileReader {
    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn reposition(&mut self, position: Duration) -> Result<()> {
        let target_frame = (position.as_nanos() * self.fps as u128 / NANOS_PER_SEC) as u64;
        let (skip, frame) = find_keyframe(&self.path, target_frame)?;

        let mut reader = open_h264(&self.path)?;
        for _ in 0..skip {
            if reader.next_nal().is_err() {
                break;
            }
        }

        self.reader = reader;
        self.peeked = None;
        self.frame_index = frame;
        debug!(
            "Video repositioned to frame {} (requested {:?})",
            frame, position
        );
        Ok(())
    }

    fn next_unit(&mut self) -> Result<Option<Unit>> {
        let Some(nal) = self.read_nal() else {
            return Ok(None);
        };

        // Slices of one picture share its timestamp; the last one carries
        // the frame duration
        let pts = self.frame_pts();
        let duration = if is_slice(nal.unit_type) {
            self.peeked = self.read_nal();
            let picture_continues = self
                .peeked
                .as_ref()
                .is_some_and(|next| is_slice(next.unit_type) && !starts_frame(next));
            if picture_continues {
                Duration::ZERO
            } else {
                self.frame_index += 1;
                self.frame_duration
            }
        } else {
            Duration::ZERO
        };

        Ok(Some(Unit {
            data: nal.data.freeze(),
            duration,
            pts,
        }))
    }
}

const OGG_CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const OGG_HEADER_LEN: usize = 27;
const OGG_CONTINUED: u8 = 0x01;

#[derive(Debug, Default)]
struct OggPage {
    continued: bool,
    segments: Vec<u8>,
    body: Vec<u8>,
}

/// Read one page, `None` at end of file (a truncated last page included)
fn read_ogg_page<R: Read>(reader: &mut R) -> Result<Option<OggPage>> {
    let mut header = [0u8; OGG_HEADER_LEN];
    if !read_or_eof(reader, &mut header)? {
        return Ok(None);
    }
    if &header[..4] != OGG_CAPTURE_PATTERN {
        return Err(AppError::MediaSource("lost Ogg page sync".to_string()));
    }

    let mut page = OggPage {
        continued: header[5] & OGG_CONTINUED != 0,
        segments: vec![0u8; header[26] as usize],
        body: Vec::new(),
    };
    if !read_or_eof(reader, &mut page.segments)? {
        return Ok(None);
    }
    page.body = vec![0u8; page.segments.iter().map(|&len| len as usize).sum()];
    if !read_or_eof(reader, &mut page.body)? {
        return Ok(None);
    }
    Ok(Some(page))
}

fn read_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Reassembles Ogg packets from the lacing values of consecutive pages.
///
/// A lacing value below 255 ends a packet; a packet ending on a 255 segment
/// continues on the next page.
struct OggPackets<R> {
    reader: R,
    page: OggPage,
    segment: usize,
    offset: usize,
    partial: Vec<u8>,
    /// Skipping the tail of a packet whose start was never seen
    discarding: bool,
}

impl<R: Read> OggPackets<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            page: OggPage::default(),
            segment: 0,
            offset: 0,
            partial: Vec::new(),
            discarding: false,
        }
    }

    fn next_packet(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.segment >= self.page.segments.len() {
                let Some(page) = read_ogg_page(&mut self.reader)? else {
                    return Ok(None);
                };
                if !page.continued && !self.partial.is_empty() {
                    debug!("Dropping unterminated Ogg packet");
                    self.partial.clear();
                }
                self.discarding = page.continued && self.partial.is_empty();
                self.page = page;
                self.segment = 0;
                self.offset = 0;
                continue;
            }

            let len = self.page.segments[self.segment] as usize;
            let chunk = &self.page.body[self.offset..self.offset + len];
            self.segment += 1;
            self.offset += len;

            if !self.discarding {
                self.partial.extend_from_slice(chunk);
            }
            if len < 255 {
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                return Ok(Some(Bytes::from(std::mem::take(&mut self.partial))));
            }
        }
    }
}

/// Open an Ogg/Opus file positioned after its two header packets
fn open_ogg(path: &Path) -> Result<OggPackets<BufReader<File>>> {
    let file = File::open(path)?;
    let mut packets = OggPackets::new(BufReader::new(file));
    let not_opus = |reason: &str| {
        AppError::Config(format!("{} is not an Ogg/Opus stream: {}", path.display(), reason))
    };

    for magic in [&b"OpusHead"[..], &b"OpusTags"[..]] {
        match packets.next_packet() {
            Ok(Some(packet)) if packet.starts_with(magic) => {}
            Ok(_) => {
                return Err(not_opus(&format!(
                    "missing {} header",
                    String::from_utf8_lossy(magic)
                )))
            }
            Err(e) => return Err(not_opus(&e.to_string())),
        }
    }
    Ok(packets)
}

/// Playback length of one Opus packet from its TOC byte (RFC 6716 section 3.1)
fn opus_packet_duration(packet: &[u8]) -> Duration {
    let Some(&toc) = packet.first() else {
        return Duration::ZERO;
    };

    let config = (toc >> 3) as usize;
    let frame_micros: u64 = match config {
        // SILK
        0..=11 => [10_000, 20_000, 40_000, 60_000][config % 4],
        // Hybrid
        12..=15 => [10_000, 20_000][config % 2],
        // CELT
        _ => [2_500, 5_000, 10_000, 20_000][config % 4],
    };
    let frames = match toc & 0x03 {
        0 => 1,
        1 | 2 => 2,
        _ => packet.get(1).map_or(0, |count| (count & 0x3f) as u64),
    };

    Duration::from_micros(frame_micros * frames)
}

struct OggFileReader {
    path: PathBuf,
    packets: OggPackets<BufReader<File>>,
    pts: Duration,
    pending: Option<(Bytes, Duration)>,
}

impl OggFileReader {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            packets: open_ogg(path)?,
            pts: Duration::ZERO,
            pending: None,
        })
    }

    fn next_packet(&mut self) -> Option<(Bytes, Duration)> {
        loop {
            match self.packets.next_packet() {
                Ok(Some(packet)) if packet.is_empty() => continue,
                Ok(Some(packet)) => {
                    let duration = opus_packet_duration(&packet);
                    return Some((packet, duration));
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!("Ogg reader stopped: {}", e);
                    return None;
                }
            }
        }
    }
}

impl UnitReader for OggFileReader {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn reposition(&mut self, position: Duration) -> Result<()> {
        self.packets = open_ogg(&self.path)?;
        self.pts = Duration::ZERO;
        self.pending = None;

        while let Some((data, duration)) = self.next_packet() {
            if self.pts + duration > position {
                self.pending = Some((data, duration));
                break;
            }
            self.pts += duration;
        }

        debug!(
            "Audio repositioned to {:?} (requested {:?})",
            self.pts, position
        );
        Ok(())
    }

    fn next_unit(&mut self) -> Result<Option<Unit>> {
        let Some((data, duration)) = self.pending.take().or_else(|| self.next_packet()) else {
            return Ok(None);
        };

        let pts = self.pts;
        self.pts += duration;
        Ok(Some(Unit {
            data,
            duration,
            pts,
        }))
    }
}

/// Maps presentation times to wall-clock deadlines from one anchor
#[derive(Debug, Clone, Copy)]
struct PaceClock {
    started: Instant,
    origin: Duration,
}

impl PaceClock {
    fn anchor(origin: Duration) -> Self {
        Self {
            started: Instant::now(),
            origin,
        }
    }

    /// When the unit at `pts` is due, `None` if it lies before the origin
    fn deadline(&self, pts: Duration) -> Option<Instant> {
        pts.checked_sub(self.origin).map(|offset| self.started + offset)
    }
}

#[derive(Debug, Default)]
struct Transport {
    started: bool,
    playing: bool,
    stopped: bool,
    seek_gen: u64,
    seek_to: Duration,
}

#[derive(Default)]
struct Shared {
    transport: Mutex<Transport>,
    wake: Condvar,
}

fn run_worker(
    mut reader: Box<dyn UnitReader>,
    shared: Arc<Shared>,
    emitter: SampleEmitter,
    looping: bool,
    mut applied_gen: u64,
) {
    let kind = reader.kind();
    let mut at_end = false;
    let mut clock: Option<PaceClock> = None;

    info!("File source {} reader started", kind);

    loop {
        {
            let mut transport = shared.transport.lock();
            while !transport.stopped
                && transport.seek_gen == applied_gen
                && (!transport.playing || at_end)
            {
                shared.wake.wait(&mut transport);
                clock = None;
            }
            if transport.stopped {
                break;
            }
            if transport.seek_gen != applied_gen {
                applied_gen = transport.seek_gen;
                let target = transport.seek_to;
                drop(transport);

                if let Err(e) = reader.reposition(target) {
                    emitter.fail(format!("{} seek failed: {}", kind, e));
                    break;
                }
                at_end = false;
                clock = None;
                continue;
            }
        }

        let unit = match reader.next_unit() {
            Ok(Some(unit)) => unit,
            Ok(None) if looping => {
                debug!("File source {} reached end of stream, restarting", kind);
                if let Err(e) = reader.reposition(Duration::ZERO) {
                    emitter.fail(format!("{} restart failed: {}", kind, e));
                    break;
                }
                clock = None;
                continue;
            }
            Ok(None) => {
                info!("File source {} reached end of stream", kind);
                at_end = true;
                continue;
            }
            Err(e) => {
                emitter.fail(format!("{} read failed: {}", kind, e));
                break;
            }
        };

        let pace = *clock.get_or_insert_with(|| PaceClock::anchor(unit.pts));
        match pace.deadline(unit.pts) {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                } else if now - deadline > MAX_PACING_LAG {
                    debug!("File source {} fell behind, re-anchoring", kind);
                    clock = Some(PaceClock::anchor(unit.pts));
                }
            }
            None => clock = Some(PaceClock::anchor(unit.pts)),
        }

        let buffer = MediaBuffer::new(kind, unit.data, unit.duration).with_pts(unit.pts);

        {
            // Emitting under the transport lock keeps a concurrent seek from
            // returning while a pre-seek unit is still on its way out
            let transport = shared.transport.lock();
            if transport.stopped {
                break;
            }
            if transport.seek_gen != applied_gen {
                continue;
            }
            if emitter.emit(buffer).is_err() {
                debug!("Sample queue closed, {} reader exiting", kind);
                break;
            }
        }
    }

    info!("File source {} reader stopped", kind);
}

/// Media source reading pre-encoded streams from disk
pub struct FileMediaSource {
    config: FileSourceConfig,
    shared: Arc<Shared>,
    emitter: Option<SampleEmitter>,
    workers: Vec<JoinHandle<()>>,
}

impl FileMediaSource {
    /// Validate the input files and build the source (not started yet)
    pub fn open(config: FileSourceConfig) -> Result<Self> {
        if !config.video_path.is_file() {
            return Err(AppError::Config(format!(
                "container file not found: {}",
                config.video_path.display()
            )));
        }

        let mut probe = open_h264(&config.video_path)?;
        probe.next_nal().map_err(|e| {
            AppError::Config(format!(
                "{} is not an H.264 Annex-B stream: {}",
                config.video_path.display(),
                e
            ))
        })?;

        if let Some(ref audio_path) = config.audio_path {
            open_ogg(audio_path)?;
            info!("File source audio: {}", audio_path.display());
        } else {
            warn!(
                "No Ogg/Opus file next to {}, audio track stays silent",
                config.video_path.display()
            );
        }

        Ok(Self {
            config,
            shared: Arc::new(Shared::default()),
            emitter: None,
            workers: Vec::new(),
        })
    }

    fn with_started<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transport),
    {
        let mut transport = self.shared.transport.lock();
        if !transport.started || transport.stopped {
            return Err(AppError::Control("file source is not running".to_string()));
        }
        f(&mut transport);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn spawn_worker(
        &mut self,
        reader: Box<dyn UnitReader>,
        emitter: SampleEmitter,
        seek_gen: u64,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let looping = self.config.looping;
        let name = format!("rtwatch-file-{}", reader.kind());

        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(reader, shared, emitter, looping, seek_gen))?;
        self.workers.push(handle);
        Ok(())
    }
}

impl MediaSource for FileMediaSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start(&mut self, emitter: SampleEmitter) -> Result<()> {
        // Readers begin at the generation current now; a seek racing their
        // startup is still applied
        let seek_gen = {
            let mut transport = self.shared.transport.lock();
            if transport.started {
                return Err(AppError::Control("file source already started".to_string()));
            }
            transport.started = true;
            transport.playing = true;
            transport.seek_gen
        };

        let video = H264FileReader::open(&self.config.video_path, self.config.fps)?;
        self.spawn_worker(Box::new(video), emitter.clone(), seek_gen)?;

        if let Some(audio_path) = self.config.audio_path.clone() {
            let audio = OggFileReader::open(&audio_path)?;
            self.spawn_worker(Box::new(audio), emitter.clone(), seek_gen)?;
        }
        self.emitter = Some(emitter);

        info!(
            "File source started: {} @ {} fps",
            self.config.video_path.display(),
            self.config.fps
        );
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.with_started(|t| t.playing = true)
    }

    fn pause(&mut self) -> Result<()> {
        self.with_started(|t| t.playing = false)
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        seek_nanos(position)?;
        let emitter = self.emitter.as_ref();
        self.with_started(|t| {
            t.seek_gen += 1;
            t.seek_to = position;
            // Readers emit under the same lock, so nothing pre-seek can be
            // stamped with the new epoch
            if let Some(emitter) = emitter {
                emitter.flush();
            }
        })
    }

    fn stop(&mut self) -> Result<()> {
        {
            let mut transport = self.shared.transport.lock();
            transport.stopped = true;
            self.shared.wake.notify_all();
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("File source reader thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for FileMediaSource {
    fn drop(&mut self) {
        self.shared.transport.lock().stopped = true;
        self.shared.wake.notify_all();
    }
}
