//! Shared harness for demuxer integration tests.
//!
//! [`TestParser`] reads a small length-prefixed record format, so tests can
//! describe init and media segments directly as bytes:
//!
//! ```text
//! record := tag:u8 len:u32be payload[len]
//! 'I'    := flags:u8 duration_ms:i64be timeline_offset_s:i64be
//!           text_count:u8 text_id:u32be*
//! 'M'    := frame*
//! frame  := kind:u8 track:u32be pts_ms:i32be dts_ms:i32be dur_ms:i32be
//!           key:u8 size:u32be data[size]
//! 'E'    := init data for the key system
//! ```

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use mediasource::ms_core::{
    AccessUnit, AudioCodec, AudioDecoderConfig, DecodeTimestamp, Error, MediaKind, MediaTime, PipelineStatus, Result,
    TextKind, TextTrackConfig, TrackId, VideoCodec, VideoDecoderConfig,
};
use mediasource::ms_parser::{
    BufferQueues, ByteQueue, InitDataType, InitParameters, MediaConfigs, ParserEvents, ParserOptions,
    ParserRegistry, StreamParser,
};
use mediasource::{AddStatus, ChunkDemuxer, DemuxerConfig, DemuxerHost, DemuxerStream, ReadResult, SourceId};

pub const MIME: &str = "video/x-test";
pub const AAC: &str = "mp4a.40.2";
pub const OPUS: &str = "opus";
pub const H264: &str = "avc1.42E01E";

const TAG_INIT: u8 = b'I';
const TAG_MEDIA: u8 = b'M';
const TAG_ENCRYPTED: u8 = b'E';

const FLAG_AUDIO: u8 = 1;
const FLAG_VIDEO: u8 = 2;
const FLAG_OPUS: u8 = 4;
const FLAG_AUTO_OFFSET: u8 = 8;

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TestParser {
    queue: ByteQueue,
    options: ParserOptions,
    init_reported: bool,
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::parse("truncated record"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl TestParser {
    fn parse_init(&mut self, payload: &[u8], events: &mut dyn ParserEvents) -> Result<()> {
        let mut r = Reader { data: payload };
        let flags = r.u8()?;
        let duration_ms = r.i64()?;
        let timeline_offset_s = r.i64()?;
        let text_count = r.u8()?;

        let mut configs = MediaConfigs::default();
        if flags & FLAG_AUDIO != 0 {
            let codec = if flags & FLAG_OPUS != 0 {
                AudioCodec::Opus
            } else {
                AudioCodec::Aac
            };
            configs.audio = Some(AudioDecoderConfig::new(codec, 48_000, 2));
        }
        if flags & FLAG_VIDEO != 0 {
            configs.video = Some(VideoDecoderConfig::new(VideoCodec::H264, 320, 240));
        }
        for _ in 0..text_count {
            let id = r.u32()?;
            if !self.options.ignore_text_tracks {
                configs.text.insert(
                    TrackId::new(id),
                    TextTrackConfig::new(TextKind::Subtitles, "subtitles", "en", id.to_string()),
                );
            }
        }

        if !events.on_new_configs(configs) {
            return Err(Error::parse("init segment rejected"));
        }
        if !self.init_reported {
            self.init_reported = true;
            events.on_init(InitParameters {
                duration: if duration_ms < 0 {
                    MediaTime::NONE
                } else {
                    MediaTime::from_millis(duration_ms)
                },
                timeline_offset: (timeline_offset_s >= 0)
                    .then(|| SystemTime::UNIX_EPOCH + Duration::from_secs(timeline_offset_s as u64)),
                auto_update_timestamp_offset: flags & FLAG_AUTO_OFFSET != 0,
                ..Default::default()
            });
        }
        Ok(())
    }

    fn parse_media(&mut self, payload: &[u8], events: &mut dyn ParserEvents) -> Result<()> {
        let mut r = Reader { data: payload };
        let mut queues = BufferQueues::default();
        while !r.data.is_empty() {
            let kind = r.u8()?;
            let track = r.u32()?;
            let pts = r.i32()?;
            let dts = r.i32()?;
            let dur = r.i32()?;
            let key = r.u8()? != 0;
            let size = r.u32()? as usize;
            let data = r.take(size)?.to_vec();

            let (kind, track_id) = match kind {
                0 => (MediaKind::Audio, TrackId::AUDIO),
                1 => (MediaKind::Video, TrackId::VIDEO),
                2 => (MediaKind::Text, TrackId::new(track)),
                other => return Err(Error::parse(format!("unknown frame kind {other}"))),
            };
            if kind == MediaKind::Text && self.options.ignore_text_tracks {
                continue;
            }
            let unit = AccessUnit::new(
                kind,
                track_id,
                key,
                data,
                MediaTime::from_millis(pts.into()),
                MediaTime::from_millis(dur.into()),
            )
            .with_decode_timestamp(DecodeTimestamp::from_millis(dts.into()));
            match kind {
                MediaKind::Audio => queues.audio.push_back(unit),
                MediaKind::Video => queues.video.push_back(unit),
                MediaKind::Text => queues.text.entry(track_id).or_default().push_back(unit),
            }
        }

        events.on_new_media_segment();
        if !queues.is_empty() && !events.on_new_buffers(queues) {
            return Err(Error::parse("media segment rejected"));
        }
        events.on_end_of_media_segment();
        Ok(())
    }
}

impl StreamParser for TestParser {
    fn init(&mut self, options: ParserOptions) {
        self.options = options;
    }

    fn flush(&mut self) {
        self.queue.reset();
    }

    fn parse(&mut self, data: &[u8], events: &mut dyn ParserEvents) -> Result<()> {
        self.queue.push(data);
        loop {
            let buf = self.queue.peek();
            if buf.len() < 5 {
                return Ok(());
            }
            let tag = buf[0];
            let len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
            if buf.len() < 5 + len {
                return Ok(());
            }
            let payload = buf[5..5 + len].to_vec();
            self.queue.pop(5 + len);

            match tag {
                TAG_INIT => self.parse_init(&payload, events)?,
                TAG_MEDIA => self.parse_media(&payload, events)?,
                TAG_ENCRYPTED => events.on_encrypted_init_data(InitDataType::Cenc, payload),
                other => return Err(Error::parse(format!("unknown record tag {other:#04x}"))),
            }
        }
    }
}

pub fn registry() -> ParserRegistry {
    let mut registry = ParserRegistry::new();
    registry.register(MIME, &["mp4a.40.*", "opus", "avc1.*"], || Box::new(TestParser::default()));
    registry
}

// ---------------------------------------------------------------------------
// Segment builders
// ---------------------------------------------------------------------------

fn record(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Default)]
pub struct Init {
    pub audio: bool,
    pub video: bool,
    pub opus: bool,
    pub auto_update_offset: bool,
    pub duration_ms: Option<i64>,
    pub timeline_offset_secs: Option<i64>,
    pub text_tracks: Vec<u32>,
}

impl Init {
    pub fn audio() -> Self {
        Self {
            audio: true,
            ..Default::default()
        }
    }

    pub fn video() -> Self {
        Self {
            video: true,
            ..Default::default()
        }
    }

    pub fn av() -> Self {
        Self {
            audio: true,
            video: true,
            ..Default::default()
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut flags = 0;
        for (set, flag) in [
            (self.audio, FLAG_AUDIO),
            (self.video, FLAG_VIDEO),
            (self.opus, FLAG_OPUS),
            (self.auto_update_offset, FLAG_AUTO_OFFSET),
        ] {
            if set {
                flags |= flag;
            }
        }
        let mut payload = vec![flags];
        payload.extend_from_slice(&self.duration_ms.unwrap_or(-1).to_be_bytes());
        payload.extend_from_slice(&self.timeline_offset_secs.unwrap_or(-1).to_be_bytes());
        payload.push(self.text_tracks.len() as u8);
        for id in &self.text_tracks {
            payload.extend_from_slice(&id.to_be_bytes());
        }
        record(TAG_INIT, &payload)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub kind: u8,
    pub track: u32,
    pub pts: i32,
    pub dts: i32,
    pub dur: i32,
    pub key: bool,
    pub size: u32,
}

impl Frame {
    pub fn dts(mut self, dts: i32) -> Self {
        self.dts = dts;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }
}

pub fn audio(pts: i32, dur: i32) -> Frame {
    Frame {
        kind: 0,
        track: 0,
        pts,
        dts: pts,
        dur,
        key: true,
        size: 100,
    }
}

pub fn video(pts: i32, dur: i32, key: bool) -> Frame {
    Frame {
        kind: 1,
        track: 0,
        pts,
        dts: pts,
        dur,
        key,
        size: 1000,
    }
}

pub fn text(track: u32, pts: i32, dur: i32) -> Frame {
    Frame {
        kind: 2,
        track,
        pts,
        dts: pts,
        dur,
        key: true,
        size: 10,
    }
}

/// Frames of `dur` ms back to back from `start`, key frame every `gop`.
pub fn video_run(start: i32, count: i32, dur: i32, gop: i32) -> Vec<Frame> {
    (0..count)
        .map(|i| video(start + i * dur, dur, i % gop == 0))
        .collect()
}

pub fn audio_run(start: i32, count: i32, dur: i32) -> Vec<Frame> {
    (0..count).map(|i| audio(start + i * dur, dur)).collect()
}

pub fn media(frames: &[Frame]) -> Vec<u8> {
    let mut payload = Vec::new();
    for f in frames {
        payload.push(f.kind);
        payload.extend_from_slice(&f.track.to_be_bytes());
        payload.extend_from_slice(&f.pts.to_be_bytes());
        payload.extend_from_slice(&f.dts.to_be_bytes());
        payload.extend_from_slice(&f.dur.to_be_bytes());
        payload.push(u8::from(f.key));
        payload.extend_from_slice(&f.size.to_be_bytes());
        payload.resize(payload.len() + f.size as usize, 0xAB);
    }
    record(TAG_MEDIA, &payload)
}

pub fn encrypted(init_data: &[u8]) -> Vec<u8> {
    record(TAG_ENCRYPTED, init_data)
}

// ---------------------------------------------------------------------------
// Host and harness
// ---------------------------------------------------------------------------

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct RecordingHost {
    pub durations: Mutex<Vec<MediaTime>>,
    pub errors: Mutex<Vec<PipelineStatus>>,
    pub init_data: Mutex<Vec<(InitDataType, Vec<u8>)>>,
    pub text_tracks: Mutex<Vec<TextTrackConfig>>,
}

impl DemuxerHost for RecordingHost {
    fn set_duration(&self, duration: MediaTime) {
        self.durations.lock().push(duration);
    }

    fn on_demuxer_error(&self, status: PipelineStatus) {
        self.errors.lock().push(status);
    }

    fn on_encrypted_init_data(&self, init_data_type: InitDataType, init_data: Vec<u8>) {
        self.init_data.lock().push((init_data_type, init_data));
    }

    fn on_new_text_track(&self, _stream: Arc<DemuxerStream>, config: TextTrackConfig) {
        self.text_tracks.lock().push(config);
    }
}

/// A status callback and the receiver it reports to.
pub fn status_channel() -> (impl FnOnce(PipelineStatus) + Send + 'static, mpsc::Receiver<PipelineStatus>) {
    let (tx, rx) = mpsc::channel();
    (
        move |status| {
            let _ = tx.send(status);
        },
        rx,
    )
}

pub struct Harness {
    pub demuxer: Arc<ChunkDemuxer>,
    pub host: Arc<RecordingHost>,
    pub init_status: mpsc::Receiver<PipelineStatus>,
}

impl Harness {
    /// An initializing demuxer with no sources.
    pub fn new() -> Self {
        Self::with_config(DemuxerConfig::default())
    }

    pub fn with_config(config: DemuxerConfig) -> Self {
        init_tracing();
        let demuxer = Arc::new(ChunkDemuxer::new(config, registry()));
        let host = Arc::new(RecordingHost::default());
        let (cb, init_status) = status_channel();
        demuxer.initialize(host.clone(), cb);
        Self {
            demuxer,
            host,
            init_status,
        }
    }

    /// A demuxer with one source `id` that has parsed `init`.
    pub fn initialized(id: &str, init: Init) -> Self {
        let h = Self::new();
        let mut codecs = Vec::new();
        if init.audio {
            codecs.push(if init.opus { OPUS } else { AAC });
        }
        if init.video {
            codecs.push(H264);
        }
        assert_eq!(h.add(id, &codecs), AddStatus::Ok);
        h.append(id, &init.bytes()).unwrap();
        assert_eq!(h.take_init_status(), Some(PipelineStatus::Ok));
        h
    }

    pub fn add(&self, id: &str, codecs: &[&str]) -> AddStatus {
        self.demuxer.add_id(id, MIME, codecs)
    }

    pub fn append(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let mut offset = MediaTime::ZERO;
        self.append_with(id, bytes, MediaTime::ZERO, MediaTime::INFINITE, &mut offset)
    }

    pub fn append_with(
        &self,
        id: &str,
        bytes: &[u8],
        window_start: MediaTime,
        window_end: MediaTime,
        offset: &mut MediaTime,
    ) -> Result<()> {
        self.demuxer
            .append_data(&SourceId::new(id), bytes, window_start, window_end, offset, || {})
    }

    pub fn take_init_status(&self) -> Option<PipelineStatus> {
        self.init_status.try_recv().ok()
    }

    pub fn stream(&self, kind: MediaKind) -> Arc<DemuxerStream> {
        self.demuxer
            .get_stream(kind)
            .unwrap_or_else(|| panic!("no {kind} stream"))
    }

    /// Read once; `None` if the read was latched.
    pub fn read(&self, kind: MediaKind) -> Option<ReadResult> {
        read(&self.stream(kind))
    }

    pub fn read_pts(&self, kind: MediaKind, count: usize) -> Vec<i64> {
        let stream = self.stream(kind);
        (0..count)
            .map(|_| match read(&stream) {
                Some(ReadResult::Ok(b)) if !b.is_end_of_stream() => b.timestamp.as_millis(),
                other => panic!("expected a {kind} buffer, got {other:?}"),
            })
            .collect()
    }
}

pub fn read(stream: &DemuxerStream) -> Option<ReadResult> {
    read_later(stream).try_recv().ok()
}

/// Issue a read whose result may arrive after later appends.
pub fn read_later(stream: &DemuxerStream) -> mpsc::Receiver<ReadResult> {
    let (tx, rx) = mpsc::channel();
    stream.read(move |r| {
        let _ = tx.send(r);
    });
    rx
}

pub fn ms(millis: i64) -> MediaTime {
    MediaTime::from_millis(millis)
}
