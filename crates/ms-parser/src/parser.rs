//! The stream parser contract.
//!
//! A [`StreamParser`] turns raw container bytes into decoder configurations
//! and per-track queues of [`AccessUnit`]s. Everything it discovers is
//! reported through the [`ParserEvents`] sink passed to each `parse` call.

use std::collections::{BTreeMap, VecDeque};
use std::time::SystemTime;

use ms_core::{
    AccessUnit, AudioDecoderConfig, MediaTime, Result, TextTrackConfig, TrackId,
    VideoDecoderConfig,
};

/// Decode-ordered access units for one track.
pub type BufferQueue = VecDeque<AccessUnit>;
/// Text track queues keyed by parser-assigned track id.
pub type TextBufferQueueMap = BTreeMap<TrackId, BufferQueue>;
/// Text track configs keyed by parser-assigned track id.
pub type TextConfigMap = BTreeMap<TrackId, TextTrackConfig>;

/// Whether the stream has a known end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    #[default]
    Unknown,
    Recorded,
    Live,
}

/// Facts reported once, after the first init segment is parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct InitParameters {
    /// Duration declared by the container, [`MediaTime::NONE`] if absent.
    pub duration: MediaTime,
    /// Wall-clock time corresponding to presentation time zero, if declared.
    pub timeline_offset: Option<SystemTime>,
    pub liveness: Liveness,
    /// The container format requires the timestamp offset to advance past
    /// each appended segment (e.g. raw audio streams without timestamps).
    pub auto_update_timestamp_offset: bool,
}

impl Default for InitParameters {
    fn default() -> Self {
        Self {
            duration: MediaTime::NONE,
            timeline_offset: None,
            liveness: Liveness::Unknown,
            auto_update_timestamp_offset: false,
        }
    }
}

/// Decoder configurations declared by one init segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaConfigs {
    pub audio: Option<AudioDecoderConfig>,
    pub video: Option<VideoDecoderConfig>,
    pub text: TextConfigMap,
}

/// Access units emitted for one parsed chunk of a media segment.
#[derive(Debug, Default)]
pub struct BufferQueues {
    pub audio: BufferQueue,
    pub video: BufferQueue,
    pub text: TextBufferQueueMap,
}

impl BufferQueues {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty() && self.text.values().all(|q| q.is_empty())
    }

    pub fn len(&self) -> usize {
        self.audio.len() + self.video.len() + self.text.values().map(|q| q.len()).sum::<usize>()
    }
}

/// Kind of initialization data found in an encrypted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDataType {
    Cenc,
    WebM,
    KeyIds,
}

/// Options handed to a parser when it is initialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Do not report text tracks or their buffers.
    pub ignore_text_tracks: bool,
}

/// Receiver of everything a parser discovers.
pub trait ParserEvents {
    /// First init segment complete.
    fn on_init(&mut self, params: InitParameters);

    /// An init segment declared these configs. Returning `false` rejects
    /// them and the parser must fail the current `parse` call.
    fn on_new_configs(&mut self, configs: MediaConfigs) -> bool;

    /// A new media segment starts.
    fn on_new_media_segment(&mut self);

    /// Access units parsed from the current media segment. Returning `false`
    /// rejects them and the parser must fail the current `parse` call.
    fn on_new_buffers(&mut self, buffers: BufferQueues) -> bool;

    /// The current media segment ended.
    fn on_end_of_media_segment(&mut self);

    /// The stream carries encryption initialization data.
    fn on_encrypted_init_data(&mut self, init_data_type: InitDataType, init_data: Vec<u8>);
}

/// A container format parser.
///
/// `parse` either buffers incomplete input and returns `Ok`, emits events and
/// returns `Ok`, or returns an error. After an error the parser must not be
/// fed again until [`flush`](StreamParser::flush) is called.
pub trait StreamParser: Send {
    /// Prepare the parser for its first bytes.
    fn init(&mut self, options: ParserOptions);

    /// Discard any partially parsed segment so the next bytes can start at
    /// an unrelated append point.
    fn flush(&mut self);

    /// Feed `data`, reporting whatever becomes complete to `events`.
    fn parse(&mut self, data: &[u8], events: &mut dyn ParserEvents) -> Result<()>;
}
