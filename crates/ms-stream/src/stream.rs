//! Consumer-facing stream handle around one [`TrackBufferStore`].
//!
//! A [`DemuxerStream`] owns its store behind a `parking_lot::Mutex` and
//! latches at most one pending read. Operations that can complete a latched
//! read return a [`ReadCompletion`]; callers run it once every lock they hold
//! has been released, so read callbacks never execute under a lock.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use ms_core::{
    AccessUnit, AudioDecoderConfig, DecoderConfig, MediaKind, MediaTime, Ranges, Result,
    SharedAccessUnit, TextTrackConfig, TrackId, VideoDecoderConfig,
};

use crate::track_buffer::{ReadStatus, TrackBufferStore};

/// Outcome delivered to a read callback.
#[derive(Debug, Clone)]
pub enum ReadResult {
    /// A buffer, or the end-of-stream sentinel.
    Ok(SharedAccessUnit),
    /// Reads were aborted, usually for a seek.
    Aborted,
    /// The decoder config changed; fetch it before reading on.
    ConfigChanged,
}

impl ReadResult {
    pub fn buffer(&self) -> Option<&SharedAccessUnit> {
        match self {
            Self::Ok(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.buffer().is_some_and(|b| b.is_end_of_stream())
    }
}

pub type ReadCallback = Box<dyn FnOnce(ReadResult) + Send>;

/// A read callback paired with its result, ready to run outside any lock.
#[must_use = "a read completion must be run after locks are released"]
#[derive(Default)]
pub struct ReadCompletion(Option<(ReadCallback, ReadResult)>);

impl ReadCompletion {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }

    pub fn run(self) {
        if let Some((callback, result)) = self.0 {
            callback(result);
        }
    }
}

impl fmt::Debug for ReadCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadCompletion")
            .field(&self.0.as_ref().map(|(_, result)| result))
            .finish()
    }
}

/// Run every completion in order.
pub fn run_completions(completions: impl IntoIterator<Item = ReadCompletion>) {
    for completion in completions {
        completion.run();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized,
    ReturningData,
    ReturningAbortedForReads,
    Shutdown,
}

struct Inner {
    store: TrackBufferStore,
    state: StreamState,
    read_cb: Option<ReadCallback>,
}

pub struct DemuxerStream {
    kind: MediaKind,
    track_id: TrackId,
    inner: Mutex<Inner>,
}

impl DemuxerStream {
    pub fn new(
        track_id: TrackId,
        config: DecoderConfig,
        memory_limit: usize,
        splice_frames_enabled: bool,
    ) -> Arc<Self> {
        let kind = config.kind();
        Arc::new(Self {
            kind,
            track_id,
            inner: Mutex::new(Inner {
                store: TrackBufferStore::new(config, memory_limit, splice_frames_enabled),
                state: StreamState::Uninitialized,
                read_cb: None,
            }),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Request the next buffer. `cb` runs immediately if a result is
    /// available, otherwise once an append, end of stream or shutdown
    /// provides one.
    ///
    /// # Panics
    ///
    /// If the stream is uninitialized or a read is already pending.
    pub fn read(&self, cb: impl FnOnce(ReadResult) + Send + 'static) {
        let completion = {
            let mut inner = self.inner.lock();
            assert_ne!(
                inner.state,
                StreamState::Uninitialized,
                "read on uninitialized {} stream",
                self.kind
            );
            assert!(inner.read_cb.is_none(), "overlapping reads on {} stream", self.kind);
            inner.read_cb = Some(Box::new(cb));
            self.complete_pending_read_if_possible(&mut inner)
        };
        completion.run();
    }

    /// Fail any latched read with [`ReadResult::Aborted`] and keep failing
    /// reads until [`start_returning_data`](Self::start_returning_data).
    pub fn abort_reads(&self) -> ReadCompletion {
        let mut inner = self.inner.lock();
        if inner.state == StreamState::Shutdown {
            return ReadCompletion::none();
        }
        inner.state = StreamState::ReturningAbortedForReads;
        self.complete_pending_read_if_possible(&mut inner)
    }

    pub fn start_returning_data(&self) {
        let mut inner = self.inner.lock();
        if inner.state == StreamState::Shutdown {
            return;
        }
        debug_assert!(inner.read_cb.is_none());
        inner.state = StreamState::ReturningData;
    }

    /// Complete a latched read with end of stream; later reads do the same.
    pub fn shutdown(&self) -> ReadCompletion {
        let mut inner = self.inner.lock();
        inner.state = StreamState::Shutdown;
        self.complete_pending_read_if_possible(&mut inner)
    }

    pub fn complete_pending_read(&self) -> ReadCompletion {
        let mut inner = self.inner.lock();
        self.complete_pending_read_if_possible(&mut inner)
    }

    fn complete_pending_read_if_possible(&self, inner: &mut Inner) -> ReadCompletion {
        if inner.read_cb.is_none() {
            return ReadCompletion::none();
        }
        let result = match inner.state {
            StreamState::Uninitialized => return ReadCompletion::none(),
            StreamState::ReturningAbortedForReads => ReadResult::Aborted,
            StreamState::Shutdown => ReadResult::Ok(self.end_of_stream_buffer()),
            StreamState::ReturningData => match inner.store.get_next_buffer() {
                ReadStatus::Success(buffer) => ReadResult::Ok(buffer),
                ReadStatus::NeedMoreData => return ReadCompletion::none(),
                ReadStatus::ConfigChange => ReadResult::ConfigChanged,
                ReadStatus::EndOfStream => ReadResult::Ok(self.end_of_stream_buffer()),
            },
        };
        match inner.read_cb.take() {
            Some(cb) => ReadCompletion(Some((cb, result))),
            None => ReadCompletion::none(),
        }
    }

    fn end_of_stream_buffer(&self) -> SharedAccessUnit {
        Arc::new(AccessUnit::end_of_stream(self.kind, self.track_id))
    }

    // -----------------------------------------------------------------------
    // Store operations
    // -----------------------------------------------------------------------

    pub fn on_start_of_coded_frame_group(&self, start: MediaTime) {
        self.inner.lock().store.on_start_of_coded_frame_group(start);
    }

    /// Append decode-ordered buffers, completing a latched read if they
    /// satisfy it.
    pub fn append(&self, buffers: Vec<AccessUnit>) -> Result<ReadCompletion> {
        let mut inner = self.inner.lock();
        if inner.state == StreamState::Shutdown {
            return Ok(ReadCompletion::none());
        }
        inner.store.append(buffers)?;
        Ok(self.complete_pending_read_if_possible(&mut inner))
    }

    pub fn remove(&self, start: MediaTime, end: MediaTime, duration: MediaTime) {
        self.inner.lock().store.remove(start, end, duration);
    }

    pub fn evict(&self, media_time: MediaTime, new_data_size: usize) -> bool {
        self.inner
            .lock()
            .store
            .garbage_collect_if_needed(media_time, new_data_size)
    }

    /// # Panics
    ///
    /// If a read is pending; reads are aborted before seeking.
    pub fn seek(&self, time: MediaTime) {
        let mut inner = self.inner.lock();
        assert!(inner.read_cb.is_none(), "seek with a pending {} read", self.kind);
        inner.store.seek(time);
    }

    pub fn is_seek_waiting_for_data(&self) -> bool {
        self.inner.lock().store.is_seek_pending()
    }

    pub fn mark_end_of_stream(&self) -> ReadCompletion {
        let mut inner = self.inner.lock();
        inner.store.mark_end_of_stream();
        self.complete_pending_read_if_possible(&mut inner)
    }

    pub fn unmark_end_of_stream(&self) {
        self.inner.lock().store.unmark_end_of_stream();
    }

    pub fn on_set_duration(&self, duration: MediaTime) {
        self.inner.lock().store.on_set_duration(duration);
    }

    pub fn buffered_ranges(&self, duration: MediaTime) -> Ranges<MediaTime> {
        self.inner.lock().store.buffered_ranges(duration)
    }

    pub fn highest_presentation_timestamp(&self) -> MediaTime {
        self.inner.lock().store.highest_presentation_timestamp()
    }

    pub fn buffered_end(&self) -> MediaTime {
        self.inner.lock().store.buffered_end()
    }

    pub fn buffered_size(&self) -> usize {
        self.inner.lock().store.buffered_size()
    }

    pub fn set_memory_limit(&self, memory_limit: usize) {
        self.inner.lock().store.set_memory_limit(memory_limit);
    }

    pub fn update_config(&self, config: DecoderConfig) -> Result<()> {
        self.inner.lock().store.update_config(config)
    }

    /// Config of the buffers being read. Acknowledges a signalled change.
    pub fn current_config(&self) -> DecoderConfig {
        self.inner.lock().store.current_config().clone()
    }

    pub fn audio_decoder_config(&self) -> Option<AudioDecoderConfig> {
        self.inner.lock().store.audio_decoder_config().cloned()
    }

    pub fn video_decoder_config(&self) -> Option<VideoDecoderConfig> {
        self.inner.lock().store.video_decoder_config().cloned()
    }

    pub fn text_track_config(&self) -> Option<TextTrackConfig> {
        self.inner.lock().store.text_track_config().cloned()
    }
}

impl fmt::Debug for DemuxerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemuxerStream")
            .field("kind", &self.kind)
            .field("track_id", &self.track_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
