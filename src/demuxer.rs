//! The chunk demuxer: routes appended bytes to per-source parsers and serves
//! the resulting streams to playback.
//!
//! All orchestrator state sits behind one [`parking_lot::Mutex`]. Work that
//! calls out of the demuxer (host notifications, init and seek callbacks,
//! completed stream reads) is queued while the lock is held and run after it
//! is released, so callbacks are free to call back into the demuxer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use ms_core::config::DemuxerConfig;
use ms_core::{
    DecoderConfig, Error, MediaKind, MediaTime, PipelineStatus, Ranges, Result, SourceId,
    TextTrackConfig, TrackId,
};
use ms_parser::{InitDataType, InitParameters, Liveness, ParserOptions, ParserRegistry};
use ms_stream::{AppendContext, DemuxerStream, ReadCompletion};

use crate::source::{intersect_buffered_ranges, SourceHost, SourceUnit};

/// Completion callback for [`ChunkDemuxer::initialize`] and
/// [`ChunkDemuxer::seek`].
pub type StatusCallback = Box<dyn FnOnce(PipelineStatus) + Send>;

/// Notifications from the demuxer to the surrounding pipeline.
///
/// Methods are never called while demuxer locks are held.
pub trait DemuxerHost: Send + Sync {
    fn set_duration(&self, duration: MediaTime);

    /// A terminal error that no pending init or seek callback absorbed.
    fn on_demuxer_error(&self, status: PipelineStatus);

    fn on_encrypted_init_data(&self, _init_data_type: InitDataType, _init_data: Vec<u8>) {}

    fn on_new_text_track(&self, _stream: Arc<DemuxerStream>, _config: TextTrackConfig) {}
}

/// Outcome of [`ChunkDemuxer::add_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    Ok,
    /// No parser handles the MIME type and codecs.
    NotSupported,
    /// An audio or video source already exists, or sources can no longer
    /// be added.
    ReachedIdLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxerState {
    WaitingForInit,
    Initializing,
    Initialized,
    Ended,
    ParseError,
    Shutdown,
}

impl fmt::Display for DemuxerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DemuxerState::WaitingForInit => "waiting for init",
            DemuxerState::Initializing => "initializing",
            DemuxerState::Initialized => "initialized",
            DemuxerState::Ended => "ended",
            DemuxerState::ParseError => "parse error",
            DemuxerState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Work queued under the lock and run after it is released.
#[derive(Default)]
struct Deferred(Vec<Box<dyn FnOnce() + Send>>);

impl Deferred {
    fn push(&mut self, f: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(f));
    }

    fn reads(&mut self, completions: impl IntoIterator<Item = ReadCompletion>) {
        for completion in completions {
            if completion.is_pending() {
                self.push(move || completion.run());
            }
        }
    }

    fn run(self) {
        for f in self.0 {
            f();
        }
    }
}

/// Demuxer over incrementally appended media segments.
pub struct ChunkDemuxer {
    registry: ParserRegistry,
    inner: Mutex<Inner>,
}

struct Inner {
    sources: BTreeMap<SourceId, SourceUnit>,
    core: Core,
}

/// Orchestrator state reachable from parser events while a source is
/// borrowed for an append.
struct Core {
    config: DemuxerConfig,
    state: DemuxerState,
    host: Option<Arc<dyn DemuxerHost>>,
    init_cb: Option<StatusCallback>,
    seek_cb: Option<StatusCallback>,
    cancel_next_seek: bool,
    duration: MediaTime,
    user_specified_duration: Option<f64>,
    timeline_offset: Option<SystemTime>,
    liveness: Liveness,
    audio: Option<Arc<DemuxerStream>>,
    video: Option<Arc<DemuxerStream>>,
    text: Vec<Arc<DemuxerStream>>,
    source_id_audio: Option<SourceId>,
    source_id_video: Option<SourceId>,
    init_segments_received: usize,
    init_error: Option<Error>,
    deferred: Deferred,
}

impl ChunkDemuxer {
    pub fn new(config: DemuxerConfig, registry: ParserRegistry) -> Self {
        Self {
            registry,
            inner: Mutex::new(Inner {
                sources: BTreeMap::new(),
                core: Core {
                    config,
                    state: DemuxerState::WaitingForInit,
                    host: None,
                    init_cb: None,
                    seek_cb: None,
                    cancel_next_seek: false,
                    duration: MediaTime::NONE,
                    user_specified_duration: None,
                    timeline_offset: None,
                    liveness: Liveness::Unknown,
                    audio: None,
                    video: None,
                    text: Vec::new(),
                    source_id_audio: None,
                    source_id_video: None,
                    init_segments_received: 0,
                    init_error: None,
                    deferred: Deferred::default(),
                },
            }),
        }
    }

    /// Run `f` under the lock, then everything it deferred.
    fn locked<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (result, deferred) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            (result, std::mem::take(&mut inner.core.deferred))
        };
        deferred.run();
        result
    }

    pub fn state(&self) -> DemuxerState {
        self.inner.lock().core.state
    }

    // -----------------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------------

    /// Start initialization. `init_cb` reports once every registered source
    /// has parsed its first init segment, or with the first terminal error.
    ///
    /// # Panics
    ///
    /// If called twice.
    pub fn initialize(
        &self,
        host: Arc<dyn DemuxerHost>,
        init_cb: impl FnOnce(PipelineStatus) + Send + 'static,
    ) {
        self.locked(|inner| {
            let core = &mut inner.core;
            if core.state == DemuxerState::Shutdown {
                core.deferred
                    .push(move || init_cb(PipelineStatus::DemuxerCouldNotOpen));
                return;
            }
            assert_eq!(core.state, DemuxerState::WaitingForInit, "demuxer initialized twice");
            tracing::debug!("Initializing chunk demuxer");
            core.host = Some(host);
            core.init_cb = Some(Box::new(init_cb));
            core.state = DemuxerState::Initializing;
        });
    }

    /// Seek every stream to `time`. `cb` runs once all streams have data at
    /// the new position, or at end of stream.
    ///
    /// Pending reads must have been aborted with
    /// [`start_waiting_for_seek`](Self::start_waiting_for_seek).
    ///
    /// # Panics
    ///
    /// If another seek is still pending.
    pub fn seek(&self, time: MediaTime, cb: impl FnOnce(PipelineStatus) + Send + 'static) {
        self.locked(|inner| {
            let core = &mut inner.core;
            assert!(core.seek_cb.is_none(), "seek while another seek is pending");

            if !matches!(core.state, DemuxerState::Initialized | DemuxerState::Ended) {
                tracing::debug!(state = %core.state, "Seek in unexpected state");
                core.deferred.push(move || cb(PipelineStatus::AbortError));
                return;
            }
            if core.cancel_next_seek {
                core.cancel_next_seek = false;
                core.deferred.push(move || cb(PipelineStatus::Ok));
                return;
            }

            core.seek_all_streams(time);
            core.start_returning_data();

            if core.is_seek_waiting_for_data() {
                tracing::debug!(%time, "Seek waiting for more data");
                core.seek_cb = Some(Box::new(cb));
                return;
            }
            core.deferred.push(move || cb(PipelineStatus::Ok));
        });
    }

    /// Abort pending reads and reposition streams ahead of a seek.
    pub fn start_waiting_for_seek(&self, time: MediaTime) {
        self.locked(|inner| {
            let core = &mut inner.core;
            match core.state {
                DemuxerState::Initialized | DemuxerState::Ended => {}
                state => {
                    tracing::debug!(%state, "Ignoring start of seek");
                    return;
                }
            }
            debug_assert!(core.seek_cb.is_none());
            core.abort_pending_reads();
            core.seek_all_streams(time);
            core.cancel_next_seek = false;
        });
    }

    /// Abandon the pending seek, completing it successfully at `time`. If
    /// no seek is pending yet, the next one completes immediately.
    pub fn cancel_pending_seek(&self, time: MediaTime) {
        self.locked(|inner| {
            let core = &mut inner.core;
            if core.cancel_next_seek || core.is_terminal() {
                return;
            }
            core.abort_pending_reads();
            core.seek_all_streams(time);
            match core.seek_cb.take() {
                Some(cb) => core.deferred.push(move || cb(PipelineStatus::Ok)),
                None => core.cancel_next_seek = true,
            }
        });
    }

    /// The audio or video stream, once its init segment has been parsed.
    /// Text streams are available through
    /// [`get_text_streams`](Self::get_text_streams).
    pub fn get_stream(&self, kind: MediaKind) -> Option<Arc<DemuxerStream>> {
        let inner = self.inner.lock();
        match kind {
            MediaKind::Audio => inner.core.audio.clone(),
            MediaKind::Video => inner.core.video.clone(),
            MediaKind::Text => None,
        }
    }

    pub fn get_text_streams(&self) -> Vec<Arc<DemuxerStream>> {
        self.inner.lock().core.text.clone()
    }

    pub fn get_start_time(&self) -> MediaTime {
        MediaTime::ZERO
    }

    pub fn get_timeline_offset(&self) -> Option<SystemTime> {
        self.inner.lock().core.timeline_offset
    }

    pub fn liveness(&self) -> Liveness {
        self.inner.lock().core.liveness
    }

    /// [`MediaTime::NONE`] until known, [`MediaTime::INFINITE`] for
    /// unbounded presentations.
    pub fn get_duration(&self) -> MediaTime {
        self.inner.lock().core.duration
    }

    /// Duration in seconds. An explicitly set duration is returned exactly
    /// as given; an unknown duration is NaN.
    pub fn duration_secs(&self) -> f64 {
        let inner = self.inner.lock();
        let core = &inner.core;
        if let Some(seconds) = core.user_specified_duration {
            return seconds;
        }
        if core.duration.is_none() {
            return f64::NAN;
        }
        core.duration.as_secs_f64()
    }

    /// Stop everything. Latched reads complete with end of stream, a pending
    /// seek or init fails with [`PipelineStatus::AbortError`], and later
    /// calls are no-ops.
    pub fn shutdown(&self) {
        self.locked(|inner| {
            let core = &mut inner.core;
            if core.state == DemuxerState::Shutdown {
                return;
            }
            tracing::debug!("Shutting down chunk demuxer");
            core.shutdown_all_streams();
            core.state = DemuxerState::Shutdown;
            for cb in [core.init_cb.take(), core.seek_cb.take()].into_iter().flatten() {
                core.deferred.push(move || cb(PipelineStatus::AbortError));
            }
        });
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Register a source for `mime_type` carrying `codecs`.
    ///
    /// At most one source may carry audio and one video. Sources can only
    /// be added before initialization completes.
    ///
    /// # Panics
    ///
    /// If `id` is already registered.
    pub fn add_id(&self, id: impl Into<SourceId>, mime_type: &str, codecs: &[&str]) -> AddStatus {
        let id = id.into();
        let mut inner = self.inner.lock();
        let Inner { sources, core } = &mut *inner;

        if !matches!(core.state, DemuxerState::WaitingForInit | DemuxerState::Initializing) {
            tracing::debug!(source = %id, state = %core.state, "Rejecting source added after initialization");
            return AddStatus::ReachedIdLimit;
        }
        assert!(!sources.contains_key(&id), "source {id} registered twice");

        let resolved = match self.registry.create(mime_type, codecs) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!(source = %id, error = %e, "Unsupported source");
                return AddStatus::NotSupported;
            }
        };
        if (resolved.has_audio && core.source_id_audio.is_some())
            || (resolved.has_video && core.source_id_video.is_some())
        {
            return AddStatus::ReachedIdLimit;
        }

        if resolved.has_audio {
            core.source_id_audio = Some(id.clone());
        }
        if resolved.has_video {
            core.source_id_video = Some(id.clone());
        }
        let options = ParserOptions {
            ignore_text_tracks: core.config.ignore_text_tracks,
        };
        tracing::info!(source = %id, mime_type, ?codecs, "Added source");
        sources.insert(id.clone(), SourceUnit::new(id, resolved, options));
        AddStatus::Ok
    }

    /// Unregister a source and shut down its streams. Ignored after a
    /// terminal error.
    pub fn remove_id(&self, id: &SourceId) -> Result<()> {
        self.locked(|inner| {
            if inner.core.is_terminal() {
                tracing::debug!(source = %id, state = %inner.core.state, "Ignoring source removal");
                return Ok(());
            }
            let source = inner
                .sources
                .remove(id)
                .ok_or_else(|| Error::not_found("source", id))?;
            let core = &mut inner.core;
            core.deferred.reads(source.shutdown());
            for stream in source.streams() {
                core.forget_stream(stream);
            }
            if core.source_id_audio.as_ref() == Some(id) {
                core.source_id_audio = None;
            }
            if core.source_id_video.as_ref() == Some(id) {
                core.source_id_video = None;
            }
            tracing::info!(source = %id, "Removed source");
            Ok(())
        })
    }

    /// Parse `data` for source `id`.
    ///
    /// `timestamp_offset` is applied to the parsed frames and updated in
    /// place. `init_segment_received` runs once per accepted init segment,
    /// after the demuxer lock is released.
    ///
    /// A config mismatch fails the append and leaves the demuxer usable;
    /// other parse failures are terminal and reported as
    /// [`PipelineStatus::DecodeError`]. After a terminal error appends are
    /// ignored.
    pub fn append_data(
        &self,
        id: &SourceId,
        data: &[u8],
        append_window_start: MediaTime,
        append_window_end: MediaTime,
        timestamp_offset: &mut MediaTime,
        mut init_segment_received: impl FnMut(),
    ) -> Result<()> {
        let (result, init_segments, deferred) = {
            let mut inner = self.inner.lock();
            let Inner { sources, core } = &mut *inner;
            let result = match core.state {
                DemuxerState::Initializing | DemuxerState::Initialized => {
                    match sources.get_mut(id) {
                        Some(source) => core.append(
                            source,
                            data,
                            append_window_start,
                            append_window_end,
                            timestamp_offset,
                        ),
                        None => Err(Error::not_found("source", id)),
                    }
                }
                DemuxerState::ParseError | DemuxerState::Shutdown => {
                    tracing::debug!(source = %id, state = %core.state, "Ignoring appended data");
                    Ok(())
                }
                DemuxerState::WaitingForInit | DemuxerState::Ended => Err(Error::invalid_state(
                    format!("cannot append while {}", core.state),
                )),
            };
            (
                result,
                std::mem::take(&mut core.init_segments_received),
                std::mem::take(&mut core.deferred),
            )
        };
        for _ in 0..init_segments {
            init_segment_received();
        }
        deferred.run();
        result
    }

    /// Remove `[start, end)` from every track of source `id`. An inverted
    /// interval is an [`Error::InvalidState`].
    pub fn remove(&self, id: &SourceId, start: MediaTime, end: MediaTime) -> Result<()> {
        self.locked(|inner| {
            let core = &inner.core;
            if core.is_terminal() {
                return Ok(());
            }
            if start > end {
                return Err(Error::invalid_state(format!(
                    "remove with inverted interval {start}..{end}"
                )));
            }
            let source = inner
                .sources
                .get(id)
                .ok_or_else(|| Error::not_found("source", id))?;
            if start < end {
                source.remove(start, end, core.duration);
            }
            Ok(())
        })
    }

    /// Discard partially parsed data of source `id` so the next append can
    /// start at an unrelated position. Buffered frames are kept and
    /// `timestamp_offset` is left as is.
    pub fn reset_parser_state(
        &self,
        id: &SourceId,
        append_window_start: MediaTime,
        append_window_end: MediaTime,
        timestamp_offset: &mut MediaTime,
    ) -> Result<()> {
        tracing::trace!(
            source = %id,
            %append_window_start,
            %append_window_end,
            %timestamp_offset,
            "Resetting parser state"
        );
        self.locked(|inner| {
            if inner.core.is_terminal() {
                return Ok(());
            }
            let source = inner
                .sources
                .get_mut(id)
                .ok_or_else(|| Error::not_found("source", id))?;
            source.reset_parser_state();
            Ok(())
        })
    }

    pub fn set_sequence_mode(&self, id: &SourceId, sequence_mode: bool) -> Result<()> {
        self.locked(|inner| {
            if inner.core.is_terminal() {
                return Ok(());
            }
            inner
                .sources
                .get_mut(id)
                .ok_or_else(|| Error::not_found("source", id))?
                .set_sequence_mode(sequence_mode)
        })
    }

    pub fn set_group_start_timestamp_if_in_sequence_mode(
        &self,
        id: &SourceId,
        timestamp: MediaTime,
    ) -> Result<()> {
        self.locked(|inner| {
            if inner.core.is_terminal() {
                return Ok(());
            }
            inner
                .sources
                .get_mut(id)
                .ok_or_else(|| Error::not_found("source", id))?
                .set_group_start_timestamp_if_in_sequence_mode(timestamp);
            Ok(())
        })
    }

    /// Set the presentation duration. Data beyond a shrunk duration is
    /// removed. Negative and NaN durations are ignored.
    pub fn set_duration(&self, seconds: f64) {
        if seconds.is_nan() || seconds < 0.0 {
            tracing::warn!(seconds, "Ignoring invalid duration");
            return;
        }
        self.locked(|inner| {
            let Inner { sources, core } = inner;
            if core.is_terminal() {
                return;
            }
            let duration = duration_from_secs(seconds);
            tracing::debug!(seconds, %duration, "Setting duration");
            core.duration = duration;
            core.user_specified_duration = Some(seconds);
            core.notify_host(move |host| host.set_duration(duration));
            for source in sources.values() {
                source.on_set_duration(duration);
            }
        });
    }

    /// Signal that no more data will be appended. A non-OK `status` is a
    /// terminal error. On success the duration shrinks to the buffered end.
    pub fn mark_end_of_stream(&self, status: PipelineStatus) {
        self.locked(|inner| {
            let Inner { sources, core } = inner;
            match core.state {
                DemuxerState::Initialized | DemuxerState::Ended => {}
                DemuxerState::Initializing => {
                    core.report_error(PipelineStatus::DemuxerCouldNotOpen);
                    return;
                }
                state => {
                    tracing::debug!(%state, "Ignoring end of stream");
                    return;
                }
            }

            let was_waiting = core.is_seek_waiting_for_data();
            for source in sources.values() {
                core.deferred.reads(source.mark_end_of_stream());
            }
            if !status.is_ok() {
                core.report_error(status);
                return;
            }
            if was_waiting && !core.is_seek_waiting_for_data() {
                core.complete_seek();
            }
            core.state = DemuxerState::Ended;
            core.decrease_duration_if_necessary(sources);
        });
    }

    pub fn unmark_end_of_stream(&self) {
        self.locked(|inner| {
            let Inner { sources, core } = inner;
            if core.state != DemuxerState::Ended {
                return;
            }
            core.state = DemuxerState::Initialized;
            for source in sources.values() {
                source.unmark_end_of_stream();
            }
        });
    }

    /// Make room for `new_data_size` bytes in source `id`, keeping data
    /// around `current_time`. Returns `false` if not enough could be freed,
    /// the source is unknown or a terminal error has occurred.
    pub fn evict_coded_frames(&self, id: &SourceId, current_time: MediaTime, new_data_size: usize) -> bool {
        let inner = self.inner.lock();
        if inner.core.is_terminal() {
            return false;
        }
        match inner.sources.get(id) {
            Some(source) => source.evict_coded_frames(current_time, new_data_size),
            None => {
                tracing::warn!(source = %id, "Eviction requested for unknown source");
                false
            }
        }
    }

    pub fn is_parsing_media_segment(&self, id: &SourceId) -> bool {
        self.inner
            .lock()
            .sources
            .get(id)
            .is_some_and(SourceUnit::is_parsing_media_segment)
    }

    /// Ranges buffered on every track of source `id`.
    pub fn get_buffered_ranges(&self, id: &SourceId) -> Result<Ranges<MediaTime>> {
        let inner = self.inner.lock();
        let source = inner
            .sources
            .get(id)
            .ok_or_else(|| Error::not_found("source", id))?;
        let core = &inner.core;
        Ok(source.buffered_ranges(core.duration, core.state == DemuxerState::Ended))
    }

    /// Ranges playable across all sources.
    pub fn buffered_ranges(&self) -> Ranges<MediaTime> {
        let inner = self.inner.lock();
        inner.core.buffered_ranges(&inner.sources)
    }

    pub fn get_highest_presentation_timestamp(&self, id: &SourceId) -> Result<MediaTime> {
        let inner = self.inner.lock();
        inner
            .sources
            .get(id)
            .map(SourceUnit::highest_presentation_timestamp)
            .ok_or_else(|| Error::not_found("source", id))
    }
}

impl fmt::Debug for ChunkDemuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChunkDemuxer")
            .field("state", &inner.core.state)
            .field("duration", &inner.core.duration)
            .field("sources", &inner.sources.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Clamp an explicitly set duration into the representable range.
fn duration_from_secs(seconds: f64) -> MediaTime {
    const MIN: MediaTime = MediaTime::from_micros(1);
    const MAX: MediaTime = MediaTime::from_micros(i64::MAX - 1);
    if seconds == f64::INFINITY {
        MediaTime::INFINITE
    } else if seconds < MIN.as_secs_f64() {
        MIN
    } else if seconds > MAX.as_secs_f64() {
        MAX
    } else {
        MediaTime::from_secs_f64(seconds)
    }
}

impl Core {
    fn append(
        &mut self,
        source: &mut SourceUnit,
        data: &[u8],
        append_window_start: MediaTime,
        append_window_end: MediaTime,
        timestamp_offset: &mut MediaTime,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let was_waiting = self.is_seek_waiting_for_data();

        let mut ctx = AppendContext::new(append_window_start, append_window_end, *timestamp_offset);
        let result = source.append(data, &mut ctx, self);
        *timestamp_offset = ctx.timestamp_offset;
        self.deferred.reads(ctx.take_completions());

        let init_error = self.init_error.take();
        if let Err(e) = result {
            if !e.is_recoverable() {
                self.report_error(PipelineStatus::DecodeError);
            }
            return Err(e);
        }
        if let Some(e) = init_error {
            return Err(e);
        }

        if was_waiting && !self.is_seek_waiting_for_data() {
            self.complete_seek();
        }
        Ok(())
    }

    fn streams(&self) -> impl Iterator<Item = &Arc<DemuxerStream>> + '_ {
        self.audio
            .iter()
            .chain(self.video.iter())
            .chain(self.text.iter())
    }

    fn forget_stream(&mut self, stream: &Arc<DemuxerStream>) {
        if self.audio.as_ref().is_some_and(|s| Arc::ptr_eq(s, stream)) {
            self.audio = None;
        }
        if self.video.as_ref().is_some_and(|s| Arc::ptr_eq(s, stream)) {
            self.video = None;
        }
        self.text.retain(|s| !Arc::ptr_eq(s, stream));
    }

    /// A parse error or shutdown has made ingestion calls no-ops.
    fn is_terminal(&self) -> bool {
        matches!(self.state, DemuxerState::ParseError | DemuxerState::Shutdown)
    }

    fn is_seek_waiting_for_data(&self) -> bool {
        self.streams().any(|s| s.is_seek_waiting_for_data())
    }

    fn seek_all_streams(&self, time: MediaTime) {
        for stream in self.streams() {
            stream.seek(time);
        }
    }

    fn start_returning_data(&self) {
        for stream in self.streams() {
            stream.start_returning_data();
        }
    }

    fn abort_pending_reads(&mut self) {
        let completions: Vec<_> = self.streams().map(|s| s.abort_reads()).collect();
        self.deferred.reads(completions);
    }

    fn shutdown_all_streams(&mut self) {
        let completions: Vec<_> = self.streams().map(|s| s.shutdown()).collect();
        self.deferred.reads(completions);
    }

    fn complete_seek(&mut self) {
        if let Some(cb) = self.seek_cb.take() {
            tracing::debug!("Seek completed with newly available data");
            self.deferred.push(move || cb(PipelineStatus::Ok));
        }
    }

    fn notify_host(&mut self, f: impl FnOnce(&dyn DemuxerHost) + Send + 'static) {
        if let Some(host) = self.host.clone() {
            self.deferred.push(move || f(host.as_ref()));
        }
    }

    /// Enter the terminal error state. The error goes to a pending init
    /// callback, else to a pending seek callback, else to the host.
    fn report_error(&mut self, status: PipelineStatus) {
        debug_assert!(!status.is_ok());
        if self.is_terminal() {
            return;
        }
        tracing::error!(%status, state = %self.state, "Demuxer error");
        self.state = DemuxerState::ParseError;

        if let Some(cb) = self.init_cb.take() {
            self.deferred.push(move || cb(status));
            return;
        }
        let seek_cb = self.seek_cb.take();
        self.shutdown_all_streams();
        match seek_cb {
            Some(cb) => self.deferred.push(move || cb(status)),
            None => self.notify_host(move |host| host.on_demuxer_error(status)),
        }
    }

    fn update_duration(&mut self, duration: MediaTime) {
        debug_assert_ne!(self.duration, duration);
        tracing::debug!(old = %self.duration, new = %duration, "Duration changed");
        self.duration = duration;
        self.user_specified_duration = None;
        self.notify_host(move |host| host.set_duration(duration));
    }

    fn buffered_ranges(&self, sources: &BTreeMap<SourceId, SourceUnit>) -> Ranges<MediaTime> {
        let ended = self.state == DemuxerState::Ended;
        let per_source: Vec<_> = sources
            .values()
            .map(|source| source.buffered_ranges(self.duration, ended))
            .collect();
        intersect_buffered_ranges(&per_source, ended)
    }

    fn decrease_duration_if_necessary(&mut self, sources: &BTreeMap<SourceId, SourceUnit>) {
        let Some((_, buffered_end)) = self.buffered_ranges(sources).last() else {
            return;
        };
        if buffered_end < self.duration {
            self.update_duration(buffered_end);
        }
    }
}

impl SourceHost for Core {
    fn create_stream(&mut self, track_id: TrackId, config: &DecoderConfig) -> Option<Arc<DemuxerStream>> {
        let kind = config.kind();
        let taken = match kind {
            MediaKind::Audio => self.audio.is_some(),
            MediaKind::Video => self.video.is_some(),
            MediaKind::Text => false,
        };
        if taken {
            return None;
        }

        let stream = DemuxerStream::new(
            track_id,
            config.clone(),
            self.config.memory_limit(kind),
            self.config.splice_frames_enabled,
        );
        // Tracks declared after initialization never see the initial seek.
        if matches!(self.state, DemuxerState::Initialized | DemuxerState::Ended) {
            stream.start_returning_data();
        }
        match kind {
            MediaKind::Audio => self.audio = Some(Arc::clone(&stream)),
            MediaKind::Video => self.video = Some(Arc::clone(&stream)),
            MediaKind::Text => self.text.push(Arc::clone(&stream)),
        }
        Some(stream)
    }

    fn on_init_segment_received(&mut self) {
        self.init_segments_received += 1;
    }

    fn on_source_init_done(&mut self, params: &InitParameters) {
        if self.state != DemuxerState::Initializing {
            return;
        }
        if self.audio.is_none() && self.video.is_none() {
            self.init_error = Some(Error::unsupported("init segment declared no audio or video"));
            self.report_error(PipelineStatus::DemuxerCouldNotOpen);
            return;
        }

        if params.duration.is_some() && params.duration != MediaTime::ZERO && self.duration.is_none() {
            self.update_duration(params.duration);
        }
        if let Some(offset) = params.timeline_offset {
            if self.timeline_offset.is_some_and(|current| current != offset) {
                self.init_error = Some(Error::config_mismatch(
                    "timeline offset differs between sources",
                ));
                self.report_error(PipelineStatus::DemuxerCouldNotOpen);
                return;
            }
            self.timeline_offset = Some(offset);
        }
        if params.liveness != Liveness::Unknown {
            self.liveness = params.liveness;
        }

        // Wait for every declared audio and video source.
        if (self.source_id_audio.is_some() && self.audio.is_none())
            || (self.source_id_video.is_some() && self.video.is_none())
        {
            return;
        }

        self.seek_all_streams(MediaTime::ZERO);
        self.start_returning_data();
        if self.duration.is_none() {
            self.duration = MediaTime::INFINITE;
        }
        self.state = DemuxerState::Initialized;
        tracing::info!(duration = %self.duration, "Chunk demuxer initialized");
        if let Some(cb) = self.init_cb.take() {
            self.deferred.push(move || cb(PipelineStatus::Ok));
        }
    }

    fn on_new_text_track(&mut self, stream: &Arc<DemuxerStream>, config: &TextTrackConfig) {
        let stream = Arc::clone(stream);
        let config = config.clone();
        self.notify_host(move |host| host.on_new_text_track(stream, config));
    }

    fn on_encrypted_init_data(&mut self, init_data_type: InitDataType, init_data: Vec<u8>) {
        self.notify_host(move |host| host.on_encrypted_init_data(init_data_type, init_data));
    }

    fn on_group_end(&mut self, group_end: MediaTime) {
        if group_end.is_infinite() || group_end <= self.duration {
            return;
        }
        self.update_duration(group_end);
    }
}
