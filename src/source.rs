//! One registered source: a parser, its frame processor and the tracks its
//! init segments declared.
//!
//! Appends run the parser against an [`AppendSession`], which receives the
//! parser events, merges emitted frames into decode order and hands them to
//! the [`FrameProcessor`]. Anything the session cannot decide alone, like
//! creating a presentation-wide stream, goes through [`SourceHost`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ms_core::{
    AccessUnit, DecoderConfig, Error, MediaTime, Ranges, Result, SourceId, TextTrackConfig,
    TrackId,
};
use ms_parser::{
    merge_buffer_queues, BufferQueues, InitDataType, InitParameters, MediaConfigs, ParserEvents,
    ParserOptions, ResolvedParser, StreamParser, TextConfigMap,
};
use ms_stream::{AppendContext, DemuxerStream, FrameProcessor, ReadCompletion};

/// Presentation-wide services a source needs while parsing.
pub trait SourceHost {
    /// Create the stream for a newly declared track. Returns `None` if the
    /// presentation cannot take another stream of that kind.
    fn create_stream(&mut self, track_id: TrackId, config: &DecoderConfig) -> Option<Arc<DemuxerStream>>;

    /// An init segment was accepted.
    fn on_init_segment_received(&mut self);

    /// The source's first init segment is complete.
    fn on_source_init_done(&mut self, params: &InitParameters);

    fn on_new_text_track(&mut self, stream: &Arc<DemuxerStream>, config: &TextTrackConfig);

    fn on_encrypted_init_data(&mut self, init_data_type: InitDataType, init_data: Vec<u8>);

    /// A coded frame group now extends to `group_end`.
    fn on_group_end(&mut self, group_end: MediaTime);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    PendingConfig,
    PendingInit,
    Initialized,
}

/// A source buffer: parser, frame processor and per-track streams.
pub struct SourceUnit {
    id: SourceId,
    parser: Box<dyn StreamParser>,
    parser_failed: bool,
    tracks: SourceTracks,
}

/// Everything parser events touch during an append.
struct SourceTracks {
    source_id: SourceId,
    has_audio: bool,
    has_video: bool,
    init_state: InitState,
    frame_processor: FrameProcessor,
    audio: Option<Arc<DemuxerStream>>,
    video: Option<Arc<DemuxerStream>>,
    text: BTreeMap<TrackId, Arc<DemuxerStream>>,
    parsing_media_segment: bool,
    segment_had_audio: bool,
    segment_had_video: bool,
    auto_update_timestamp_offset: bool,
}

impl SourceUnit {
    pub fn new(id: SourceId, resolved: ResolvedParser, options: ParserOptions) -> Self {
        let ResolvedParser {
            mut parser,
            has_audio,
            has_video,
            ..
        } = resolved;
        parser.init(options);
        Self {
            parser,
            parser_failed: false,
            tracks: SourceTracks {
                source_id: id.clone(),
                has_audio,
                has_video,
                init_state: InitState::PendingConfig,
                frame_processor: FrameProcessor::new(),
                audio: None,
                video: None,
                text: BTreeMap::new(),
                parsing_media_segment: false,
                segment_had_audio: false,
                segment_had_video: false,
                auto_update_timestamp_offset: false,
            },
            id,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.has_audio
    }

    pub fn has_video(&self) -> bool {
        self.tracks.has_video
    }

    /// Whether the first init segment has been fully processed.
    pub fn is_initialized(&self) -> bool {
        self.tracks.init_state == InitState::Initialized
    }

    pub fn is_parsing_media_segment(&self) -> bool {
        self.tracks.parsing_media_segment
    }

    /// Feed appended bytes to the parser.
    ///
    /// On error the parser is left failed and every later append is
    /// rejected with [`Error::InvalidState`] until
    /// [`reset_parser_state`](Self::reset_parser_state). Frames accepted
    /// before the error stay buffered.
    pub fn append<H>(&mut self, data: &[u8], ctx: &mut AppendContext, host: &mut H) -> Result<()>
    where
        H: SourceHost + ?Sized,
    {
        if self.parser_failed {
            return Err(Error::invalid_state(format!(
                "source {} must be reset after a failed append",
                self.id
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut session = AppendSession {
            tracks: &mut self.tracks,
            ctx,
            host,
            error: None,
        };
        let parsed = self.parser.parse(data, &mut session);
        match (parsed, session.error.take()) {
            (Ok(()), None) => Ok(()),
            (_, Some(e)) | (Err(e), None) => {
                tracing::warn!(source = %self.id, error = %e, "Stream parsing failed");
                self.parser_failed = true;
                Err(e)
            }
        }
    }

    /// Drop partially parsed input and transient frame processing state.
    /// Buffered data is kept.
    pub fn reset_parser_state(&mut self) {
        self.parser.flush();
        self.parser_failed = false;
        let tracks = &mut self.tracks;
        tracks.frame_processor.reset();
        tracks.parsing_media_segment = false;
        tracks.segment_had_audio = false;
        tracks.segment_had_video = false;
    }

    pub fn set_sequence_mode(&mut self, sequence_mode: bool) -> Result<()> {
        if self.tracks.parsing_media_segment {
            return Err(Error::invalid_state(format!(
                "source {} is in the middle of a media segment",
                self.id
            )));
        }
        self.tracks.frame_processor.set_sequence_mode(sequence_mode);
        Ok(())
    }

    pub fn set_group_start_timestamp_if_in_sequence_mode(&mut self, timestamp: MediaTime) {
        self.tracks
            .frame_processor
            .set_group_start_timestamp_if_in_sequence_mode(timestamp);
    }

    /// Make room for `new_data_size` more bytes, never evicting data around
    /// `media_time`. Returns `false` if some track could not free enough.
    ///
    /// With both audio and video the budget is split by their buffered
    /// sizes; if either is empty video gets 7/8 of it. Each text track is
    /// checked against the whole budget.
    pub fn evict_coded_frames(&self, media_time: MediaTime, new_data_size: usize) -> bool {
        let tracks = &self.tracks;
        let (audio_budget, video_budget) = match (&tracks.audio, &tracks.video) {
            (Some(audio), Some(video)) => {
                split_eviction_budget(new_data_size, audio.buffered_size(), video.buffered_size())
            }
            (Some(_), None) => (new_data_size, 0),
            (None, Some(_)) => (0, new_data_size),
            (None, None) => (0, 0),
        };
        tracing::debug!(
            source = %self.id,
            %media_time,
            new_data_size,
            audio_budget,
            video_budget,
            "Evicting coded frames"
        );

        let mut success = true;
        if let Some(audio) = &tracks.audio {
            success &= audio.evict(media_time, audio_budget);
        }
        if let Some(video) = &tracks.video {
            success &= video.evict(media_time, video_budget);
        }
        for text in tracks.text.values() {
            success &= text.evict(media_time, new_data_size);
        }
        success
    }

    pub fn remove(&self, start: MediaTime, end: MediaTime, duration: MediaTime) {
        for stream in self.streams() {
            stream.remove(start, end, duration);
        }
    }

    /// Ranges buffered on every track of this source, clamped to `duration`.
    pub fn buffered_ranges(&self, duration: MediaTime, ended: bool) -> Ranges<MediaTime> {
        let per_track: Vec<_> = self
            .streams()
            .map(|stream| stream.buffered_ranges(duration))
            .collect();
        intersect_buffered_ranges(&per_track, ended)
    }

    pub fn highest_presentation_timestamp(&self) -> MediaTime {
        self.streams()
            .map(|stream| stream.highest_presentation_timestamp())
            .fold(MediaTime::ZERO, MediaTime::max)
    }

    pub fn mark_end_of_stream(&self) -> Vec<ReadCompletion> {
        self.streams().map(|stream| stream.mark_end_of_stream()).collect()
    }

    pub fn unmark_end_of_stream(&self) {
        for stream in self.streams() {
            stream.unmark_end_of_stream();
        }
    }

    pub fn on_set_duration(&self, duration: MediaTime) {
        for stream in self.streams() {
            stream.on_set_duration(duration);
        }
    }

    pub fn shutdown(&self) -> Vec<ReadCompletion> {
        self.streams().map(|stream| stream.shutdown()).collect()
    }

    /// Every stream this source created, audio and video first.
    pub fn streams(&self) -> impl Iterator<Item = &Arc<DemuxerStream>> + '_ {
        self.tracks
            .audio
            .iter()
            .chain(self.tracks.video.iter())
            .chain(self.tracks.text.values())
    }
}

impl std::fmt::Debug for SourceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceUnit")
            .field("id", &self.id)
            .field("has_audio", &self.tracks.has_audio)
            .field("has_video", &self.tracks.has_video)
            .field("init_state", &self.tracks.init_state)
            .field("parser_failed", &self.parser_failed)
            .field("text_tracks", &self.tracks.text.len())
            .finish_non_exhaustive()
    }
}

/// `budget * part / total` without intermediate overflow.
/// Share `budget` between audio and video in proportion to what each has
/// buffered. The two shares always add up to `budget`.
fn split_eviction_budget(budget: usize, audio_size: usize, video_size: usize) -> (usize, usize) {
    let audio_budget = if audio_size == 0 || video_size == 0 {
        budget / 8
    } else {
        proportion(budget, audio_size, audio_size + video_size)
    };
    (audio_budget, budget - audio_budget)
}

fn proportion(budget: usize, part: usize, total: usize) -> usize {
    (budget as u128 * part as u128 / total as u128) as usize
}

/// Intersect per-track buffered ranges.
///
/// Nothing is reported until some track has buffered data. When `ended`,
/// each track's last range is stretched to the highest end of any track so
/// that a track finishing early does not cut the presentation short.
pub fn intersect_buffered_ranges(per_track: &[Ranges<MediaTime>], ended: bool) -> Ranges<MediaTime> {
    let highest_end = per_track
        .iter()
        .filter_map(Ranges::last)
        .map(|(_, end)| end)
        .fold(MediaTime::ZERO, MediaTime::max);
    if highest_end == MediaTime::ZERO {
        return Ranges::new();
    }

    let mut intersection = Ranges::new();
    intersection.add(MediaTime::ZERO, highest_end);
    for ranges in per_track {
        let mut ranges = ranges.clone();
        if ended {
            if let Some((last_start, _)) = ranges.last() {
                ranges.add(last_start, highest_end);
            }
        }
        intersection = intersection.intersection_with(&ranges);
    }
    intersection
}

fn text_configs_match(a: &TextTrackConfig, b: &TextTrackConfig) -> bool {
    a.kind == b.kind && a.label == b.label && a.language == b.language
}

impl SourceTracks {
    fn apply_configs<H>(&mut self, configs: MediaConfigs, host: &mut H) -> Result<()>
    where
        H: SourceHost + ?Sized,
    {
        if self.has_audio != configs.audio.is_some() {
            return Err(Error::config_mismatch(format!(
                "init segment audio presence does not match the codecs of source {}",
                self.source_id
            )));
        }
        if self.has_video != configs.video.is_some() {
            return Err(Error::config_mismatch(format!(
                "init segment video presence does not match the codecs of source {}",
                self.source_id
            )));
        }

        if let Some(config) = configs.audio {
            let stream = match &self.audio {
                Some(stream) => Arc::clone(stream),
                None => {
                    let stream = self.create_track(TrackId::AUDIO, config.clone().into(), host)?;
                    self.audio = Some(Arc::clone(&stream));
                    stream
                }
            };
            self.frame_processor.on_possible_audio_config_update(&config);
            stream.update_config(config.into())?;
        }

        if let Some(config) = configs.video {
            let stream = match &self.video {
                Some(stream) => Arc::clone(stream),
                None => {
                    let stream = self.create_track(TrackId::VIDEO, config.clone().into(), host)?;
                    self.video = Some(Arc::clone(&stream));
                    stream
                }
            };
            stream.update_config(config.into())?;
        }

        self.apply_text_configs(configs.text, host)?;

        self.frame_processor.set_all_track_buffers_need_random_access_point();
        if self.init_state == InitState::PendingConfig {
            self.init_state = InitState::PendingInit;
        }
        Ok(())
    }

    fn apply_text_configs<H>(&mut self, configs: TextConfigMap, host: &mut H) -> Result<()>
    where
        H: SourceHost + ?Sized,
    {
        if self.text.is_empty() {
            for (track_id, config) in configs {
                let stream = self.create_track(track_id, config.clone().into(), host)?;
                host.on_new_text_track(&stream, &config);
                self.text.insert(track_id, stream);
            }
            return Ok(());
        }

        if configs.len() != self.text.len() {
            return Err(Error::config_mismatch("the number of text tracks changed"));
        }

        if self.text.len() == 1 {
            // A lone text track may be renumbered between init segments.
            let (Some((&new_id, new_config)), Some((&old_id, stream))) =
                (configs.iter().next(), self.text.iter().next())
            else {
                return Ok(());
            };
            let matches = stream
                .text_track_config()
                .is_some_and(|old| text_configs_match(&old, new_config));
            if !matches {
                return Err(Error::config_mismatch(
                    "new text track config does not match the old one",
                ));
            }
            if new_id != old_id {
                let stream = Arc::clone(stream);
                if !self.frame_processor.update_track(old_id, new_id) {
                    return Err(Error::config_mismatch(format!(
                        "could not renumber text track {old_id} to {new_id}"
                    )));
                }
                self.text.clear();
                self.text.insert(new_id, stream);
            }
            return Ok(());
        }

        for (track_id, config) in &configs {
            let stream = self.text.get(track_id).ok_or_else(|| {
                Error::config_mismatch(format!("unexpected text track {track_id}"))
            })?;
            let matches = stream
                .text_track_config()
                .is_some_and(|old| text_configs_match(&old, config));
            if !matches {
                return Err(Error::config_mismatch(format!(
                    "new config for text track {track_id} does not match the old one"
                )));
            }
        }
        Ok(())
    }

    fn create_track<H>(
        &mut self,
        track_id: TrackId,
        config: DecoderConfig,
        host: &mut H,
    ) -> Result<Arc<DemuxerStream>>
    where
        H: SourceHost + ?Sized,
    {
        let kind = config.kind();
        let stream = host.create_stream(track_id, &config).ok_or_else(|| {
            Error::config_mismatch(format!("the presentation already has a {kind} stream"))
        })?;
        if !self.frame_processor.add_track(track_id, &stream) {
            return Err(Error::config_mismatch(format!(
                "track {track_id} declared twice"
            )));
        }
        tracing::debug!(source = %self.source_id, %track_id, %kind, "Created stream");
        Ok(stream)
    }

    fn process_buffers<H>(
        &mut self,
        buffers: BufferQueues,
        ctx: &mut AppendContext,
        host: &mut H,
    ) -> Result<()>
    where
        H: SourceHost + ?Sized,
    {
        if !self.parsing_media_segment {
            return Err(Error::parse("coded frames outside of a media segment"));
        }
        self.segment_had_audio |= !buffers.audio.is_empty();
        self.segment_had_video |= !buffers.video.is_empty();

        let offset_before = ctx.timestamp_offset;
        let updated_offset = if self.auto_update_timestamp_offset {
            let audio_end = buffers.audio.back().map(AccessUnit::end_timestamp);
            let video_end = buffers.video.back().map(AccessUnit::end_timestamp);
            match (audio_end, video_end) {
                (Some(audio), Some(video)) => Some(offset_before + audio.min(video)),
                (Some(end), None) | (None, Some(end)) => Some(offset_before + end),
                (None, None) => None,
            }
        } else {
            None
        };

        let mut merged = Vec::with_capacity(buffers.len());
        merge_buffer_queues(buffers, &mut merged)?;

        let group_end = self
            .frame_processor
            .process_frames(merged, ctx)
            .map_err(|e| match e {
                Error::NotFound { .. } => Error::parse(e.to_string()),
                other => other,
            })?;
        if group_end.is_some() {
            host.on_group_end(group_end);
        }

        // Sequence mode may already have moved the offset.
        if let Some(offset) = updated_offset {
            if ctx.timestamp_offset == offset_before {
                ctx.timestamp_offset = offset;
            }
        }
        Ok(())
    }
}

/// Parser event sink for a single append.
struct AppendSession<'a, H: SourceHost + ?Sized> {
    tracks: &'a mut SourceTracks,
    ctx: &'a mut AppendContext,
    host: &'a mut H,
    error: Option<Error>,
}

impl<H: SourceHost + ?Sized> AppendSession<'_, H> {
    fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

impl<H: SourceHost + ?Sized> ParserEvents for AppendSession<'_, H> {
    fn on_init(&mut self, params: InitParameters) {
        if self.tracks.init_state != InitState::PendingInit {
            self.fail(Error::parse(
                "init parameters reported without a new first init segment",
            ));
            return;
        }
        self.tracks.init_state = InitState::Initialized;
        self.tracks.auto_update_timestamp_offset = params.auto_update_timestamp_offset;
        self.host.on_source_init_done(&params);
    }

    fn on_new_configs(&mut self, configs: MediaConfigs) -> bool {
        match self.tracks.apply_configs(configs, &mut *self.host) {
            Ok(()) => {
                self.host.on_init_segment_received();
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn on_new_media_segment(&mut self) {
        self.tracks.parsing_media_segment = true;
        self.tracks.segment_had_audio = false;
        self.tracks.segment_had_video = false;
    }

    fn on_new_buffers(&mut self, buffers: BufferQueues) -> bool {
        let processed = self
            .tracks
            .process_buffers(buffers, &mut *self.ctx, &mut *self.host);
        match processed {
            Ok(()) => true,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn on_end_of_media_segment(&mut self) {
        let tracks = &mut *self.tracks;
        tracks.parsing_media_segment = false;
        if tracks.audio.is_some() && !tracks.segment_had_audio {
            tracing::debug!(
                source = %tracks.source_id,
                "Media segment contained no audio frames; discontinuity detection may differ"
            );
        }
        if tracks.video.is_some() && !tracks.segment_had_video {
            tracing::debug!(
                source = %tracks.source_id,
                "Media segment contained no video frames; discontinuity detection may differ"
            );
        }
    }

    fn on_encrypted_init_data(&mut self, init_data_type: InitDataType, init_data: Vec<u8>) {
        self.host.on_encrypted_init_data(init_data_type, init_data);
    }
}
