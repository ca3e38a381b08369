//! Coded frame processing.
//!
//! [`FrameProcessor`] takes the decode-ordered frames of one append, applies
//! the timestamp offset, detects discontinuities, trims audio against the
//! append window and hands accepted frames to each track's
//! [`DemuxerStream`]. Streams are held through [`Weak`] handles; the
//! orchestrator owns them.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use ms_core::{
    AccessUnit, AudioDecoderConfig, DecodeTimestamp, DiscardPadding, Error, MediaKind, MediaTime,
    Result, TrackId,
};

use crate::stream::{DemuxerStream, ReadCompletion};

/// Per-call state of one append: the append window, the running timestamp
/// offset and the read completions to run once locks are released.
#[derive(Debug)]
pub struct AppendContext {
    pub append_window_start: MediaTime,
    pub append_window_end: MediaTime,
    pub timestamp_offset: MediaTime,
    pub completions: Vec<ReadCompletion>,
}

impl AppendContext {
    pub fn new(
        append_window_start: MediaTime,
        append_window_end: MediaTime,
        timestamp_offset: MediaTime,
    ) -> Self {
        Self {
            append_window_start,
            append_window_end,
            timestamp_offset,
            completions: Vec::new(),
        }
    }

    /// Open window `[0, inf)` with no offset.
    pub fn unbounded() -> Self {
        Self::new(MediaTime::ZERO, MediaTime::INFINITE, MediaTime::ZERO)
    }

    pub fn take_completions(&mut self) -> Vec<ReadCompletion> {
        std::mem::take(&mut self.completions)
    }
}

/// Transient per-track state.
struct MseTrackState {
    stream: Weak<DemuxerStream>,
    last_decode_timestamp: DecodeTimestamp,
    last_frame_duration: MediaTime,
    highest_presentation_timestamp: MediaTime,
    needs_random_access_point: bool,
    processed_frames: Vec<AccessUnit>,
}

impl MseTrackState {
    fn new(stream: Weak<DemuxerStream>) -> Self {
        Self {
            stream,
            last_decode_timestamp: DecodeTimestamp::NONE,
            last_frame_duration: MediaTime::NONE,
            highest_presentation_timestamp: MediaTime::NONE,
            needs_random_access_point: true,
            processed_frames: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.last_decode_timestamp = DecodeTimestamp::NONE;
        self.last_frame_duration = MediaTime::NONE;
        self.highest_presentation_timestamp = MediaTime::NONE;
        self.needs_random_access_point = true;
    }

    fn enqueue(&mut self, frame: AccessUnit) {
        self.last_decode_timestamp = frame.decode_timestamp;
        self.last_frame_duration = frame.duration;
        self.highest_presentation_timestamp =
            self.highest_presentation_timestamp.max(frame.timestamp);
        self.processed_frames.push(frame);
    }

    fn flush(&mut self, completions: &mut Vec<ReadCompletion>) -> Result<()> {
        if self.processed_frames.is_empty() {
            return Ok(());
        }
        let frames = std::mem::take(&mut self.processed_frames);
        match self.stream.upgrade() {
            Some(stream) => completions.push(stream.append(frames)?),
            None => tracing::debug!(count = frames.len(), "Dropping frames for a removed stream"),
        }
        Ok(())
    }
}

pub struct FrameProcessor {
    tracks: BTreeMap<TrackId, MseTrackState>,
    sequence_mode: bool,
    /// Pending group start in sequence mode.
    group_start_timestamp: MediaTime,
    group_end_timestamp: MediaTime,
    in_coded_frame_group: bool,
    /// Last audio frame dropped before the append window start.
    audio_preroll_buffer: Option<AccessUnit>,
    /// Audio sample period; preroll must abut within this.
    sample_duration: MediaTime,
}

impl Default for FrameProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProcessor {
    pub fn new() -> Self {
        Self {
            tracks: BTreeMap::new(),
            sequence_mode: false,
            group_start_timestamp: MediaTime::NONE,
            group_end_timestamp: MediaTime::NONE,
            in_coded_frame_group: false,
            audio_preroll_buffer: None,
            sample_duration: MediaTime::ZERO,
        }
    }

    /// Register a track. Returns `false` if `id` is already registered.
    pub fn add_track(&mut self, id: TrackId, stream: &Arc<DemuxerStream>) -> bool {
        if self.tracks.contains_key(&id) {
            return false;
        }
        self.tracks.insert(id, MseTrackState::new(Arc::downgrade(stream)));
        true
    }

    /// Re-key a track after its parser renumbered it. Fails if `old_id` is
    /// unknown or `new_id` is taken.
    pub fn update_track(&mut self, old_id: TrackId, new_id: TrackId) -> bool {
        if old_id == new_id {
            return self.tracks.contains_key(&old_id);
        }
        if self.tracks.contains_key(&new_id) {
            return false;
        }
        match self.tracks.remove(&old_id) {
            Some(track) => {
                self.tracks.insert(new_id, track);
                true
            }
            None => false,
        }
    }

    pub fn has_track(&self, id: TrackId) -> bool {
        self.tracks.contains_key(&id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn sequence_mode(&self) -> bool {
        self.sequence_mode
    }

    /// Entering sequence mode starts the next group where the last ended.
    pub fn set_sequence_mode(&mut self, sequence_mode: bool) {
        if sequence_mode {
            self.group_start_timestamp = self.group_end_timestamp;
        }
        self.sequence_mode = sequence_mode;
    }

    pub fn set_group_start_timestamp_if_in_sequence_mode(&mut self, timestamp: MediaTime) {
        if self.sequence_mode {
            self.group_start_timestamp = timestamp;
        }
    }

    pub fn group_end_timestamp(&self) -> MediaTime {
        self.group_end_timestamp
    }

    pub fn in_coded_frame_group(&self) -> bool {
        self.in_coded_frame_group
    }

    /// Track a new audio config; a stashed preroll buffer no longer applies.
    pub fn on_possible_audio_config_update(&mut self, config: &AudioDecoderConfig) {
        self.audio_preroll_buffer = None;
        self.sample_duration = config.sample_duration();
    }

    pub fn set_all_track_buffers_need_random_access_point(&mut self) {
        for track in self.tracks.values_mut() {
            track.needs_random_access_point = true;
        }
    }

    /// Forget transient state after a parser reset. Pending frames should
    /// have been flushed by the append that produced them.
    pub fn reset(&mut self) {
        for track in self.tracks.values_mut() {
            track.reset();
            track.processed_frames.clear();
        }
        self.audio_preroll_buffer = None;
        if self.sequence_mode {
            self.group_start_timestamp = self.group_end_timestamp;
        } else {
            self.in_coded_frame_group = false;
        }
    }

    /// Process the frames of one append and hand them to their streams.
    ///
    /// Returns the group end timestamp as a duration hint. On error the
    /// frames accepted so far are still stored.
    pub fn process_frames(
        &mut self,
        frames: Vec<AccessUnit>,
        ctx: &mut AppendContext,
    ) -> Result<MediaTime> {
        for frame in frames {
            if let Err(e) = self.process_frame(frame, ctx) {
                self.flush_processed_frames(ctx)?;
                return Err(e);
            }
        }
        self.flush_processed_frames(ctx)?;
        Ok(self.group_end_timestamp)
    }

    fn process_frame(&mut self, mut frame: AccessUnit, ctx: &mut AppendContext) -> Result<()> {
        if frame.timestamp.is_none() || frame.decode_timestamp.is_none() {
            return Err(Error::invalid_timestamp(format!(
                "{} frame without presentation or decode timestamp",
                frame.kind()
            )));
        }
        if frame.duration.is_none() || frame.duration.is_negative() {
            return Err(Error::invalid_timestamp(format!(
                "{} frame at {} has invalid duration {}",
                frame.kind(),
                frame.timestamp,
                frame.duration
            )));
        }

        let original_timestamp = frame.timestamp;
        let original_decode_timestamp = frame.decode_timestamp;
        let mut retried = false;

        loop {
            if self.sequence_mode && self.group_start_timestamp.is_some() {
                ctx.timestamp_offset = self.group_start_timestamp - original_timestamp;
                self.group_end_timestamp = self.group_start_timestamp;
                self.set_all_track_buffers_need_random_access_point();
                self.group_start_timestamp = MediaTime::NONE;
            }

            frame.timestamp = original_timestamp;
            frame.decode_timestamp = original_decode_timestamp;
            if ctx.timestamp_offset != MediaTime::ZERO {
                frame.timestamp += ctx.timestamp_offset;
                frame.decode_timestamp += ctx.timestamp_offset;
            }
            let track_id = frame.track_id();
            let Some(track) = self.tracks.get(&track_id) else {
                return Err(Error::not_found("track", track_id));
            };

            if track.last_decode_timestamp.is_some() {
                let delta = frame.decode_timestamp - track.last_decode_timestamp;
                if delta.is_negative() || delta > track.last_frame_duration * 2 {
                    assert!(!retried, "discontinuity detected twice for one frame");
                    retried = true;
                    tracing::debug!(
                        %track_id,
                        dts = %frame.decode_timestamp,
                        last_dts = %track.last_decode_timestamp,
                        "Discontinuity, starting new coded frame group"
                    );
                    if self.sequence_mode {
                        self.group_start_timestamp = self.group_end_timestamp;
                    } else {
                        self.group_end_timestamp = frame.timestamp;
                    }
                    for track in self.tracks.values_mut() {
                        track.reset();
                    }
                    self.in_coded_frame_group = false;
                    continue;
                }
            }

            if frame.timestamp.is_negative() || frame.decode_timestamp.is_negative() {
                return Err(Error::invalid_timestamp(format!(
                    "{} frame has negative timestamp {} (decode {}) after offset {}",
                    frame.kind(),
                    frame.timestamp,
                    frame.decode_timestamp,
                    ctx.timestamp_offset
                )));
            }

            return self.accept_frame(frame, ctx);
        }
    }

    /// Steps after timestamp normalization: window trimming, random access
    /// point gating and queueing.
    fn accept_frame(&mut self, mut frame: AccessUnit, ctx: &mut AppendContext) -> Result<()> {
        let track_id = frame.track_id();
        let window_start = ctx.append_window_start;
        let window_end = ctx.append_window_end;

        if frame.kind() == MediaKind::Audio && frame.duration > MediaTime::ZERO {
            let presentation_timestamp = frame.timestamp;
            if self.handle_partial_append_window_trimming(window_start, window_end, &mut frame)
                && frame.timestamp != presentation_timestamp
                && !self.sequence_mode
            {
                // Front-trimmed: the frames after it may not be contiguous.
                self.in_coded_frame_group = false;
            }
        }

        let frame_end = frame.end_timestamp();
        if frame.timestamp < window_start || frame_end > window_end {
            tracing::debug!(
                %track_id,
                pts = %frame.timestamp,
                "Dropping frame outside append window"
            );
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.needs_random_access_point = true;
            }
            return Ok(());
        }

        let Some(track) = self.tracks.get_mut(&track_id) else {
            return Err(Error::not_found("track", track_id));
        };
        if track.needs_random_access_point {
            if !frame.is_key_frame {
                tracing::debug!(%track_id, pts = %frame.timestamp, "Dropping non-key frame");
                return Ok(());
            }
            track.needs_random_access_point = false;
        }

        if !self.in_coded_frame_group {
            self.flush_processed_frames(ctx)?;
            self.in_coded_frame_group = true;
            self.notify_start_of_coded_frame_group(frame.timestamp);
        }

        let Some(track) = self.tracks.get_mut(&track_id) else {
            return Err(Error::not_found("track", track_id));
        };
        track.enqueue(frame);
        self.group_end_timestamp = self.group_end_timestamp.max(frame_end);
        Ok(())
    }

    /// Trim an audio frame against the append window. Frames entirely before
    /// the window are stashed as preroll for the next frame that abuts them.
    /// Returns whether the frame was modified.
    fn handle_partial_append_window_trimming(
        &mut self,
        window_start: MediaTime,
        window_end: MediaTime,
        frame: &mut AccessUnit,
    ) -> bool {
        let frame_end = frame.end_timestamp();

        if frame.timestamp < window_start && frame_end <= window_start {
            self.audio_preroll_buffer = Some(frame.plain_copy());
            return false;
        }
        if frame.timestamp >= window_end {
            return false;
        }

        let mut processed = false;
        if let Some(preroll) = self.audio_preroll_buffer.take() {
            let gap = (preroll.end_timestamp() - frame.timestamp).abs();
            if gap < self.sample_duration {
                tracing::debug!(
                    preroll = %preroll.timestamp,
                    pts = %frame.timestamp,
                    "Attaching audio preroll"
                );
                frame.set_preroll(Arc::new(preroll));
                processed = true;
            } else {
                tracing::debug!(preroll = %preroll.timestamp, "Discarding unused audio preroll");
            }
        }

        if frame.timestamp < window_start {
            let trim = window_start - frame.timestamp;
            frame.discard_padding = DiscardPadding {
                front: frame.discard_padding.front + trim,
                back: frame.discard_padding.back,
            };
            frame.timestamp = window_start;
            frame.decode_timestamp = DecodeTimestamp::from_presentation_time(window_start);
            frame.duration = frame_end - window_start;
            processed = true;
        }

        if frame_end > window_end {
            frame.discard_padding.back += frame_end - window_end;
            frame.duration = window_end - frame.timestamp;
            processed = true;
        }

        processed
    }

    fn notify_start_of_coded_frame_group(&self, start: MediaTime) {
        for track in self.tracks.values() {
            if let Some(stream) = track.stream.upgrade() {
                stream.on_start_of_coded_frame_group(start);
            }
        }
    }

    fn flush_processed_frames(&mut self, ctx: &mut AppendContext) -> Result<()> {
        for track in self.tracks.values_mut() {
            track.flush(&mut ctx.completions)?;
        }
        Ok(())
    }
}
