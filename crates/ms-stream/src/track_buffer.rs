//! Range-indexed storage for one track.
//!
//! [`TrackBufferStore`] keeps a sorted list of disjoint [`BufferRange`]s plus
//! the read state of a single consumer: the selected range, a pending seek,
//! a pending config change and the track buffer that lets overwritten data
//! keep playing until the replacement offers a key frame.

use std::collections::VecDeque;
use std::sync::Arc;

use ms_core::{
    AccessUnit, AudioDecoderConfig, DecodeTimestamp, DecoderConfig, Error, MediaKind, MediaTime,
    Ranges, Result, SharedAccessUnit, TextTrackConfig, VideoDecoderConfig,
};

use crate::range::BufferRange;

/// Assumed buffer spacing until one has been observed.
const DEFAULT_BUFFER_DURATION: MediaTime = MediaTime::from_millis(125);
/// Widest crossfade an overlapping audio append may generate.
const MAX_SPLICE_DURATION: MediaTime = MediaTime::from_millis(5);
/// A seek this close before the first range starts playback at that range.
const SEEK_TO_START_FUDGE_ROOM: MediaTime = MediaTime::from_millis(1000);

/// Outcome of [`TrackBufferStore::get_next_buffer`].
#[derive(Debug, Clone)]
pub enum ReadStatus {
    Success(SharedAccessUnit),
    NeedMoreData,
    /// The next buffer needs a different decoder config. Reported until the
    /// change is acknowledged with [`TrackBufferStore::complete_config_change`].
    ConfigChange,
    EndOfStream,
}

pub struct TrackBufferStore {
    kind: MediaKind,
    ranges: Vec<BufferRange>,
    selected_range: Option<u64>,

    seek_pending: bool,
    seek_time: MediaTime,
    end_of_stream: bool,

    /// Overwritten buffers still owed to the reader.
    track_buffer: VecDeque<SharedAccessUnit>,

    configs: Vec<DecoderConfig>,
    current_config_index: usize,
    append_config_index: usize,
    config_change_pending: bool,

    new_coded_frame_group: bool,
    coded_frame_group_start: MediaTime,
    range_for_next_append: Option<u64>,
    last_appended_buffer: Option<(MediaTime, DecodeTimestamp)>,
    highest_pts_in_append_sequence: MediaTime,

    highest_output_timestamp: MediaTime,
    last_output_timestamp: MediaTime,

    max_interbuffer_distance: MediaTime,
    memory_limit: usize,
    splice_frames_enabled: bool,
}

impl TrackBufferStore {
    pub fn new(config: DecoderConfig, memory_limit: usize, splice_frames_enabled: bool) -> Self {
        Self {
            kind: config.kind(),
            ranges: Vec::new(),
            selected_range: None,
            seek_pending: false,
            seek_time: MediaTime::ZERO,
            end_of_stream: false,
            track_buffer: VecDeque::new(),
            configs: vec![config],
            current_config_index: 0,
            append_config_index: 0,
            config_change_pending: false,
            new_coded_frame_group: true,
            coded_frame_group_start: MediaTime::NONE,
            range_for_next_append: None,
            last_appended_buffer: None,
            highest_pts_in_append_sequence: MediaTime::NONE,
            highest_output_timestamp: MediaTime::NONE,
            last_output_timestamp: MediaTime::NONE,
            max_interbuffer_distance: MediaTime::NONE,
            memory_limit,
            splice_frames_enabled,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn set_memory_limit(&mut self, memory_limit: usize) {
        self.memory_limit = memory_limit;
    }

    /// Estimated bytes held by all ranges.
    pub fn buffered_size(&self) -> usize {
        self.ranges.iter().map(|r| r.size_in_bytes()).sum()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Start and end of every range, in order.
    pub fn range_bounds(&self) -> Vec<(MediaTime, MediaTime)> {
        self.ranges
            .iter()
            .map(|r| (r.start_pts(), r.buffered_end()))
            .collect()
    }

    /// Fudge room for adjacency: twice the largest buffer spacing seen.
    pub fn fudge_room(&self) -> MediaTime {
        match self.max_interbuffer_distance.get() {
            Some(distance) => distance * 2,
            None => DEFAULT_BUFFER_DURATION * 2,
        }
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    /// The next append begins a coded frame group starting at `start`.
    pub fn on_start_of_coded_frame_group(&mut self, start: MediaTime) {
        self.coded_frame_group_start = start;
        self.new_coded_frame_group = true;

        let fudge_room = self.fudge_room();
        let continuing = self
            .ranges
            .iter()
            .find(|r| r.belongs_to(start, fudge_room))
            .map(|r| r.id());
        self.range_for_next_append = continuing;
        if continuing.is_none() {
            self.reset_last_appended_state();
        }
        tracing::debug!(
            kind = %self.kind,
            %start,
            continuing = continuing.is_some(),
            "Start of coded frame group"
        );
    }

    /// Store decode-ordered `buffers`, replacing whatever they overlap.
    pub fn append(&mut self, mut buffers: Vec<AccessUnit>) -> Result<()> {
        if buffers.is_empty() {
            return Ok(());
        }

        if buffers
            .windows(2)
            .any(|w| w[1].decode_timestamp < w[0].decode_timestamp)
        {
            return Err(Error::invalid_timestamp(format!(
                "{} buffers are not in decode order",
                self.kind
            )));
        }
        if !self.new_coded_frame_group {
            if let Some((_, last_dts)) = self.last_appended_buffer {
                if buffers[0].decode_timestamp < last_dts {
                    return Err(Error::invalid_timestamp(format!(
                        "{} append continues at {} after {}",
                        self.kind, buffers[0].decode_timestamp, last_dts
                    )));
                }
            }
        }

        let new_group = self.new_coded_frame_group;
        if new_group && self.coded_frame_group_start.is_none() {
            self.coded_frame_group_start = buffers[0].timestamp;
        }

        for buffer in &mut buffers {
            buffer.config_id = self.append_config_index;
        }
        self.update_max_interbuffer_distance(&buffers, new_group);

        if new_group && self.splice_frames_enabled && self.kind == MediaKind::Audio {
            self.generate_splice_frame(&mut buffers);
        }

        let mut buffers: Vec<SharedAccessUnit> = buffers.into_iter().map(Arc::new).collect();
        let first_pts = buffers[0].timestamp;
        let append_end = buffers
            .iter()
            .map(|b| b.end_timestamp())
            .max()
            .unwrap_or(first_pts);
        let append_highest_pts = buffers
            .iter()
            .map(|b| b.timestamp)
            .max()
            .unwrap_or(first_pts);

        let group_start = if new_group {
            self.coded_frame_group_start.min(first_pts)
        } else {
            first_pts
        };

        // Clear out whatever the new buffers overlap.
        let overwritten = match (new_group, self.highest_pts_in_append_sequence.get()) {
            (false, Some(highest)) => self.remove_internal(highest, append_end, true),
            _ => self.remove_internal(group_start, append_end, false),
        };

        let fudge_room = self.fudge_room();
        let target = if new_group {
            self.ranges
                .iter()
                .position(|r| r.can_append_buffers_to_end(group_start, fudge_room))
        } else {
            self.range_for_next_append.and_then(|id| self.range_index(id))
        };

        let last_appended = buffers
            .last()
            .map(|b| (b.timestamp, b.decode_timestamp));

        let index = match target {
            Some(index) => {
                self.ranges[index].append_buffers_to_end(buffers);
                index
            }
            None => {
                let Some(first_key) = buffers.iter().position(|b| b.is_key_frame) else {
                    tracing::warn!(
                        kind = %self.kind,
                        count = buffers.len(),
                        "Dropping buffers that cannot start a new range without a key frame"
                    );
                    return Ok(());
                };
                if first_key > 0 {
                    tracing::warn!(
                        kind = %self.kind,
                        count = first_key,
                        "Dropping leading non-key frames of a new range"
                    );
                    buffers.drain(..first_key);
                }
                let range_start = if new_group {
                    group_start.min(buffers[0].timestamp)
                } else {
                    MediaTime::NONE
                };
                let range = BufferRange::new(buffers, range_start);
                let start = range.start_pts();
                let index = self.ranges.partition_point(|r| r.start_pts() < start);
                self.ranges.insert(index, range);
                index
            }
        };

        self.range_for_next_append = Some(self.ranges[index].id());
        self.last_appended_buffer = last_appended;
        self.highest_pts_in_append_sequence = if new_group {
            append_highest_pts
        } else {
            self.highest_pts_in_append_sequence.max(append_highest_pts)
        };
        self.new_coded_frame_group = false;
        self.coded_frame_group_start = MediaTime::NONE;

        self.merge_with_next_range_if_necessary(index);

        if self.seek_pending {
            self.seek(self.seek_time);
        }

        if !overwritten.is_empty() {
            tracing::debug!(
                kind = %self.kind,
                count = overwritten.len(),
                "Overwritten buffers moved to the track buffer"
            );
            self.track_buffer.extend(overwritten);
        }
        if let Some(front) = self.track_buffer.front().map(|b| b.timestamp) {
            if let Some(keyframe) = self.find_keyframe_after(front) {
                self.prune_track_buffer(keyframe);
            }
        }
        self.set_selected_range_if_needed(None);

        Ok(())
    }

    fn update_max_interbuffer_distance(&mut self, buffers: &[AccessUnit], new_group: bool) {
        let mut prev = if new_group {
            None
        } else {
            self.last_appended_buffer.map(|(_, dts)| dts)
        };
        for buffer in buffers {
            let mut distance = buffer.duration.max(MediaTime::ZERO);
            if let Some(prev) = prev {
                distance = distance.max(buffer.decode_timestamp - prev);
            }
            self.max_interbuffer_distance = match self.max_interbuffer_distance.get() {
                Some(max) => max.max(distance),
                None => distance,
            };
            prev = Some(buffer.decode_timestamp);
        }
    }

    /// Turn the head of an overlapping audio append into a splice carrying
    /// the overlapped buffers and the original head.
    fn generate_splice_frame(&self, buffers: &mut [AccessUnit]) {
        let Some(head) = buffers.first() else {
            return;
        };
        if head.preroll().is_some() || head.is_splice() {
            return;
        }
        let splice_timestamp = head.timestamp;

        let Some(range) = self
            .ranges
            .iter()
            .find(|r| r.start_pts() <= splice_timestamp && splice_timestamp < r.buffered_end())
        else {
            return;
        };

        let pre_splice =
            range.buffers_in_range(splice_timestamp, splice_timestamp + MAX_SPLICE_DURATION);
        let (Some(first), Some(last)) = (pre_splice.first(), pre_splice.last()) else {
            return;
        };
        // Exact replacement or a gap before the splice point.
        if first.timestamp >= splice_timestamp {
            return;
        }
        if pre_splice
            .iter()
            .any(|b| b.is_splice() || b.preroll().is_some())
        {
            return;
        }

        let minimum = self.configs[self.append_config_index]
            .as_audio()
            .map(|c| c.sample_duration() * 2)
            .unwrap_or(MediaTime::ZERO);
        if last.end_timestamp() - splice_timestamp < minimum {
            return;
        }

        let first_timestamp = first.timestamp;
        let first_decode_timestamp = first.decode_timestamp;
        let pre_splice_end = last.end_timestamp();

        let head = &mut buffers[0];
        let overlapping = head.plain_copy();
        let splice_end = overlapping.end_timestamp().max(pre_splice_end);
        let mut splice_buffers: Vec<SharedAccessUnit> = pre_splice
            .iter()
            .map(|b| Arc::new(b.plain_copy()))
            .collect();
        splice_buffers.push(Arc::new(overlapping));

        head.timestamp = first_timestamp;
        head.decode_timestamp = first_decode_timestamp;
        head.duration = splice_end - first_timestamp;
        tracing::debug!(
            %splice_timestamp,
            overlapped = splice_buffers.len() - 1,
            "Generated audio splice"
        );
        head.set_splice_buffers(splice_timestamp, splice_buffers);
    }

    fn merge_with_next_range_if_necessary(&mut self, index: usize) {
        let fudge_room = self.fudge_room();
        while index + 1 < self.ranges.len()
            && self.ranges[index].can_append_range_to_end(&self.ranges[index + 1], fudge_room)
        {
            let next = self.ranges.remove(index + 1);
            let next_id = next.id();
            let transfer_position = self.selected_range == Some(next_id);
            self.ranges[index].append_range_to_end(next, transfer_position);

            let merged_id = self.ranges[index].id();
            if transfer_position {
                self.selected_range = Some(merged_id);
            }
            if self.range_for_next_append == Some(next_id) {
                self.range_for_next_append = Some(merged_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Remove buffers whose presentation interval intersects `[start, end)`,
    /// extended to the next key frame so no orphaned dependent frames remain.
    pub fn remove(&mut self, start: MediaTime, end: MediaTime, duration: MediaTime) {
        assert!(start < end, "remove with empty interval {start}..{end}");

        let remove_end = match self.find_keyframe_after(end) {
            Some(keyframe) => keyframe,
            None if duration.is_none() || end < duration => end,
            None => duration,
        };
        tracing::debug!(kind = %self.kind, %start, end = %remove_end, "Removing buffered data");

        let unread = self.remove_internal(start, remove_end, false);

        if let Some((pts, _)) = self.last_appended_buffer {
            if pts >= start && pts < remove_end {
                self.range_for_next_append = None;
                self.reset_last_appended_state();
                self.new_coded_frame_group = true;
                self.coded_frame_group_start = MediaTime::NONE;
            }
        }

        if let Some(first) = unread.first() {
            self.set_selected_range_if_needed(Some(first.timestamp));
        }
    }

    /// Shared removal used by overlap handling and explicit removal. Returns
    /// the selected range's buffers that were removed before being read.
    fn remove_internal(
        &mut self,
        start: MediaTime,
        end: MediaTime,
        exclusive: bool,
    ) -> Vec<SharedAccessUnit> {
        let mut unread = Vec::new();
        let mut i = 0;

        while i < self.ranges.len() && self.ranges[i].start_pts() < end {
            if self.ranges[i].highest_pts() < start {
                i += 1;
                continue;
            }

            if let Some(tail) = self.ranges[i].split_range(end) {
                let tail_id = tail.id();
                if tail.has_next_buffer_position() {
                    self.selected_range = Some(tail_id);
                }
                if self.range_for_next_append == Some(self.ranges[i].id()) {
                    if let Some((pts, dts)) = self.last_appended_buffer {
                        if tail.last_gop_contains(pts, dts) {
                            self.range_for_next_append = Some(tail_id);
                        }
                    }
                }
                self.ranges.insert(i + 1, tail);
            }

            let range = &mut self.ranges[i];
            if range.first_keyframe_pts() >= end {
                // Nothing to delete, but the declared start may lie inside
                // the removed interval.
                range.clear_range_start();
                i += 1;
                continue;
            }

            let saved = range.truncate_at(start, exclusive);
            if !saved.is_empty() {
                unread = saved;
            }

            let id = range.id();
            if self.selected_range == Some(id) && !range.has_next_buffer_position() {
                self.selected_range = None;
            }
            if range.is_empty() {
                self.ranges.remove(i);
                if self.range_for_next_append == Some(id) {
                    self.range_for_next_append = None;
                    self.reset_last_appended_state();
                }
                continue;
            }
            i += 1;
        }

        unread
    }

    /// Drop data at or beyond a reduced `duration`.
    pub fn on_set_duration(&mut self, duration: MediaTime) {
        let Some(mut i) = self.ranges.iter().position(|r| r.highest_pts() > duration) else {
            return;
        };
        tracing::debug!(kind = %self.kind, %duration, "Truncating to new duration");

        if self.ranges[i].start_pts() < duration {
            let range = &mut self.ranges[i];
            range.truncate_at(duration, false);
            let id = range.id();
            if self.selected_range == Some(id) && !range.has_next_buffer_position() {
                self.selected_range = None;
            }
            if range.is_empty() {
                self.remove_range_at(i);
            } else {
                i += 1;
            }
        }

        while i < self.ranges.len() {
            if self.selected_range == Some(self.ranges[i].id()) {
                self.reset_seek_state();
            }
            self.remove_range_at(i);
        }
    }

    fn remove_range_at(&mut self, index: usize) {
        let range = self.ranges.remove(index);
        if self.selected_range == Some(range.id()) {
            self.selected_range = None;
        }
        if self.range_for_next_append == Some(range.id()) {
            self.range_for_next_append = None;
            self.reset_last_appended_state();
            self.new_coded_frame_group = true;
        }
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Free enough memory that `new_data_size` more bytes fit under the
    /// memory limit, given that playback is at `media_time`.
    ///
    /// Data before `media_time` in unselected ranges goes first, then the
    /// tail of unselected ranges, then the played part of the selected range
    /// and finally the selected range beyond its read position. GOPs holding
    /// the last buffer read, the next read position or the last appended
    /// buffer are never removed. Returns whether enough was freed.
    pub fn garbage_collect_if_needed(&mut self, media_time: MediaTime, new_data_size: usize) -> bool {
        let ranges_size = self.buffered_size();
        if new_data_size > self.memory_limit {
            tracing::warn!(
                kind = %self.kind,
                new_data_size,
                memory_limit = self.memory_limit,
                "Append larger than the memory limit"
            );
            return false;
        }
        if ranges_size + new_data_size <= self.memory_limit {
            return true;
        }

        let bytes_to_free = ranges_size + new_data_size - self.memory_limit;
        let mut freed = 0;
        freed += self.free_from_front(bytes_to_free - freed, media_time, false);
        if freed < bytes_to_free {
            freed += self.free_from_back(bytes_to_free - freed, media_time, false);
        }
        if freed < bytes_to_free {
            freed += self.free_from_front(bytes_to_free - freed, media_time, true);
        }
        if freed < bytes_to_free {
            freed += self.free_from_back(bytes_to_free - freed, media_time, true);
        }

        let mut i = 0;
        while i < self.ranges.len() {
            if self.ranges[i].is_empty() {
                self.remove_range_at(i);
            } else {
                i += 1;
            }
        }
        if self.selected_range.is_none() {
            self.set_selected_range_if_needed(None);
        }

        tracing::debug!(
            kind = %self.kind,
            %media_time,
            bytes_to_free,
            freed,
            "Evicted buffered data"
        );
        freed >= bytes_to_free
    }

    fn free_from_front(&mut self, target: usize, media_time: MediaTime, selected: bool) -> usize {
        let mut freed = 0;
        for i in 0..self.ranges.len() {
            let id = self.ranges[i].id();
            if (self.selected_range == Some(id)) != selected {
                continue;
            }
            while freed < target {
                let range = &self.ranges[i];
                if range.is_empty()
                    || range.first_gop_end_pts() > media_time
                    || range.first_gop_holds_last_read()
                    || self
                        .last_appended_buffer
                        .is_some_and(|(pts, dts)| range.first_gop_contains(pts, dts))
                {
                    break;
                }
                freed += self.ranges[i].delete_gop_from_front();
                if self.selected_range == Some(id) && !self.ranges[i].has_next_buffer_position() {
                    self.selected_range = None;
                }
            }
        }
        freed
    }

    fn free_from_back(&mut self, target: usize, media_time: MediaTime, selected: bool) -> usize {
        let mut freed = 0;
        for i in (0..self.ranges.len()).rev() {
            if (self.selected_range == Some(self.ranges[i].id())) != selected {
                continue;
            }
            while freed < target {
                let range = &self.ranges[i];
                if range.is_empty()
                    || range.last_gop_start_pts() <= media_time
                    || range.last_gop_holds_read_position()
                    || self
                        .last_appended_buffer
                        .is_some_and(|(pts, dts)| range.last_gop_contains(pts, dts))
                {
                    break;
                }
                freed += self.ranges[i].delete_gop_from_back();
            }
        }
        freed
    }

    // -----------------------------------------------------------------------
    // Seeking and reading
    // -----------------------------------------------------------------------

    /// Position reads at the nearest key frame at or after `t`, in the range
    /// that holds it. If no range covering `t` has one, the seek stays
    /// pending until an append provides it.
    pub fn seek(&mut self, t: MediaTime) {
        let t = t.max(MediaTime::ZERO);
        self.reset_seek_state();
        self.seek_time = t;
        self.seek_pending = true;

        if let Some(first) = self.ranges.first() {
            let start = first.start_pts();
            if t <= start && start - t <= SEEK_TO_START_FUDGE_ROOM {
                let id = first.id();
                self.ranges[0].seek_to_start();
                self.select_range(Some(id));
                self.seek_pending = false;
                return;
            }
        }

        let fudge_room = self.fudge_room();
        if let Some(index) = self
            .ranges
            .iter()
            .position(|r| r.can_seek_to(t, fudge_room) && r.first_keyframe_at_or_after(t).is_some())
        {
            self.seek_and_select(index, t);
            self.seek_pending = false;
        } else {
            tracing::debug!(kind = %self.kind, %t, "Seek pending until data arrives");
        }
    }

    /// A seek is waiting for data that has not been appended yet.
    pub fn is_seek_pending(&self) -> bool {
        self.seek_pending && !self.is_end_of_stream_reached()
    }

    pub fn get_next_buffer(&mut self) -> ReadStatus {
        if self.config_change_pending {
            return ReadStatus::ConfigChange;
        }

        if let Some(config_id) = self.track_buffer.front().map(|b| b.config_id) {
            if config_id != self.current_config_index {
                self.signal_config_change(config_id);
                return ReadStatus::ConfigChange;
            }
            let Some(buffer) = self.track_buffer.pop_front() else {
                return ReadStatus::NeedMoreData;
            };
            self.record_output(&buffer);
            if self.track_buffer.is_empty() {
                self.set_selected_range_if_needed(None);
            }
            return ReadStatus::Success(buffer);
        }

        if self.selected_range.is_none() && !self.seek_pending {
            if self.highest_output_timestamp.is_none() {
                // Nothing read since the last seek; start (again) from there.
                self.seek(self.seek_time);
            } else {
                self.set_selected_range_if_needed(None);
            }
        }

        let Some(index) = self.selected_index().filter(|&i| self.ranges[i].has_next_buffer()) else {
            return if self.is_end_of_stream_reached() {
                ReadStatus::EndOfStream
            } else {
                ReadStatus::NeedMoreData
            };
        };

        if let Some(config_id) = self.ranges[index].next_config_id() {
            if config_id != self.current_config_index {
                self.signal_config_change(config_id);
                return ReadStatus::ConfigChange;
            }
        }

        match self.ranges[index].next_buffer() {
            Some(buffer) => {
                self.record_output(&buffer);
                ReadStatus::Success(buffer)
            }
            None => ReadStatus::NeedMoreData,
        }
    }

    fn signal_config_change(&mut self, config_id: usize) {
        tracing::debug!(
            kind = %self.kind,
            from = self.current_config_index,
            to = config_id,
            "Config change before next buffer"
        );
        self.config_change_pending = true;
    }

    /// Acknowledge a signalled config change: the next buffer's config
    /// becomes current.
    pub fn complete_config_change(&mut self) {
        if !self.config_change_pending {
            return;
        }
        let next = self.track_buffer.front().map(|b| b.config_id).or_else(|| {
            self.selected_index()
                .and_then(|i| self.ranges[i].next_config_id())
        });
        if let Some(config_id) = next {
            self.current_config_index = config_id;
        }
        self.config_change_pending = false;
    }

    fn record_output(&mut self, buffer: &SharedAccessUnit) {
        self.last_output_timestamp = buffer.timestamp;
        self.highest_output_timestamp = self.highest_output_timestamp.max(buffer.timestamp);
    }

    fn reset_seek_state(&mut self) {
        self.select_range(None);
        self.track_buffer.clear();
        self.config_change_pending = false;
        self.highest_output_timestamp = MediaTime::NONE;
        self.last_output_timestamp = MediaTime::NONE;
    }

    fn reset_last_appended_state(&mut self) {
        self.last_appended_buffer = None;
        self.highest_pts_in_append_sequence = MediaTime::NONE;
    }

    fn select_range(&mut self, id: Option<u64>) {
        for range in &mut self.ranges {
            if Some(range.id()) != id {
                range.reset_next_buffer_position();
            }
        }
        self.selected_range = id;
    }

    fn seek_and_select(&mut self, index: usize, t: MediaTime) {
        self.ranges[index].seek(t);
        let id = self.ranges[index].id();
        self.select_range(Some(id));
    }

    fn selected_index(&self) -> Option<usize> {
        self.selected_range.and_then(|id| self.range_index(id))
    }

    fn range_index(&self, id: u64) -> Option<usize> {
        self.ranges.iter().position(|r| r.id() == id)
    }

    /// First key frame at or after `t` in the range `t` belongs to.
    fn find_keyframe_after(&self, t: MediaTime) -> Option<MediaTime> {
        let fudge_room = self.fudge_room();
        self.ranges
            .iter()
            .find(|r| r.belongs_to(t, fudge_room))
            .and_then(|r| r.first_keyframe_at_or_after(t))
    }

    /// Drop track buffer entries that the range data starting at `keyframe`
    /// now replaces.
    fn prune_track_buffer(&mut self, keyframe: MediaTime) {
        while self
            .track_buffer
            .back()
            .is_some_and(|b| b.timestamp >= keyframe)
        {
            self.track_buffer.pop_back();
        }
    }

    /// Reselect a range after the selection was lost, continuing from
    /// `start` or just after the highest buffer already read.
    fn set_selected_range_if_needed(&mut self, start: Option<MediaTime>) {
        if self.selected_range.is_some() || self.seek_pending || !self.track_buffer.is_empty() {
            return;
        }
        let start = match start {
            Some(start) => start,
            None => match self.highest_output_timestamp.get() {
                Some(highest) => highest + MediaTime::from_micros(1),
                None => return,
            },
        };

        // Ranges starting within the fudge room after `start` also qualify.
        let search_end = start + self.fudge_room();
        let found = self
            .ranges
            .iter()
            .enumerate()
            .take_while(|(_, r)| r.start_pts() < search_end)
            .filter(|(_, r)| r.buffered_end() >= start)
            .find_map(|(i, r)| {
                r.first_keyframe_at_or_after(start.max(r.start_pts()))
                    .map(|keyframe| (i, keyframe))
            });
        if let Some((index, keyframe)) = found {
            tracing::debug!(kind = %self.kind, %start, %keyframe, "Reselected range");
            self.seek_and_select(index, keyframe);
        }
    }

    // -----------------------------------------------------------------------
    // End of stream, ranges and configs
    // -----------------------------------------------------------------------

    pub fn mark_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    pub fn unmark_end_of_stream(&mut self) {
        self.end_of_stream = false;
    }

    pub fn is_end_of_stream_reached(&self) -> bool {
        if !self.end_of_stream || !self.track_buffer.is_empty() {
            return false;
        }
        let Some(last) = self.ranges.last() else {
            return true;
        };
        if self.seek_pending {
            return self.seek_time >= last.buffered_end()
                || self
                    .ranges
                    .iter()
                    .all(|r| r.first_keyframe_at_or_after(self.seek_time).is_none());
        }
        match self.selected_index() {
            None => true,
            Some(index) => index + 1 == self.ranges.len(),
        }
    }

    /// Buffered ranges with their ends clamped to `duration`.
    pub fn buffered_ranges(&self, duration: MediaTime) -> Ranges<MediaTime> {
        let mut ranges = Ranges::new();
        for range in &self.ranges {
            let end = match duration.get() {
                Some(duration) => range.buffered_end().min(duration),
                None => range.buffered_end(),
            };
            ranges.add(range.start_pts(), end);
        }
        ranges
    }

    pub fn highest_presentation_timestamp(&self) -> MediaTime {
        self.ranges
            .last()
            .map(|r| r.highest_pts())
            .unwrap_or(MediaTime::NONE)
    }

    /// End of the last range, [`MediaTime::NONE`] when empty.
    pub fn buffered_end(&self) -> MediaTime {
        self.ranges
            .last()
            .map(|r| r.buffered_end())
            .unwrap_or(MediaTime::NONE)
    }

    /// Register a config announced by a new init segment. Later appends are
    /// stamped with it. Codec and encryption changes are rejected.
    pub fn update_config(&mut self, config: DecoderConfig) -> Result<()> {
        let first = &self.configs[0];
        let codec_changed = match (first, &config) {
            (DecoderConfig::Audio(a), DecoderConfig::Audio(b)) => a.codec != b.codec,
            (DecoderConfig::Video(a), DecoderConfig::Video(b)) => a.codec != b.codec,
            (DecoderConfig::Text(a), DecoderConfig::Text(b)) => a.kind != b.kind,
            _ => {
                return Err(Error::config_mismatch(format!(
                    "{} track cannot take a {} config",
                    self.kind,
                    config.kind()
                )))
            }
        };
        if codec_changed {
            return Err(Error::config_mismatch(format!(
                "{} codec changes are not allowed",
                self.kind
            )));
        }
        if first.is_encrypted() != config.is_encrypted() {
            return Err(Error::config_mismatch(format!(
                "{} encryption changes are not allowed",
                self.kind
            )));
        }

        self.append_config_index = match self.configs.iter().position(|c| *c == config) {
            Some(index) => index,
            None => {
                tracing::debug!(kind = %self.kind, index = self.configs.len(), "New decoder config");
                self.configs.push(config);
                self.configs.len() - 1
            }
        };
        Ok(())
    }

    /// The config of the buffers being read, acknowledging any pending change.
    pub fn current_config(&mut self) -> &DecoderConfig {
        self.complete_config_change();
        &self.configs[self.current_config_index]
    }

    pub fn audio_decoder_config(&mut self) -> Option<&AudioDecoderConfig> {
        self.current_config().as_audio()
    }

    pub fn video_decoder_config(&mut self) -> Option<&VideoDecoderConfig> {
        self.current_config().as_video()
    }

    pub fn text_track_config(&mut self) -> Option<&TextTrackConfig> {
        self.current_config().as_text()
    }

    /// Config new appends are stamped with.
    pub fn append_config(&self) -> &DecoderConfig {
        &self.configs[self.append_config_index]
    }
}
