//! Contiguous runs of buffered access units.
//!
//! A [`BufferRange`] holds buffers in decode order with no gap larger than
//! the store's fudge room between them. Every range starts with a key frame;
//! the key frames split it into GOPs, which are the unit of removal from
//! either end.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};

use ms_core::{DecodeTimestamp, MediaTime, SharedAccessUnit};

static NEXT_RANGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct BufferRange {
    id: u64,
    buffers: Vec<SharedAccessUnit>,
    /// Key frame PTS to `index + keyframe_map_index_base`.
    keyframe_map: BTreeMap<MediaTime, usize>,
    keyframe_map_index_base: usize,
    /// Explicit start from the coded frame group that created the range.
    range_start_pts: MediaTime,
    /// Position of the next buffer to read, `Some(len)` once exhausted.
    next_buffer_index: Option<usize>,
    size_in_bytes: usize,
    highest_pts: MediaTime,
    buffered_end: MediaTime,
}

impl BufferRange {
    /// Create a range from decode-ordered `buffers`.
    ///
    /// # Panics
    ///
    /// If `buffers` is empty or does not start with a key frame.
    pub fn new(buffers: Vec<SharedAccessUnit>, range_start_pts: MediaTime) -> Self {
        assert!(
            buffers.first().is_some_and(|b| b.is_key_frame),
            "a range must start with a key frame"
        );
        let mut range = Self {
            id: NEXT_RANGE_ID.fetch_add(1, Ordering::Relaxed),
            buffers: Vec::with_capacity(buffers.len()),
            keyframe_map: BTreeMap::new(),
            keyframe_map_index_base: 0,
            range_start_pts,
            next_buffer_index: None,
            size_in_bytes: 0,
            highest_pts: MediaTime::NONE,
            buffered_end: MediaTime::NONE,
        };
        range.append_buffers_to_end(buffers);
        range
    }

    /// Identity that survives appends and GOP deletion, but not splits.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[SharedAccessUnit] {
        &self.buffers
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    /// Start of the range: the coded frame group start if one was given,
    /// otherwise the first key frame.
    pub fn start_pts(&self) -> MediaTime {
        match self.range_start_pts.get() {
            Some(start) => start,
            None => self.first_keyframe_pts(),
        }
    }

    /// Fall back to the first key frame as the range start.
    pub fn clear_range_start(&mut self) {
        self.range_start_pts = MediaTime::NONE;
    }

    pub fn first_keyframe_pts(&self) -> MediaTime {
        self.keyframe_map
            .keys()
            .next()
            .copied()
            .unwrap_or(MediaTime::NONE)
    }

    /// Highest presentation timestamp of any buffer in the range.
    pub fn highest_pts(&self) -> MediaTime {
        self.highest_pts
    }

    /// Highest presentation end (`pts + duration`) of any buffer.
    pub fn buffered_end(&self) -> MediaTime {
        self.buffered_end
    }

    pub fn append_buffers_to_end(&mut self, new_buffers: Vec<SharedAccessUnit>) {
        for buffer in new_buffers {
            if buffer.is_key_frame {
                self.keyframe_map.insert(
                    buffer.timestamp,
                    self.buffers.len() + self.keyframe_map_index_base,
                );
            }
            self.size_in_bytes += buffer.estimated_size();
            self.highest_pts = self.highest_pts.max(buffer.timestamp);
            self.buffered_end = self.buffered_end.max(buffer.end_timestamp());
            self.buffers.push(buffer);
        }
    }

    /// Whether a coded frame group starting at `start` continues this range.
    pub fn can_append_buffers_to_end(&self, start: MediaTime, fudge_room: MediaTime) -> bool {
        self.is_next_in_presentation_sequence(start, fudge_room)
    }

    pub fn can_append_range_to_end(&self, other: &BufferRange, fudge_room: MediaTime) -> bool {
        self.is_next_in_presentation_sequence(other.start_pts(), fudge_room)
    }

    /// Move every buffer of `other` onto the end of this range. With
    /// `transfer_position`, `other`'s read position becomes this range's.
    pub fn append_range_to_end(&mut self, other: BufferRange, transfer_position: bool) {
        if transfer_position {
            if let Some(next) = other.next_buffer_index {
                self.next_buffer_index = Some(self.buffers.len() + next);
            }
        }
        self.append_buffers_to_end(other.buffers);
    }

    fn is_next_in_presentation_sequence(&self, t: MediaTime, fudge_room: MediaTime) -> bool {
        t >= self.highest_pts && t <= self.buffered_end + fudge_room
    }

    /// Whether `t` falls inside the range or just past its end.
    pub fn belongs_to(&self, t: MediaTime, fudge_room: MediaTime) -> bool {
        self.start_pts() <= t && t <= self.buffered_end + fudge_room
    }

    pub fn can_seek_to(&self, t: MediaTime, fudge_room: MediaTime) -> bool {
        let start = (self.start_pts() - fudge_room).max(MediaTime::ZERO);
        !self.keyframe_map.is_empty() && start <= t && t < self.buffered_end
    }

    /// Position reads at the first key frame at or after `t`. With no such
    /// key frame the position is past the last buffer.
    pub fn seek(&mut self, t: MediaTime) {
        let index = self
            .keyframe_map
            .range(t..)
            .next()
            .map(|(_, &i)| i - self.keyframe_map_index_base)
            .unwrap_or(self.buffers.len());
        self.next_buffer_index = Some(index);
    }

    pub fn seek_to_start(&mut self) {
        self.next_buffer_index = Some(0);
    }

    /// Presentation time of the first key frame at or after `t`.
    pub fn first_keyframe_at_or_after(&self, t: MediaTime) -> Option<MediaTime> {
        self.keyframe_map.range(t..).next().map(|(&pts, _)| pts)
    }

    pub fn has_next_buffer(&self) -> bool {
        self.next_buffer_index.is_some_and(|i| i < self.buffers.len())
    }

    pub fn has_next_buffer_position(&self) -> bool {
        self.next_buffer_index.is_some()
    }

    pub fn reset_next_buffer_position(&mut self) {
        self.next_buffer_index = None;
    }

    pub fn peek_next_buffer(&self) -> Option<&SharedAccessUnit> {
        self.next_buffer_index.and_then(|i| self.buffers.get(i))
    }

    pub fn next_buffer(&mut self) -> Option<SharedAccessUnit> {
        let index = self.next_buffer_index?;
        let buffer = self.buffers.get(index)?.clone();
        self.next_buffer_index = Some(index + 1);
        Some(buffer)
    }

    pub fn next_config_id(&self) -> Option<usize> {
        self.peek_next_buffer().map(|b| b.config_id)
    }

    /// Buffers whose presentation interval intersects `[start, end)`.
    pub fn buffers_in_range(&self, start: MediaTime, end: MediaTime) -> Vec<SharedAccessUnit> {
        self.buffers
            .iter()
            .filter(|b| b.timestamp < end && b.end_timestamp() > start)
            .cloned()
            .collect()
    }

    /// Delete every buffer from the removal point for `t` to the end.
    ///
    /// The removal point is the first buffer, in decode order within the GOP
    /// covering `t`, whose PTS is at or after `t` (strictly after with
    /// `exclusive`). Returns the deleted buffers that had not been read yet,
    /// in which case the read position is reset.
    pub fn truncate_at(&mut self, t: MediaTime, exclusive: bool) -> Vec<SharedAccessUnit> {
        let index = self.buffer_index_at(t, exclusive);
        self.truncate_at_index(index)
    }

    /// Split off every GOP whose key frame is at or after `t` into a new
    /// range, carrying the read position along when it falls in the split.
    /// Returns `None` if nothing, or everything, would be split off.
    pub fn split_range(&mut self, t: MediaTime) -> Option<BufferRange> {
        let (_, &map_index) = self.keyframe_map.range(t..).next()?;
        let index = map_index - self.keyframe_map_index_base;
        if index == 0 {
            return None;
        }

        let tail_buffers = self.buffers.split_off(index);
        self.keyframe_map.retain(|_, i| *i < map_index);

        let mut tail = BufferRange::new(tail_buffers, MediaTime::NONE);
        if let Some(next) = self.next_buffer_index {
            if next >= index {
                tail.next_buffer_index = Some(next - index);
                self.next_buffer_index = None;
            }
        }
        self.recompute_bounds();
        Some(tail)
    }

    /// Delete the first GOP. Returns the bytes freed.
    pub fn delete_gop_from_front(&mut self) -> usize {
        let end = self.first_gop_end_index();
        if end == 0 {
            return 0;
        }
        let before = self.size_in_bytes;
        self.buffers.drain(..end);
        self.keyframe_map_index_base += end;
        let base = self.keyframe_map_index_base;
        self.keyframe_map.retain(|_, i| *i >= base);
        self.next_buffer_index = match self.next_buffer_index {
            Some(next) if next >= end => Some(next - end),
            _ => None,
        };
        self.range_start_pts = MediaTime::NONE;
        self.recompute_bounds();
        before - self.size_in_bytes
    }

    /// Delete the last GOP. Returns the bytes freed.
    pub fn delete_gop_from_back(&mut self) -> usize {
        let start = self.last_gop_start_index();
        if start >= self.buffers.len() {
            return 0;
        }
        let before = self.size_in_bytes;
        self.truncate_at_index(start);
        before - self.size_in_bytes
    }

    /// Whether the first GOP holds the read position or the last buffer read.
    pub fn first_gop_holds_read_position(&self) -> bool {
        let end = self.first_gop_end_index();
        self.read_position_indices().any(|i| i < end)
    }

    /// Whether the first GOP holds the most recently read buffer.
    pub fn first_gop_holds_last_read(&self) -> bool {
        let end = self.first_gop_end_index();
        self.next_buffer_index
            .and_then(|next| next.checked_sub(1))
            .is_some_and(|last| last < end)
    }

    /// Whether the last GOP holds the read position or the last buffer read.
    pub fn last_gop_holds_read_position(&self) -> bool {
        let start = self.last_gop_start_index();
        self.read_position_indices().any(|i| i >= start)
    }

    /// End of the first GOP: the next key frame's PTS, or the range end.
    pub fn first_gop_end_pts(&self) -> MediaTime {
        self.keyframe_map
            .keys()
            .nth(1)
            .copied()
            .unwrap_or(self.buffered_end)
    }

    pub fn last_gop_start_pts(&self) -> MediaTime {
        self.keyframe_map
            .keys()
            .next_back()
            .copied()
            .unwrap_or(MediaTime::NONE)
    }

    pub fn first_gop_contains(&self, pts: MediaTime, dts: DecodeTimestamp) -> bool {
        self.buffers[..self.first_gop_end_index()]
            .iter()
            .any(|b| b.timestamp == pts && b.decode_timestamp == dts)
    }

    pub fn last_gop_contains(&self, pts: MediaTime, dts: DecodeTimestamp) -> bool {
        let start = self.last_gop_start_index().min(self.buffers.len());
        self.buffers[start..]
            .iter()
            .any(|b| b.timestamp == pts && b.decode_timestamp == dts)
    }

    pub fn gop_count(&self) -> usize {
        self.keyframe_map.len()
    }

    fn first_keyframe_at_or_before(&self, t: MediaTime) -> Option<(MediaTime, usize)> {
        self.keyframe_map
            .range(..=t)
            .next_back()
            .or_else(|| self.keyframe_map.iter().next())
            .map(|(&pts, &i)| (pts, i - self.keyframe_map_index_base))
    }

    fn buffer_index_at(&self, t: MediaTime, exclusive: bool) -> usize {
        let Some((gop_pts, gop_start)) = self.first_keyframe_at_or_before(t) else {
            return self.buffers.len();
        };
        let next_gop = self
            .keyframe_map
            .range((Excluded(gop_pts), Unbounded))
            .next()
            .map(|(_, &i)| i - self.keyframe_map_index_base)
            .unwrap_or(self.buffers.len());

        (gop_start..next_gop)
            .find(|&i| {
                let pts = self.buffers[i].timestamp;
                pts > t || (!exclusive && pts == t)
            })
            .unwrap_or(next_gop)
    }

    fn truncate_at_index(&mut self, index: usize) -> Vec<SharedAccessUnit> {
        if index >= self.buffers.len() {
            return Vec::new();
        }

        let mut unread = Vec::new();
        if let Some(next) = self.next_buffer_index {
            if next >= index {
                unread = self.buffers[next.min(self.buffers.len())..].to_vec();
                self.next_buffer_index = None;
            }
        }

        self.buffers.truncate(index);
        let map_end = index + self.keyframe_map_index_base;
        self.keyframe_map.retain(|_, i| *i < map_end);
        self.recompute_bounds();
        unread
    }

    fn first_gop_end_index(&self) -> usize {
        self.keyframe_map
            .values()
            .nth(1)
            .map(|i| i - self.keyframe_map_index_base)
            .unwrap_or(self.buffers.len())
    }

    fn last_gop_start_index(&self) -> usize {
        self.keyframe_map
            .values()
            .next_back()
            .map(|i| i - self.keyframe_map_index_base)
            .unwrap_or(self.buffers.len())
    }

    /// Indices of the next buffer and the most recently read one.
    fn read_position_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let len = self.buffers.len();
        self.next_buffer_index
            .into_iter()
            .flat_map(move |next| [next.checked_sub(1), Some(next).filter(|&n| n < len)])
            .flatten()
    }

    fn recompute_bounds(&mut self) {
        self.size_in_bytes = self.buffers.iter().map(|b| b.estimated_size()).sum();
        self.highest_pts = self
            .buffers
            .iter()
            .map(|b| b.timestamp)
            .max()
            .unwrap_or(MediaTime::NONE);
        self.buffered_end = self
            .buffers
            .iter()
            .map(|b| b.end_timestamp())
            .max()
            .unwrap_or(MediaTime::NONE);
    }
}
