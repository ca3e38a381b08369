//! The access unit: one timestamped, encoded chunk of a single track.
//!
//! # Timing
//!
//! * **Presentation timestamp (PTS):** when the decoded unit is shown.
//! * **Decode timestamp (DTS):** when the unit must be decoded. Distinct type.
//! * **Duration:** presentation duration of the valid samples.
//! * **Discard padding:** decoded duration to drop from the front/back after
//!   decoding, produced by append-window trimming.
//!
//! An access unit may carry a single *preroll* unit the decoder must consume
//! first, or an ordered list of *splice* units used for crossfading audio.
//! Neither nests further. The end-of-stream sentinel has no payload and can
//! carry neither.

use bytes::Bytes;
use std::sync::Arc;

use crate::ids::TrackId;
use crate::media::MediaKind;
use crate::time::{DecodeTimestamp, MediaTime};

/// Stored buffers are shared between the store and readers.
pub type SharedAccessUnit = Arc<AccessUnit>;

/// Fixed per-buffer bookkeeping cost added to the payload size when
/// estimating memory use.
const BUFFER_OVERHEAD_BYTES: usize = 64;

/// Duration to discard from the front and back of a decoded unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscardPadding {
    pub front: MediaTime,
    pub back: MediaTime,
}

impl DiscardPadding {
    pub fn is_empty(&self) -> bool {
        self.front == MediaTime::ZERO && self.back == MediaTime::ZERO
    }
}

/// An encoded frame plus its timing and dependency information.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    data: Option<Bytes>,
    /// Presentation timestamp.
    pub timestamp: MediaTime,
    pub decode_timestamp: DecodeTimestamp,
    pub duration: MediaTime,
    pub is_key_frame: bool,
    kind: MediaKind,
    track_id: TrackId,
    /// Index into the owning track's config history.
    pub config_id: usize,
    pub discard_padding: DiscardPadding,
    preroll: Option<SharedAccessUnit>,
    splice_buffers: Vec<SharedAccessUnit>,
    splice_timestamp: MediaTime,
}

impl AccessUnit {
    /// Create a unit with PTS == DTS; use [`AccessUnit::with_decode_timestamp`]
    /// for reordered video.
    pub fn new(
        kind: MediaKind,
        track_id: TrackId,
        is_key_frame: bool,
        data: impl Into<Bytes>,
        timestamp: MediaTime,
        duration: MediaTime,
    ) -> Self {
        Self {
            data: Some(data.into()),
            timestamp,
            decode_timestamp: DecodeTimestamp::from_presentation_time(timestamp),
            duration,
            is_key_frame,
            kind,
            track_id,
            config_id: 0,
            discard_padding: DiscardPadding::default(),
            preroll: None,
            splice_buffers: Vec::new(),
            splice_timestamp: MediaTime::NONE,
        }
    }

    /// The end-of-stream sentinel.
    pub fn end_of_stream(kind: MediaKind, track_id: TrackId) -> Self {
        Self {
            data: None,
            timestamp: MediaTime::NONE,
            decode_timestamp: DecodeTimestamp::NONE,
            duration: MediaTime::NONE,
            is_key_frame: false,
            kind,
            track_id,
            config_id: 0,
            discard_padding: DiscardPadding::default(),
            preroll: None,
            splice_buffers: Vec::new(),
            splice_timestamp: MediaTime::NONE,
        }
    }

    #[must_use]
    pub fn with_decode_timestamp(mut self, dts: DecodeTimestamp) -> Self {
        self.decode_timestamp = dts;
        self
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_none()
    }

    /// Encoded payload. Empty for the end-of-stream sentinel.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn set_track_id(&mut self, track_id: TrackId) {
        self.track_id = track_id;
    }

    /// End of the presentation interval.
    pub fn end_timestamp(&self) -> MediaTime {
        self.timestamp + self.duration
    }

    pub fn preroll(&self) -> Option<&SharedAccessUnit> {
        self.preroll.as_ref()
    }

    /// Attach the unit the decoder must consume before this one.
    ///
    /// # Panics
    ///
    /// If either unit is the end-of-stream sentinel or `preroll` itself has
    /// preroll or splice buffers.
    pub fn set_preroll(&mut self, preroll: SharedAccessUnit) {
        assert!(!self.is_end_of_stream(), "end of stream cannot carry preroll");
        assert!(!preroll.is_end_of_stream(), "preroll cannot be end of stream");
        assert!(
            preroll.preroll.is_none() && preroll.splice_buffers.is_empty(),
            "preroll cannot nest"
        );
        self.preroll = Some(preroll);
    }

    pub fn splice_buffers(&self) -> &[SharedAccessUnit] {
        &self.splice_buffers
    }

    pub fn splice_timestamp(&self) -> MediaTime {
        self.splice_timestamp
    }

    pub fn is_splice(&self) -> bool {
        !self.splice_buffers.is_empty()
    }

    /// Turn this unit into a splice carrier.
    ///
    /// # Panics
    ///
    /// If this is the end-of-stream sentinel or any sub-buffer nests splice
    /// or preroll buffers.
    pub fn set_splice_buffers(&mut self, splice_timestamp: MediaTime, buffers: Vec<SharedAccessUnit>) {
        assert!(!self.is_end_of_stream(), "end of stream cannot carry splice buffers");
        assert!(
            buffers
                .iter()
                .all(|b| !b.is_end_of_stream() && b.splice_buffers.is_empty() && b.preroll.is_none()),
            "splice buffers cannot nest"
        );
        self.splice_timestamp = splice_timestamp;
        self.splice_buffers = buffers;
    }

    /// Copy of this unit without preroll or splice attachments.
    pub fn plain_copy(&self) -> AccessUnit {
        AccessUnit {
            preroll: None,
            splice_buffers: Vec::new(),
            splice_timestamp: MediaTime::NONE,
            ..self.clone()
        }
    }

    /// Memory estimate used by eviction accounting.
    pub fn estimated_size(&self) -> usize {
        let nested: usize = self
            .preroll
            .iter()
            .chain(self.splice_buffers.iter())
            .map(|b| b.estimated_size())
            .sum();
        self.data().len() + BUFFER_OVERHEAD_BYTES + nested
    }
}
