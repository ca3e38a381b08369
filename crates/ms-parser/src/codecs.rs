//! Codec string identification.
//!
//! Codec strings such as `avc1.42E01E` or `mp4a.40.2` are matched against a
//! static table of patterns. A pattern is either an exact string or a prefix
//! ending in `*`. Entries can carry a validator for checks a pattern cannot
//! express (e.g. the AAC audio object type).

use ms_core::{AudioCodec, MediaKind, VideoCodec};

/// Extra check run on a codec string after its pattern matched.
pub type CodecValidator = fn(&str) -> bool;

/// What a codec string identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Audio(AudioCodec),
    Video(VideoCodec),
}

impl CodecKind {
    pub fn media_kind(self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }
}

/// One row of the codec table.
#[derive(Debug, Clone, Copy)]
pub struct CodecInfo {
    pub pattern: &'static str,
    pub kind: CodecKind,
    pub validator: Option<CodecValidator>,
}

impl CodecInfo {
    const fn new(pattern: &'static str, kind: CodecKind) -> Self {
        Self {
            pattern,
            kind,
            validator: None,
        }
    }

    const fn validated(pattern: &'static str, kind: CodecKind, validator: CodecValidator) -> Self {
        Self {
            pattern,
            kind,
            validator: Some(validator),
        }
    }

    /// Whether `codec` matches this row's pattern and validator.
    pub fn matches(&self, codec: &str) -> bool {
        match_pattern(self.pattern, codec) && self.validator.is_none_or(|validate| validate(codec))
    }
}

/// Known codec strings, checked in order.
pub static CODEC_TABLE: &[CodecInfo] = &[
    CodecInfo::new("avc1.*", CodecKind::Video(VideoCodec::H264)),
    CodecInfo::new("avc3.*", CodecKind::Video(VideoCodec::H264)),
    CodecInfo::new("hev1.*", CodecKind::Video(VideoCodec::Hevc)),
    CodecInfo::new("hvc1.*", CodecKind::Video(VideoCodec::Hevc)),
    CodecInfo::new("vp8", CodecKind::Video(VideoCodec::Vp8)),
    CodecInfo::new("vp8.0", CodecKind::Video(VideoCodec::Vp8)),
    CodecInfo::new("vp9", CodecKind::Video(VideoCodec::Vp9)),
    CodecInfo::new("vp9.0", CodecKind::Video(VideoCodec::Vp9)),
    CodecInfo::new("vp09.*", CodecKind::Video(VideoCodec::Vp9)),
    CodecInfo::new("av01.*", CodecKind::Video(VideoCodec::Av1)),
    CodecInfo::validated("mp4a.40.*", CodecKind::Audio(AudioCodec::Aac), is_valid_aac_object_type),
    CodecInfo::new("mp4a.66", CodecKind::Audio(AudioCodec::Aac)),
    CodecInfo::new("mp4a.67", CodecKind::Audio(AudioCodec::Aac)),
    CodecInfo::new("mp4a.68", CodecKind::Audio(AudioCodec::Aac)),
    CodecInfo::new("mp4a.69", CodecKind::Audio(AudioCodec::Mp3)),
    CodecInfo::new("mp4a.6B", CodecKind::Audio(AudioCodec::Mp3)),
    CodecInfo::new("mp3", CodecKind::Audio(AudioCodec::Mp3)),
    CodecInfo::new("opus", CodecKind::Audio(AudioCodec::Opus)),
    CodecInfo::new("Opus", CodecKind::Audio(AudioCodec::Opus)),
    CodecInfo::new("vorbis", CodecKind::Audio(AudioCodec::Vorbis)),
    CodecInfo::new("flac", CodecKind::Audio(AudioCodec::Flac)),
    CodecInfo::new("fLaC", CodecKind::Audio(AudioCodec::Flac)),
    CodecInfo::new("ac-3", CodecKind::Audio(AudioCodec::Ac3)),
    CodecInfo::new("mp4a.a5", CodecKind::Audio(AudioCodec::Ac3)),
    CodecInfo::new("ec-3", CodecKind::Audio(AudioCodec::Eac3)),
    CodecInfo::new("mp4a.a6", CodecKind::Audio(AudioCodec::Eac3)),
];

/// Identify `codec` using [`CODEC_TABLE`].
pub fn identify(codec: &str) -> Option<CodecKind> {
    CODEC_TABLE
        .iter()
        .find(|info| info.matches(codec))
        .map(|info| info.kind)
}

/// Match `pattern` against `value`; a trailing `*` matches any non-empty tail.
pub fn match_pattern(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.len() > prefix.len() && value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Accept `mp4a.40.N` only for audio object types a decoder can handle:
/// AAC Main (1), AAC LC (2), SBR/HE-AAC (5) and PS/HE-AACv2 (29).
/// A leading zero (`mp4a.40.02`) is tolerated.
pub fn is_valid_aac_object_type(codec: &str) -> bool {
    let Some(object_type) = codec.strip_prefix("mp4a.40.") else {
        return false;
    };
    match object_type.parse::<u8>() {
        Ok(value) => matches!(value, 1 | 2 | 5 | 29),
        Err(_) => false,
    }
}
