//! Media kinds, codecs, and decoder configurations.
//!
//! Enums implement `Display` manually for consistent lowercase output.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time::MediaTime;

// ---------------------------------------------------------------------------
// MediaKind
// ---------------------------------------------------------------------------

/// The kind of elementary stream a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Text,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Text => write!(f, "text"),
        }
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Video codecs recognised in codec strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::Hevc => write!(f, "hevc"),
            Self::Vp8 => write!(f, "vp8"),
            Self::Vp9 => write!(f, "vp9"),
            Self::Av1 => write!(f, "av1"),
        }
    }
}

/// Audio codecs recognised in codec strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
    Vorbis,
    Flac,
    Ac3,
    Eac3,
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aac => write!(f, "aac"),
            Self::Mp3 => write!(f, "mp3"),
            Self::Opus => write!(f, "opus"),
            Self::Vorbis => write!(f, "vorbis"),
            Self::Flac => write!(f, "flac"),
            Self::Ac3 => write!(f, "ac3"),
            Self::Eac3 => write!(f, "eac3"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder configurations
// ---------------------------------------------------------------------------

/// Audio decoder configuration announced by an init segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDecoderConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Codec private data (e.g. AudioSpecificConfig).
    pub extra_data: Bytes,
    pub encrypted: bool,
    /// Decoder delay in frames that must be discarded at the start.
    pub codec_delay: u32,
    pub seek_preroll: MediaTime,
}

impl AudioDecoderConfig {
    pub fn new(codec: AudioCodec, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            extra_data: Bytes::new(),
            encrypted: false,
            codec_delay: 0,
            seek_preroll: MediaTime::ZERO,
        }
    }

    /// Duration of one sample period, the tolerance used when deciding
    /// whether two audio frames abut.
    pub fn sample_duration(&self) -> MediaTime {
        if self.sample_rate == 0 {
            return MediaTime::ZERO;
        }
        MediaTime::from_micros((1_000_000 / self.sample_rate as i64).max(1))
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }
}

/// Video decoder configuration announced by an init segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDecoderConfig {
    pub codec: VideoCodec,
    pub coded_width: u32,
    pub coded_height: u32,
    pub extra_data: Bytes,
    pub encrypted: bool,
}

impl VideoDecoderConfig {
    pub fn new(codec: VideoCodec, coded_width: u32, coded_height: u32) -> Self {
        Self {
            codec,
            coded_width,
            coded_height,
            extra_data: Bytes::new(),
            encrypted: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.coded_width > 0 && self.coded_height > 0
    }
}

/// Kind of a text track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextKind {
    Subtitles,
    Captions,
    Descriptions,
    Metadata,
}

/// Text track configuration announced by an init segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTrackConfig {
    pub kind: TextKind,
    pub label: String,
    pub language: String,
    /// Document-scoped id as written in the container.
    pub id: String,
}

impl TextTrackConfig {
    pub fn new(kind: TextKind, label: impl Into<String>, language: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            language: language.into(),
            id: id.into(),
        }
    }
}

/// Any of the per-kind decoder configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderConfig {
    Audio(AudioDecoderConfig),
    Video(VideoDecoderConfig),
    Text(TextTrackConfig),
}

impl DecoderConfig {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
            Self::Text(_) => MediaKind::Text,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        match self {
            Self::Audio(c) => c.encrypted,
            Self::Video(c) => c.encrypted,
            Self::Text(_) => false,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioDecoderConfig> {
        match self {
            Self::Audio(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoDecoderConfig> {
        match self {
            Self::Video(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextTrackConfig> {
        match self {
            Self::Text(c) => Some(c),
            _ => None,
        }
    }
}

impl From<AudioDecoderConfig> for DecoderConfig {
    fn from(c: AudioDecoderConfig) -> Self {
        Self::Audio(c)
    }
}

impl From<VideoDecoderConfig> for DecoderConfig {
    fn from(c: VideoDecoderConfig) -> Self {
        Self::Video(c)
    }
}

impl From<TextTrackConfig> for DecoderConfig {
    fn from(c: TextTrackConfig) -> Self {
        Self::Text(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_duration_for_common_rates() {
        let cfg = AudioDecoderConfig::new(AudioCodec::Aac, 48_000, 2);
        assert_eq!(cfg.sample_duration(), MediaTime::from_micros(20));
        let cfg = AudioDecoderConfig::new(AudioCodec::Opus, 0, 2);
        assert_eq!(cfg.sample_duration(), MediaTime::ZERO);
        assert!(!cfg.is_valid());
    }

    #[test]
    fn decoder_config_accessors() {
        let cfg: DecoderConfig = VideoDecoderConfig::new(VideoCodec::Vp9, 640, 360).into();
        assert_eq!(cfg.kind(), MediaKind::Video);
        assert!(cfg.as_video().is_some());
        assert!(cfg.as_audio().is_none());
        assert!(!cfg.is_encrypted());
    }

    #[test]
    fn display() {
        assert_eq!(MediaKind::Text.to_string(), "text");
        assert_eq!(VideoCodec::Hevc.to_string(), "hevc");
        assert_eq!(AudioCodec::Eac3.to_string(), "eac3");
    }
}
