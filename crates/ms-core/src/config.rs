//! Demuxer configuration.
//!
//! [`DemuxerConfig`] is deserialized from TOML. Every field defaults
//! sensibly so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::media::MediaKind;
use crate::Error;

/// Default per-track byte budget for audio stores.
pub const DEFAULT_AUDIO_MEMORY_LIMIT: usize = 12 * 1024 * 1024;
/// Default per-track byte budget for video stores.
pub const DEFAULT_VIDEO_MEMORY_LIMIT: usize = 150 * 1024 * 1024;
/// Default per-track byte budget for text stores.
pub const DEFAULT_TEXT_MEMORY_LIMIT: usize = 1024 * 1024;

/// Root demuxer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxerConfig {
    pub memory: MemoryConfig,
    /// Generate crossfade splice buffers for overlapping audio appends.
    pub splice_frames_enabled: bool,
    /// Drop text tracks declared by init segments instead of exposing them.
    pub ignore_text_tracks: bool,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            splice_frames_enabled: true,
            ignore_text_tracks: false,
        }
    }
}

impl DemuxerConfig {
    /// Deserialize a `DemuxerConfig` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("config parse error: {e}")))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        for warning in config.validate() {
            tracing::warn!("{}: {warning}", path.display());
        }
        Ok(config)
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None`, missing, or unparsable.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match Self::load(path) {
            Ok(config) => config,
            Err(Error::Io { source }) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No demuxer config at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load demuxer config {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (name, limit) in [
            ("audio", self.memory.audio),
            ("video", self.memory.video),
            ("text", self.memory.text),
        ] {
            if limit == 0 {
                warnings.push(format!("memory.{name} is 0; every append will trigger eviction"));
            }
        }
        if self.memory.audio > self.memory.video {
            warnings.push("memory.audio exceeds memory.video".into());
        }
        warnings
    }

    /// Byte budget for a track of the given kind.
    pub fn memory_limit(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Audio => self.memory.audio,
            MediaKind::Video => self.memory.video,
            MediaKind::Text => self.memory.text,
        }
    }
}

/// Per-kind byte budgets enforced by eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub audio: usize,
    pub video: usize,
    pub text: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            audio: DEFAULT_AUDIO_MEMORY_LIMIT,
            video: DEFAULT_VIDEO_MEMORY_LIMIT,
            text: DEFAULT_TEXT_MEMORY_LIMIT,
        }
    }
}
