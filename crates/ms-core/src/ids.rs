//! Typed identifiers for tracks and sources.
//!
//! Track ids are small integers. Two fixed ids denote "the" audio and the
//! video track of a source; text tracks use ids assigned by the parser.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single elementary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(u32);

impl TrackId {
    /// The audio track of a source.
    pub const AUDIO: TrackId = TrackId(u32::MAX - 1);
    /// The video track of a source.
    pub const VIDEO: TrackId = TrackId(u32::MAX - 2);

    /// Create a parser-assigned track id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn is_sentinel(self) -> bool {
        self == Self::AUDIO || self == Self::VIDEO
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::AUDIO => f.write_str("audio"),
            Self::VIDEO => f.write_str("video"),
            TrackId(id) => write!(f, "text#{id}"),
        }
    }
}

impl From<u32> for TrackId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifier of a registered content source (one source buffer).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(TrackId::AUDIO, TrackId::VIDEO);
        assert!(TrackId::AUDIO.is_sentinel());
        assert!(!TrackId::new(3).is_sentinel());
    }

    #[test]
    fn display() {
        assert_eq!(TrackId::AUDIO.to_string(), "audio");
        assert_eq!(TrackId::new(7).to_string(), "text#7");
        assert_eq!(SourceId::from("v1").to_string(), "v1");
    }
}
