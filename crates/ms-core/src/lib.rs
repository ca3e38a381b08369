//! ms-core: shared types, IDs, errors, and configuration.
//!
//! This crate is the foundational dependency for the other ms-* crates,
//! providing the strongly typed presentation/decode timestamps, track
//! identifiers, decoder configurations, the [`AccessUnit`] buffer type,
//! time-range sets, a unified error type, and the demuxer configuration.

pub mod access_unit;
pub mod config;
pub mod error;
pub mod ids;
pub mod media;
pub mod ranges;
pub mod time;

// Re-export the most commonly used items at the crate root.
pub use access_unit::{AccessUnit, DiscardPadding, SharedAccessUnit};
pub use error::{Error, PipelineStatus, Result};
pub use ids::*;
pub use media::*;
pub use ranges::Ranges;
pub use time::{DecodeTimestamp, MediaTime};
