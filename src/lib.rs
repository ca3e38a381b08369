//! mediasource: a demuxer for incrementally appended media segments.
//!
//! Hosts register sources with [`ChunkDemuxer::add_id`], feed container
//! bytes through [`ChunkDemuxer::append_data`] and read timestamped access
//! units from the [`DemuxerStream`]s the demuxer exposes. Container formats
//! plug in through [`ms_parser::StreamParser`] implementations registered in
//! a [`ParserRegistry`].
//!
//! # Crates
//!
//! - [`ms_core`] - time types, access units, errors, configuration
//! - [`ms_parser`] - parser contract, byte queue, codec table, merge
//! - [`ms_stream`] - frame processing, track buffers, demuxer streams

pub mod demuxer;
pub mod source;

pub use demuxer::{AddStatus, ChunkDemuxer, DemuxerHost, DemuxerState, StatusCallback};
pub use source::{intersect_buffered_ranges, SourceHost, SourceUnit};

pub use ms_core;
pub use ms_parser;
pub use ms_stream;

pub use ms_core::config::DemuxerConfig;
pub use ms_core::{Error, MediaKind, MediaTime, PipelineStatus, Result, SourceId};
pub use ms_parser::ParserRegistry;
pub use ms_stream::{DemuxerStream, ReadResult};
