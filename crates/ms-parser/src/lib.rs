//! ms-parser: the boundary between container parsers and the demuxer core.
//!
//! Concrete container parsers live outside this workspace. This crate gives
//! them what they share:
//!
//! - [`ByteQueue`] - the self-compacting inbox for not-yet-parsed bytes
//! - [`StreamParser`] / [`ParserEvents`] - the parse contract and its event sink
//! - [`merge_buffer_queues`] - interleaves per-track output by decode time
//! - [`ParserRegistry`] / [`codecs`] - MIME type and codec string resolution
//!
//! # Architecture
//!
//! A source feeds raw bytes to its parser. The parser accumulates them in a
//! `ByteQueue`, and as soon as a complete init or media segment is available
//! it reports it through `ParserEvents`:
//!
//! 1. `on_new_configs` for every init segment
//! 2. `on_init` once, after the first init segment
//! 3. `on_new_media_segment` / `on_new_buffers` / `on_end_of_media_segment`
//!    for each media segment

mod byte_queue;
pub mod codecs;
mod merge;
mod parser;
mod registry;

pub use byte_queue::ByteQueue;
pub use codecs::{CodecInfo, CodecKind};
pub use merge::merge_buffer_queues;
pub use parser::{
    BufferQueue, BufferQueues, InitDataType, InitParameters, Liveness, MediaConfigs,
    ParserEvents, ParserOptions, StreamParser, TextBufferQueueMap, TextConfigMap,
};
pub use registry::{ParserFactory, ParserRegistry, ResolvedParser};
