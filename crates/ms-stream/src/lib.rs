//! ms-stream: from processed frames to buffers a decoder can read.
//!
//! - [`FrameProcessor`] - timestamp offset, discontinuities, append windows
//! - [`TrackBufferStore`] - per-track ranges with seek, eviction and splicing
//! - [`DemuxerStream`] - the locked, read-latching handle around a store
//!
//! A source owns one `FrameProcessor`. The orchestrator owns the
//! `DemuxerStream`s; the processor only keeps weak handles to them, so a
//! removed source's streams go away with the orchestrator's references.

mod frame_processor;
mod range;
mod stream;
mod track_buffer;

pub use frame_processor::{AppendContext, FrameProcessor};
pub use range::BufferRange;
pub use stream::{
    run_completions, DemuxerStream, ReadCallback, ReadCompletion, ReadResult, StreamState,
};
pub use track_buffer::{ReadStatus, TrackBufferStore};
