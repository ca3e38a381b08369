//! Unified error type for the mediasource crates.
//!
//! Every fallible operation in the parser, frame processor, track stores and
//! the demuxer funnels its failure into [`Error`]. [`Error::pipeline_status`]
//! maps an error onto the status reported through host callbacks.

use std::fmt;

use crate::time::MediaTime;

/// Unified error type covering all failure modes of the demuxer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte stream could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A frame carried a missing, negative or otherwise unusable timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// The parser produced buffer queues that cannot be merged in decode order.
    #[error("Buffer queues are not in decode order (last {last}, candidate {candidate})")]
    MergeOrder {
        /// Decode time of the last buffer already merged.
        last: MediaTime,
        /// Decode time of the offending candidate.
        candidate: MediaTime,
    },

    /// An init segment disagrees with what the source was registered with.
    #[error("Config mismatch: {0}")]
    ConfigMismatch(String),

    /// The MIME type or codec list is not supported.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "source", "track").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The operation is not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be loaded or parsed.
    #[error("Config error: {0}")]
    Config(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Convenience constructor for [`Error::Parse`].
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Convenience constructor for [`Error::InvalidTimestamp`].
    pub fn invalid_timestamp(msg: impl Into<String>) -> Self {
        Error::InvalidTimestamp(msg.into())
    }

    /// Convenience constructor for [`Error::ConfigMismatch`].
    pub fn config_mismatch(msg: impl Into<String>) -> Self {
        Error::ConfigMismatch(msg.into())
    }

    /// Convenience constructor for [`Error::Unsupported`].
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::InvalidState`].
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Whether this error only rejects the current append instead of
    /// terminating the whole demuxer.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConfigMismatch(_) | Error::NotFound { .. } | Error::InvalidState(_)
        )
    }

    /// Map this error to the status delivered through host callbacks.
    pub fn pipeline_status(&self) -> PipelineStatus {
        match self {
            Error::Parse(_)
            | Error::InvalidTimestamp(_)
            | Error::MergeOrder { .. }
            | Error::ConfigMismatch(_) => PipelineStatus::DecodeError,
            Error::Unsupported(_) => PipelineStatus::DemuxerCouldNotParse,
            Error::NotFound { .. } | Error::InvalidState(_) => PipelineStatus::AbortError,
            Error::Config(_) | Error::Io { .. } => PipelineStatus::DemuxerCouldNotOpen,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Status values reported to init, seek and error callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStatus {
    Ok,
    /// An operation was aborted (e.g. shutdown during init).
    AbortError,
    /// Decoding or parsing of appended data failed.
    DecodeError,
    /// A network-level failure reported by the host at end of stream.
    NetworkError,
    /// The demuxer could not parse the stream at all.
    DemuxerCouldNotParse,
    /// The demuxer could not be opened.
    DemuxerCouldNotOpen,
    /// The init segment declared no usable streams.
    DemuxerNoSupportedStreams,
}

impl PipelineStatus {
    pub fn is_ok(self) -> bool {
        self == PipelineStatus::Ok
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::AbortError => "abort_error",
            Self::DecodeError => "decode_error",
            Self::NetworkError => "network_error",
            Self::DemuxerCouldNotParse => "demuxer_could_not_parse",
            Self::DemuxerCouldNotOpen => "demuxer_could_not_open",
            Self::DemuxerNoSupportedStreams => "demuxer_no_supported_streams",
        };
        f.write_str(s)
    }
}
