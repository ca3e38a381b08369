//! MIME type and codec based parser selection.

use std::fmt;
use std::sync::Arc;

use ms_core::{Error, Result};

use crate::codecs::{self, CodecKind};
use crate::parser::StreamParser;

/// Constructs a fresh parser instance.
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn StreamParser> + Send + Sync>;

struct RegistryEntry {
    mime_type: String,
    codec_patterns: Vec<&'static str>,
    factory: ParserFactory,
}

/// A parser chosen for a `(mime type, codecs)` pair.
pub struct ResolvedParser {
    pub parser: Box<dyn StreamParser>,
    pub has_audio: bool,
    pub has_video: bool,
    /// Identified codecs, in the order they were requested.
    pub codecs: Vec<CodecKind>,
}

impl fmt::Debug for ResolvedParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedParser")
            .field("has_audio", &self.has_audio)
            .field("has_video", &self.has_video)
            .field("codecs", &self.codecs)
            .finish_non_exhaustive()
    }
}

/// Maps MIME types to parser factories and the codec patterns each allows.
#[derive(Default)]
pub struct ParserRegistry {
    entries: Vec<RegistryEntry>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `mime_type`. Codec strings passed to
    /// [`create`](Self::create) must match one of `codec_patterns`.
    /// A later registration for the same MIME type replaces the earlier one.
    pub fn register<F>(&mut self, mime_type: &str, codec_patterns: &[&'static str], factory: F)
    where
        F: Fn() -> Box<dyn StreamParser> + Send + Sync + 'static,
    {
        let mime_type = mime_type.to_ascii_lowercase();
        self.entries.retain(|e| e.mime_type != mime_type);
        self.entries.push(RegistryEntry {
            mime_type,
            codec_patterns: codec_patterns.to_vec(),
            factory: Arc::new(factory),
        });
    }

    pub fn is_registered(&self, mime_type: &str) -> bool {
        self.entry(mime_type).is_some()
    }

    /// Whether [`create`](Self::create) would succeed for this pair.
    pub fn is_supported(&self, mime_type: &str, codecs: &[&str]) -> bool {
        self.resolve_codecs(mime_type, codecs).is_ok()
    }

    /// Build a parser for `mime_type` that accepts every codec in `codecs`.
    ///
    /// Fails with [`Error::Unsupported`] if the MIME type is unknown, the
    /// codec list is empty, or any codec is not allowed for the type.
    pub fn create(&self, mime_type: &str, codecs: &[&str]) -> Result<ResolvedParser> {
        let (entry, kinds) = self.resolve_codecs(mime_type, codecs)?;

        let has_audio = kinds.iter().any(|k| matches!(k, CodecKind::Audio(_)));
        let has_video = kinds.iter().any(|k| matches!(k, CodecKind::Video(_)));
        tracing::debug!(
            mime_type,
            ?codecs,
            has_audio,
            has_video,
            "Creating stream parser"
        );

        Ok(ResolvedParser {
            parser: (entry.factory)(),
            has_audio,
            has_video,
            codecs: kinds,
        })
    }

    fn entry(&self, mime_type: &str) -> Option<&RegistryEntry> {
        let mime_type = mime_type.to_ascii_lowercase();
        self.entries.iter().find(|e| e.mime_type == mime_type)
    }

    fn resolve_codecs(&self, mime_type: &str, codecs: &[&str]) -> Result<(&RegistryEntry, Vec<CodecKind>)> {
        let entry = self
            .entry(mime_type)
            .ok_or_else(|| Error::unsupported(format!("no parser for MIME type {mime_type}")))?;

        if codecs.is_empty() {
            return Err(Error::unsupported(format!("{mime_type} requires a codecs parameter")));
        }

        let mut kinds = Vec::with_capacity(codecs.len());
        for codec in codecs {
            let allowed = entry
                .codec_patterns
                .iter()
                .any(|pattern| codecs::match_pattern(pattern, codec));
            let kind = codecs::identify(codec).filter(|_| allowed).ok_or_else(|| {
                Error::unsupported(format!("codec {codec} is not supported in {mime_type}"))
            })?;
            kinds.push(kind);
        }

        Ok((entry, kinds))
    }
}
