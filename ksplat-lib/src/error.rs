use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KsplatError>;

#[derive(Debug, Error)]
pub enum KsplatError {
    #[error("Malformed PLY: {0}")]
    Format(String),

    #[error("Unsupported PLY encoding: {0} (only binary_little_endian 1.0 is supported)")]
    UnsupportedEncoding(String),

    #[error("Unknown PLY property type: {0}")]
    UnknownPropertyType(String),

    #[error("No 'end_header' found before end of input")]
    MissingHeaderEnd,

    #[error("Missing required property: {0}")]
    MissingProperty(String),

    #[error("Binary data is too short, need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Nothing to encode: every splat was filtered out")]
    NothingToEncode,

    #[error("Invalid encoder options: {0}")]
    InvalidOptions(String),

    #[error("Corrupt splat buffer: {0}")]
    CorruptBuffer(String),

    #[error("Unsupported splat buffer version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Zstandard compression failed: {0}")]
    ZstdCompress(String),

    #[error("Zstandard decompression failed: {0}")]
    ZstdDecompress(String),

    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}

impl KsplatError {
    /// True for errors caused by the input bytes rather than by the caller's options.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            KsplatError::Format(_)
                | KsplatError::UnsupportedEncoding(_)
                | KsplatError::UnknownPropertyType(_)
                | KsplatError::MissingHeaderEnd
                | KsplatError::MissingProperty(_)
                | KsplatError::Truncated { .. }
        )
    }
}

/// Failure of a single depth-sort pass. Contained by the sort engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SortError {
    #[error("Sort pass panicked: {0}")]
    PassPanicked(String),

    #[error("Sort worker is no longer running")]
    WorkerDisconnected,
}
