//! Error types for the Splice engine.

use thiserror::Error;

use crate::format::TrackKind;

/// Main error type shared by the Splice crates.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Codec session errors (decoding/encoding).
    #[error("Codec error: {0}")]
    Codec(String),

    /// Container errors (extracting/muxing).
    #[error("Container error: {0}")]
    Container(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unsupported feature or format combination.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A track's output format was reported more than once.
    #[error("{0} output format changed twice")]
    FormatChangedTwice(TrackKind),

    /// Output could not be determined before sample data arrived.
    #[error("Could not determine actual {0} output format")]
    FormatUndetermined(TrackKind),

    /// End of stream reached.
    #[error("End of stream")]
    EndOfStream,
}

/// Result type for the Splice crates.
pub type Result<T> = std::result::Result<T, CoreError>;
