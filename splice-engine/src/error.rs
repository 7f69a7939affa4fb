//! Engine error types.

use std::time::Duration;

use splice_core::{CoreError, TrackKind};
use splice_timeline::TimelineError;
use thiserror::Error;

/// Errors surfaced by the transcoding engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Core error.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Timeline error.
    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Unsupported format combination.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A buffer arrived before the decoded format was known.
    #[error("Buffer received before format for {0} track")]
    BufferBeforeFormat(TrackKind),

    /// The pipeline made no progress for longer than the stall limit.
    #[error("Pipeline stalled for more than {0:?}")]
    Stalled(Duration),

    /// Resource teardown failed after an otherwise successful run.
    #[error("Teardown failed: {0}")]
    Teardown(String),
}

/// Engine result type.
pub type Result<T> = std::result::Result<T, EngineError>;
