//! Timeline error types.

use splice_core::{CoreError, TrackKind};
use thiserror::Error;

/// Timeline configuration and resolution errors.
#[derive(Error, Debug)]
pub enum TimelineError {
    /// Core error.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// A channel name was registered twice.
    #[error("Channel '{0}' is already registered")]
    DuplicateChannel(String),

    /// A segment referenced a channel that was never registered.
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    /// A segment was created after one without an explicit duration.
    #[error("Only the last segment may omit a duration")]
    OpenEndedNotLast,

    /// The timeline has no segments.
    #[error("Timeline has no segments")]
    Empty,

    /// A segment references no channels.
    #[error("Segment {index} references no channels")]
    EmptySegment { index: usize },

    /// A channel's source lacks the stream its kind requires.
    #[error("Channel '{name}' has no {kind} stream")]
    MissingStream { name: String, kind: TrackKind },
}

/// Timeline result type.
pub type Result<T> = std::result::Result<T, TimelineError>;
