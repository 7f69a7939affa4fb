//! Media source abstraction.
//!
//! A [`MediaSource`] stands for one input container. The engine probes its
//! metadata once up front and opens extractors lazily, per track pipeline,
//! only when a segment first references the channel.

use crate::codec::Extractor;
use crate::error::Result;

/// Container-level metadata for a source, gathered before transcoding.
#[derive(Debug, Clone, Default)]
pub struct SourceMetadata {
    /// Total media length in microseconds.
    pub duration_us: i64,
    /// Display rotation of the video track in degrees.
    pub rotation_degrees: u32,
    /// Whether the container carries a video track.
    pub has_video: bool,
    /// Whether the container carries an audio track.
    pub has_audio: bool,
    /// Duration of one video frame in microseconds, if known. Drives
    /// frame-accurate seek rounding.
    pub frame_duration_us: Option<i64>,
}

/// One input container, openable any number of times.
pub trait MediaSource: Send + Sync {
    /// Probe container metadata.
    fn metadata(&self) -> Result<SourceMetadata>;

    /// Open a fresh extractor over this source.
    fn open_extractor(&self) -> Result<Box<dyn Extractor>>;
}
