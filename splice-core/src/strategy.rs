//! Output format strategy.

use crate::format::{AudioFormat, VideoFormat};

/// Decides the output format for each track of a transcode.
///
/// Returning `None` for a track elects passthrough: the track's samples are
/// copied to the output container without decoding or re-encoding.
pub trait FormatStrategy {
    /// Output video format for the given input format, or `None` for
    /// passthrough.
    fn video_output_format(&self, input: &VideoFormat) -> Option<VideoFormat>;

    /// Output audio format for the given input format, or `None` for
    /// passthrough.
    fn audio_output_format(&self, input: &AudioFormat) -> Option<AudioFormat>;
}
