//! Track and media format descriptors.
//!
//! Formats describe the negotiated parameters of a single elementary stream.
//! They are produced by extractors (input side), transformed by a
//! [`FormatStrategy`](crate::strategy::FormatStrategy), and reported back by
//! encoders once their actual output format is known.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of an elementary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Format of a video track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Codec name, e.g. "h264".
    pub codec: String,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Nominal frame rate in frames per second.
    pub frame_rate: f64,
    /// Target bit rate in bits per second, if constrained.
    pub bit_rate: Option<u32>,
}

impl VideoFormat {
    /// Duration of one frame in microseconds, or `None` for an unknown rate.
    pub fn frame_duration_us(&self) -> Option<i64> {
        if self.frame_rate > 0.0 {
            Some((crate::time::MICROS_PER_SECOND as f64 / self.frame_rate) as i64)
        } else {
            None
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}@{}", self.codec, self.width, self.height, self.frame_rate)
    }
}

/// Format of an audio track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Codec name, e.g. "aac".
    pub codec: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels (1 or 2 supported by the mixer).
    pub channel_count: u32,
    /// Target bit rate in bits per second, if constrained.
    pub bit_rate: Option<u32>,
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz {}ch", self.codec, self.sample_rate, self.channel_count)
    }
}

/// Format of a single track, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl TrackFormat {
    /// Get the track kind.
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Video(_) => TrackKind::Video,
            Self::Audio(_) => TrackKind::Audio,
        }
    }

    /// Get the video format, if this is a video track.
    pub fn as_video(&self) -> Option<&VideoFormat> {
        match self {
            Self::Video(v) => Some(v),
            Self::Audio(_) => None,
        }
    }

    /// Get the audio format, if this is an audio track.
    pub fn as_audio(&self) -> Option<&AudioFormat> {
        match self {
            Self::Audio(a) => Some(a),
            Self::Video(_) => None,
        }
    }
}

impl fmt::Display for TrackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video(v) => v.fmt(f),
            Self::Audio(a) => a.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_display() {
        assert_eq!(TrackKind::Video.to_string(), "video");
        assert_eq!(TrackKind::Audio.to_string(), "audio");
    }

    #[test]
    fn test_frame_duration() {
        let format = VideoFormat {
            codec: "h264".into(),
            width: 1280,
            height: 720,
            frame_rate: 30.0,
            bit_rate: None,
        };
        assert_eq!(format.frame_duration_us(), Some(33_333));
    }

    #[test]
    fn test_track_format_accessors() {
        let format = TrackFormat::Audio(AudioFormat {
            codec: "aac".into(),
            sample_rate: 48_000,
            channel_count: 2,
            bit_rate: Some(128_000),
        });
        assert_eq!(format.kind(), TrackKind::Audio);
        assert!(format.as_audio().is_some());
        assert!(format.as_video().is_none());
    }

    #[test]
    fn test_format_serialization() {
        let format = TrackFormat::Video(VideoFormat {
            codec: "h264".into(),
            width: 640,
            height: 480,
            frame_rate: 24.0,
            bit_rate: None,
        });
        let json = serde_json::to_string(&format).unwrap();
        assert!(json.contains("h264"));
    }
}
