//! Input channels and the channel arena.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use splice_core::{MediaSource, TrackKind};

use crate::error::{Result, TimelineError};

/// What streams a channel contributes to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Video stream only.
    Video,
    /// Audio stream only.
    Audio,
    /// Both streams.
    AudioVideo,
    /// A still image, routed through the video pipeline.
    Image,
}

impl ChannelKind {
    /// Whether this channel feeds the video pipeline.
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video | Self::AudioVideo | Self::Image)
    }

    /// Whether this channel feeds the audio pipeline.
    pub fn has_audio(&self) -> bool {
        matches!(self, Self::Audio | Self::AudioVideo)
    }
}

/// Stable handle to a channel in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// One named input stream and its resolved time coordinates.
///
/// Channels are created once per timeline and mutated at segment boundaries
/// by [`Timeline::start_segment`](crate::Timeline::start_segment); they are
/// the only state that persists across segments. All times are microseconds.
pub struct InputChannel {
    /// Channel name.
    pub name: String,
    /// Backing media source.
    pub source: Arc<dyn MediaSource>,
    /// What streams this channel contributes.
    pub kind: ChannelKind,
    /// Media length from container metadata.
    pub length_us: i64,
    /// Where the video sub-pipeline starts consuming input this segment.
    pub video_input_start_us: i64,
    /// Where the audio sub-pipeline starts consuming input this segment.
    pub audio_input_start_us: i64,
    /// Where input consumption ends this segment; `None` is open-ended.
    pub input_end_us: Option<i64>,
    /// Input-to-output offset for the video sub-pipeline.
    pub video_offset_us: i64,
    /// Input-to-output offset for the audio sub-pipeline.
    pub audio_offset_us: i64,
    /// Input-side watermark; the next segment referencing this channel
    /// resumes here.
    pub input_watermark_us: i64,
    /// Duration of one source frame; drives frame-accurate seek rounding.
    pub frame_duration_us: i64,
    /// Display rotation of the source's video, from metadata.
    pub rotation_degrees: u32,
    /// Fractional seek carried into the next rounding.
    pub seek_remainder_us: i64,
    /// Fractional duration carried into the next rounding.
    pub duration_remainder_us: i64,
}

impl InputChannel {
    pub(crate) fn new(name: String, source: Arc<dyn MediaSource>, kind: ChannelKind) -> Self {
        Self {
            name,
            source,
            kind,
            length_us: 0,
            video_input_start_us: 0,
            audio_input_start_us: 0,
            input_end_us: None,
            video_offset_us: 0,
            audio_offset_us: 0,
            input_watermark_us: 0,
            frame_duration_us: 0,
            rotation_degrees: 0,
            seek_remainder_us: 0,
            duration_remainder_us: 0,
        }
    }

    /// Input start time for the given track.
    pub fn input_start_us(&self, track: TrackKind) -> i64 {
        match track {
            TrackKind::Video => self.video_input_start_us,
            TrackKind::Audio => self.audio_input_start_us,
        }
    }

    /// Input-to-output offset for the given track.
    pub fn offset_us(&self, track: TrackKind) -> i64 {
        match track {
            TrackKind::Video => self.video_offset_us,
            TrackKind::Audio => self.audio_offset_us,
        }
    }

    /// Map an input presentation time onto the output timeline.
    pub fn output_time_us(&self, track: TrackKind, input_time_us: i64) -> i64 {
        input_time_us + self.offset_us(track)
    }
}

impl fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputChannel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("length_us", &self.length_us)
            .field("video_input_start_us", &self.video_input_start_us)
            .field("audio_input_start_us", &self.audio_input_start_us)
            .field("input_end_us", &self.input_end_us)
            .field("video_offset_us", &self.video_offset_us)
            .field("audio_offset_us", &self.audio_offset_us)
            .field("input_watermark_us", &self.input_watermark_us)
            .finish()
    }
}

/// Arena of channel records indexed by stable [`ChannelId`]s.
///
/// Registration order is preserved; a segment's default duration comes from
/// its first referenced channel.
#[derive(Default)]
pub struct ChannelArena {
    channels: Vec<InputChannel>,
    by_name: HashMap<String, ChannelId>,
}

impl ChannelArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, failing on duplicate names.
    pub fn insert(
        &mut self,
        name: &str,
        source: Arc<dyn MediaSource>,
        kind: ChannelKind,
    ) -> Result<ChannelId> {
        if self.by_name.contains_key(name) {
            return Err(TimelineError::DuplicateChannel(name.to_string()));
        }
        let id = ChannelId(self.channels.len());
        self.channels
            .push(InputChannel::new(name.to_string(), source, kind));
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up a channel id by name.
    pub fn id_of(&self, name: &str) -> Result<ChannelId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| TimelineError::UnknownChannel(name.to_string()))
    }

    /// Get a channel by id.
    pub fn get(&self, id: ChannelId) -> &InputChannel {
        &self.channels[id.0]
    }

    /// Get a channel mutably by id.
    pub fn get_mut(&mut self, id: ChannelId) -> &mut InputChannel {
        &mut self.channels[id.0]
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterate channels in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &InputChannel)> {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, c)| (ChannelId(i), c))
    }

    /// Iterate channels mutably in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelId, &mut InputChannel)> {
        self.channels
            .iter_mut()
            .enumerate()
            .map(|(i, c)| (ChannelId(i), c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_core::{CoreError, Extractor, SourceMetadata};

    struct NullSource;

    impl MediaSource for NullSource {
        fn metadata(&self) -> splice_core::Result<SourceMetadata> {
            Ok(SourceMetadata::default())
        }

        fn open_extractor(&self) -> splice_core::Result<Box<dyn Extractor>> {
            Err(CoreError::Unsupported("null source".into()))
        }
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut arena = ChannelArena::new();
        let source: Arc<dyn MediaSource> = Arc::new(NullSource);
        arena
            .insert("movie", source.clone(), ChannelKind::AudioVideo)
            .unwrap();
        let err = arena.insert("movie", source, ChannelKind::Audio);
        assert!(matches!(err, Err(TimelineError::DuplicateChannel(_))));
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut arena = ChannelArena::new();
        let source: Arc<dyn MediaSource> = Arc::new(NullSource);
        arena.insert("b", source.clone(), ChannelKind::Video).unwrap();
        arena.insert("a", source, ChannelKind::Audio).unwrap();
        let names: Vec<_> = arena.iter().map(|(_, c)| c.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn test_kind_routing() {
        assert!(ChannelKind::Image.has_video());
        assert!(!ChannelKind::Image.has_audio());
        assert!(ChannelKind::AudioVideo.has_video());
        assert!(ChannelKind::AudioVideo.has_audio());
        assert!(!ChannelKind::Audio.has_video());
    }
}
