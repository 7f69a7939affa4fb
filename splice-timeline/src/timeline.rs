//! The timeline aggregate.

use std::sync::Arc;

use splice_core::{MediaSource, TrackKind};
use tracing::debug;

use crate::channel::{ChannelArena, ChannelId, ChannelKind};
use crate::error::{Result, TimelineError};
use crate::segment::{Segment, SegmentBuilder};

/// A caller-owned description of the output: named input channels and the
/// ordered segments that reference them.
///
/// ```text
/// let mut timeline = Timeline::new();
/// timeline.add_channel("movie1", source1)?;
/// timeline.add_channel("movie2", source2)?;
/// timeline
///     .create_segment()?
///     .output("movie1")?
///     .duration(1_000_000);
/// timeline
///     .create_segment()?
///     .output_filtered("movie1", Filter::RampDown { duration_us: 500_000 })?
///     .output_filtered("movie2", Filter::RampUp { duration_us: 500_000 })?
///     .duration(500_000);
/// timeline.create_segment()?.output("movie2")?;
/// ```
#[derive(Default)]
pub struct Timeline {
    arena: ChannelArena,
    segments: Vec<Segment>,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel carrying both audio and video.
    pub fn add_channel(&mut self, name: &str, source: Arc<dyn MediaSource>) -> Result<ChannelId> {
        self.arena.insert(name, source, ChannelKind::AudioVideo)
    }

    /// Register a video-only channel.
    pub fn add_video_only_channel(
        &mut self,
        name: &str,
        source: Arc<dyn MediaSource>,
    ) -> Result<ChannelId> {
        self.arena.insert(name, source, ChannelKind::Video)
    }

    /// Register an audio-only channel.
    pub fn add_audio_only_channel(
        &mut self,
        name: &str,
        source: Arc<dyn MediaSource>,
    ) -> Result<ChannelId> {
        self.arena.insert(name, source, ChannelKind::Audio)
    }

    /// Register a channel with an explicit kind.
    pub fn add_channel_of_kind(
        &mut self,
        name: &str,
        source: Arc<dyn MediaSource>,
        kind: ChannelKind,
    ) -> Result<ChannelId> {
        self.arena.insert(name, source, kind)
    }

    /// Append a segment and return its builder.
    ///
    /// Fails if an earlier segment omitted its duration; only the last
    /// segment may be open-ended.
    pub fn create_segment(&mut self) -> Result<SegmentBuilder<'_>> {
        if let Some(last) = self.segments.last() {
            if last.duration_us.is_none() {
                return Err(TimelineError::OpenEndedNotLast);
            }
        }
        for segment in &mut self.segments {
            segment.is_last = false;
        }
        self.segments.push(Segment::new());
        let index = self.segments.len() - 1;
        Ok(SegmentBuilder::new(self, index))
    }

    /// The registered channels.
    pub fn channels(&self) -> &ChannelArena {
        &self.arena
    }

    /// Mutable access to the channel records.
    pub fn channels_mut(&mut self) -> &mut ChannelArena {
        &mut self.arena
    }

    /// The segments in order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The segment at `index`.
    pub fn segment(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    /// Mutable access to the segment at `index`.
    pub fn segment_mut(&mut self, index: usize) -> &mut Segment {
        &mut self.segments[index]
    }

    /// Split borrow: one segment plus the channel arena. Track pipelines use
    /// this to walk a segment while updating channel records.
    pub fn segment_and_channels_mut(
        &mut self,
        index: usize,
    ) -> (&mut Segment, &mut ChannelArena) {
        (&mut self.segments[index], &mut self.arena)
    }

    /// Whether a later segment than `index` references `channel`.
    pub fn channel_referenced_after(&self, index: usize, channel: ChannelId) -> bool {
        self.segments[index + 1..]
            .iter()
            .any(|s| s.channel_entry(channel).is_some())
    }

    /// Total output duration in microseconds, or `None` when the final
    /// segment is open-ended.
    pub fn total_duration_us(&self) -> Option<i64> {
        let mut total = 0i64;
        for segment in &self.segments {
            total += segment
                .resolved_duration_us()
                .or_else(|| segment.effective_duration_us(&self.arena))?;
        }
        Some(total)
    }

    /// Probe every channel's source metadata, filling in media length and
    /// frame duration. Fails when a channel's kind requires a stream its
    /// source does not carry.
    pub fn probe_metadata(&mut self) -> Result<()> {
        for (_, channel) in self.arena.iter_mut() {
            let metadata = channel.source.metadata().map_err(TimelineError::Core)?;
            if channel.kind.has_video() && !metadata.has_video {
                return Err(TimelineError::MissingStream {
                    name: channel.name.clone(),
                    kind: TrackKind::Video,
                });
            }
            if channel.kind.has_audio() && !metadata.has_audio {
                return Err(TimelineError::MissingStream {
                    name: channel.name.clone(),
                    kind: TrackKind::Audio,
                });
            }
            channel.length_us = metadata.duration_us;
            channel.frame_duration_us = metadata.frame_duration_us.unwrap_or(0);
            channel.rotation_degrees = metadata.rotation_degrees;
            debug!(
                channel = %channel.name,
                length_us = channel.length_us,
                frame_duration_us = channel.frame_duration_us,
                "probed channel metadata"
            );
        }
        Ok(())
    }

    /// Validate the timeline for consistency before transcoding.
    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(TimelineError::Empty);
        }
        for (index, segment) in self.segments.iter().enumerate() {
            if segment.channels.is_empty() {
                return Err(TimelineError::EmptySegment { index });
            }
            if segment.duration_us.is_none() && index + 1 != self.segments.len() {
                return Err(TimelineError::OpenEndedNotLast);
            }
        }
        debug_assert_eq!(
            self.segments.iter().filter(|s| s.is_last).count(),
            1,
            "exactly one segment must be last"
        );
        Ok(())
    }

    /// Resolve segment `index`'s time coordinates against the given output
    /// start and per-track presentation watermarks. This is the authoritative
    /// mutation point for channel records.
    pub fn start_segment(
        &mut self,
        index: usize,
        output_start_us: i64,
        video_watermark_us: i64,
        audio_watermark_us: i64,
    ) -> Result<()> {
        let previous_end = if index == 0 {
            0
        } else {
            let prev = &self.segments[index - 1];
            prev.output_start_us + prev.resolved_duration_us().unwrap_or(0)
        };
        let output_start_us = output_start_us.max(previous_end);
        let (segment, arena) = self.segment_and_channels_mut(index);
        segment.resolve(arena, output_start_us, video_watermark_us, audio_watermark_us)
    }

    /// Clamp segment `index`'s channel end times after an early decoder
    /// end-of-stream on `track`.
    pub fn force_end_of_stream(
        &mut self,
        index: usize,
        track: TrackKind,
        output_presentation_us: i64,
    ) {
        let (segment, arena) = self.segment_and_channels_mut(index);
        segment.force_end_of_stream(arena, track, output_presentation_us);
    }
}
