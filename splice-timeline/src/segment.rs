//! Segments and the time-resolution algorithm.

use std::collections::HashMap;

use splice_core::time::round_to_frame;
use splice_core::TrackKind;
use tracing::debug;

use crate::channel::{ChannelArena, ChannelId};
use crate::error::Result;
use crate::filter::Filter;
use crate::timeline::Timeline;

/// Join row between a [`Segment`] and an input channel.
///
/// Carries the per-segment filter and the resolved, frame-rounded seek. The
/// audio and video sub-pipelines consume the seek at different times, so each
/// tracks its own applied flag.
#[derive(Debug)]
pub struct SegmentChannel {
    /// The referenced channel.
    pub channel: ChannelId,
    /// Channel name, for pipeline keys and logging.
    pub name: String,
    /// Filter applied to this channel for this segment.
    pub filter: Option<Filter>,
    /// Seek rounded down to a frame boundary by resolution.
    pub resolved_seek_us: i64,
    /// Whether the video sub-pipeline has consumed the seek.
    pub video_seek_applied: bool,
    /// Whether the audio sub-pipeline has consumed the seek.
    pub audio_seek_applied: bool,
}

/// One ordered step of the output timeline.
pub struct Segment {
    pub(crate) channels: Vec<SegmentChannel>,
    pub(crate) seeks: HashMap<ChannelId, i64>,
    pub(crate) duration_us: Option<i64>,
    /// Output time at which this segment begins, set by resolution.
    pub output_start_us: i64,
    /// Whether this is the final segment of the timeline.
    pub is_last: bool,
    /// Segment duration resolved at start time.
    pub(crate) resolved_duration_us: Option<i64>,
}

impl Segment {
    pub(crate) fn new() -> Self {
        Self {
            channels: Vec::new(),
            seeks: HashMap::new(),
            duration_us: None,
            output_start_us: 0,
            is_last: true,
            resolved_duration_us: None,
        }
    }

    /// Channels referenced by this segment, in declaration order.
    pub fn channels(&self) -> &[SegmentChannel] {
        &self.channels
    }

    /// Mutable access to the channel joins (seek-applied bookkeeping).
    pub fn channels_mut(&mut self) -> &mut [SegmentChannel] {
        &mut self.channels
    }

    /// The explicitly configured duration, if any.
    pub fn explicit_duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    /// The duration resolved by `start`, if resolution has run. `None` after
    /// resolution means the segment is open-ended.
    pub fn resolved_duration_us(&self) -> Option<i64> {
        self.resolved_duration_us
    }

    /// Best-effort duration before resolution: the explicit duration, else
    /// the first referenced channel's source length minus its seek.
    pub fn effective_duration_us(&self, arena: &ChannelArena) -> Option<i64> {
        if let Some(duration) = self.duration_us {
            return Some(duration);
        }
        let first = self.channels.first()?;
        let channel = arena.get(first.channel);
        let seek = self.seeks.get(&first.channel).copied().unwrap_or(0);
        Some((channel.length_us - seek).max(0))
    }

    /// The join row for `channel`, if referenced.
    pub fn channel_entry(&self, channel: ChannelId) -> Option<&SegmentChannel> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    /// Resolve this segment's absolute time coordinates.
    ///
    /// For every referenced channel: the requested seek (plus any carried
    /// remainder) is rounded down to a whole frame, the remainder carried
    /// forward on the channel; input consumption starts at the channel's
    /// input watermark plus the rounded seek; the per-track offsets map that
    /// input position to the given presentation watermarks; and the channel's
    /// input watermark advances past the resolved duration.
    pub(crate) fn resolve(
        &mut self,
        arena: &mut ChannelArena,
        output_start_us: i64,
        video_watermark_us: i64,
        audio_watermark_us: i64,
    ) -> Result<()> {
        self.output_start_us = output_start_us;

        // An unset duration (last segment only) is open-ended; the estimate
        // from the first channel's remaining length still feeds duration
        // bookkeeping and progress totals.
        let estimated_duration = self.channels.first().map(|sc| {
            let channel = arena.get(sc.channel);
            let seek = self.seeks.get(&sc.channel).copied().unwrap_or(0);
            (channel.length_us - channel.input_watermark_us - seek).max(0)
        });

        for sc in &mut self.channels {
            let channel = arena.get_mut(sc.channel);
            let requested_seek = self.seeks.get(&sc.channel).copied().unwrap_or(0);

            let (actual_seek, seek_remainder) = round_to_frame(
                requested_seek + channel.seek_remainder_us,
                channel.frame_duration_us,
            );
            channel.seek_remainder_us = seek_remainder;
            sc.resolved_seek_us = actual_seek;
            sc.video_seek_applied = false;
            sc.audio_seek_applied = false;

            let input_start = channel.input_watermark_us + actual_seek;
            channel.video_input_start_us = input_start;
            channel.audio_input_start_us = input_start;
            channel.video_offset_us = video_watermark_us - input_start;
            channel.audio_offset_us = audio_watermark_us - input_start;

            match self.duration_us {
                Some(duration) => {
                    let (actual_duration, duration_remainder) = round_to_frame(
                        duration + channel.duration_remainder_us,
                        channel.frame_duration_us,
                    );
                    channel.duration_remainder_us = duration_remainder;
                    channel.input_end_us = Some(input_start + actual_duration);
                    channel.input_watermark_us = input_start + actual_duration;
                }
                None => {
                    // Open-ended: consume until source exhaustion.
                    channel.input_end_us = None;
                    channel.input_watermark_us = channel.length_us.max(input_start);
                }
            }

            debug!(
                channel = %channel.name,
                input_start_us = input_start,
                input_end_us = ?channel.input_end_us,
                video_offset_us = channel.video_offset_us,
                audio_offset_us = channel.audio_offset_us,
                "resolved segment channel"
            );
        }

        self.resolved_duration_us = self.duration_us.or(estimated_duration);
        Ok(())
    }

    /// Retroactively clamp the referenced channels' end times after a decoder
    /// reported end-of-stream before the segment's nominal boundary.
    pub fn force_end_of_stream(
        &self,
        arena: &mut ChannelArena,
        track: TrackKind,
        output_presentation_us: i64,
    ) {
        for sc in &self.channels {
            let channel = arena.get_mut(sc.channel);
            let clamped = output_presentation_us - channel.offset_us(track);
            match channel.input_end_us {
                Some(end) if end <= clamped => {}
                _ => {
                    debug!(
                        channel = %channel.name,
                        %track,
                        input_end_us = clamped,
                        "forcing end of stream"
                    );
                    channel.input_end_us = Some(clamped);
                    channel.input_watermark_us = channel.input_watermark_us.min(clamped);
                }
            }
        }
    }
}

/// Chainable builder attaching channels, seeks and a duration to the most
/// recently created segment.
pub struct SegmentBuilder<'a> {
    timeline: &'a mut Timeline,
    index: usize,
}

impl<'a> SegmentBuilder<'a> {
    pub(crate) fn new(timeline: &'a mut Timeline, index: usize) -> Self {
        Self { timeline, index }
    }

    /// Attach a channel to the segment's active set.
    pub fn output(self, name: &str) -> Result<Self> {
        self.attach(name, None)
    }

    /// Attach a channel with a filter.
    pub fn output_filtered(self, name: &str, filter: Filter) -> Result<Self> {
        self.attach(name, Some(filter))
    }

    fn attach(self, name: &str, filter: Option<Filter>) -> Result<Self> {
        let id = self.timeline.channels().id_of(name)?;
        let segment = self.timeline.segment_mut(self.index);
        if segment.channels.iter().all(|c| c.channel != id) {
            segment.channels.push(SegmentChannel {
                channel: id,
                name: name.to_string(),
                filter,
                resolved_seek_us: 0,
                video_seek_applied: false,
                audio_seek_applied: false,
            });
        }
        Ok(self)
    }

    /// Seek a channel to `time_us` (relative to where it left off) for this
    /// segment.
    pub fn seek(self, name: &str, time_us: i64) -> Result<Self> {
        let id = self.timeline.channels().id_of(name)?;
        self.timeline.segment_mut(self.index).seeks.insert(id, time_us);
        Ok(self)
    }

    /// Fix the segment's duration. Without this, the segment runs until its
    /// first channel's source is exhausted, which is allowed on the last segment
    /// only.
    pub fn duration(self, time_us: i64) -> Self {
        self.timeline.segment_mut(self.index).duration_us = Some(time_us);
        self
    }

    /// Index of the segment being built.
    pub fn index(&self) -> usize {
        self.index
    }
}
