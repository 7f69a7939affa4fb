//! The video track pipeline.
//!
//! Each channel decodes onto its own compositor surface; once every active
//! channel has a texture ready (or has reached end of stream, shrinking the
//! needed count), the compositor blends them into the encoder's input surface
//! as one composed frame at the governed output presentation time. N decode
//! streams couple to exactly one encoded output frame.

use tracing::{debug, trace, warn};

use splice_core::{
    BufferFlags, CodecProvider, CoreError, Decoder, DequeueEvent, Encoder, Extractor,
    FrameCompositor, SurfaceId, TrackFormat, TrackKind, VideoFormat,
};
use splice_timeline::{ChannelId, Filter, Timeline};

use crate::error::{EngineError, Result};
use crate::governor::{ThrottleGovernor, ThrottleKey};
use crate::muxer::QueuedMuxer;
use crate::track::{find_track, DrainState, PendingBuffer};

/// One channel's extract/decode/surface chain.
struct VideoSlot {
    channel: ChannelId,
    name: String,
    extractor: Box<dyn Extractor>,
    decoder: Box<dyn Decoder>,
    surface: SurfaceId,
    track_index: usize,
    extractor_eos: bool,
    /// Source exhausted; the decoder is done for good.
    decoder_eos: bool,
    /// Trim boundary reached; the decoder survives into the next segment.
    segment_eos: bool,
    /// A rendered frame is waiting on the surface for the next composite.
    texture_ready: bool,
    filter: Option<Filter>,
    rotation_degrees: u32,
    pending: Option<PendingBuffer>,
    last_output_us: i64,
    /// Output time at which the last rendered frame's display ends.
    last_end_us: i64,
}

impl VideoSlot {
    fn at_end(&self) -> bool {
        self.decoder_eos || self.segment_eos
    }
}

/// Per-track driver for the video side of the transcode.
pub struct VideoTrackTranscoder {
    output_format: VideoFormat,
    compositor: Box<dyn FrameCompositor>,
    encoder: Option<Box<dyn Encoder>>,
    encoder_eos: bool,
    eos_signaled: bool,
    actual_output_format: Option<TrackFormat>,
    slots: Vec<VideoSlot>,
    active: Vec<usize>,
    written_presentation_us: i64,
    segment_index: usize,
    is_last_segment: bool,
}

impl VideoTrackTranscoder {
    /// Create a driver targeting `output_format`, compositing through the
    /// given compositor.
    pub fn new(output_format: VideoFormat, compositor: Box<dyn FrameCompositor>) -> Self {
        Self {
            output_format,
            compositor,
            encoder: None,
            encoder_eos: false,
            eos_signaled: false,
            actual_output_format: None,
            slots: Vec::new(),
            active: Vec::new(),
            written_presentation_us: 0,
            segment_index: 0,
            is_last_segment: false,
        }
    }

    /// Open the video encoder, bind its input surface to the compositor.
    /// One encoder serves the whole transcode.
    pub fn setup_encoder(&mut self, codecs: &mut dyn CodecProvider) -> Result<()> {
        let mut encoder = codecs.open_encoder(&TrackFormat::Video(self.output_format.clone()))?;
        let surface = encoder.create_input_surface()?;
        self.compositor.set_output_surface(surface);
        encoder.start()?;
        self.encoder = Some(encoder);
        Ok(())
    }

    /// Open or reuse one decoder (and compositor surface) per video channel
    /// the segment references.
    pub fn setup_decoders(
        &mut self,
        timeline: &mut Timeline,
        segment_index: usize,
        governor: &mut ThrottleGovernor,
        codecs: &mut dyn CodecProvider,
    ) -> Result<()> {
        self.segment_index = segment_index;
        self.is_last_segment = timeline.segment(segment_index).is_last;

        let wanted: Vec<(ChannelId, String, Option<Filter>)> = {
            let segment = timeline.segment(segment_index);
            let arena = timeline.channels();
            segment
                .channels()
                .iter()
                .filter(|sc| arena.get(sc.channel).kind.has_video())
                .map(|sc| (sc.channel, sc.name.clone(), sc.filter))
                .collect()
        };

        let mut index = 0;
        while index < self.slots.len() {
            let channel = self.slots[index].channel;
            let keep = wanted.iter().any(|(id, _, _)| *id == channel)
                || timeline.channel_referenced_after(segment_index, channel);
            if keep {
                index += 1;
            } else {
                let mut slot = self.slots.remove(index);
                debug!(channel = %slot.name, "releasing video decoder");
                if let Err(err) = slot.decoder.stop() {
                    warn!(channel = %slot.name, %err, "video decoder stop failed");
                }
                self.compositor.release_surface(slot.surface);
            }
        }

        for (id, name, _) in &wanted {
            if self.slots.iter().any(|s| s.channel == *id) {
                continue;
            }
            let source = timeline.channels().get(*id).source.clone();
            let mut extractor = source.open_extractor().map_err(EngineError::Core)?;
            let (track_index, format) = find_track(extractor.as_ref(), TrackKind::Video)?;
            extractor.select_track(track_index);
            let surface = self.compositor.create_surface();
            let mut decoder = codecs.open_decoder(&format, Some(surface))?;
            decoder.start()?;
            debug!(channel = %name, track_index, %format, "opened video decoder");
            self.slots.push(VideoSlot {
                channel: *id,
                name: name.clone(),
                extractor,
                decoder,
                surface,
                track_index,
                extractor_eos: false,
                decoder_eos: false,
                segment_eos: false,
                texture_ready: false,
                filter: None,
                rotation_degrees: 0,
                pending: None,
                last_output_us: 0,
                last_end_us: 0,
            });
        }

        self.active = wanted
            .iter()
            .filter_map(|(id, _, _)| self.slots.iter().position(|s| s.channel == *id))
            .collect();

        let (segment, arena) = timeline.segment_and_channels_mut(segment_index);
        for sc in segment.channels_mut() {
            let Some(slot) = self.slots.iter_mut().find(|s| s.channel == sc.channel) else {
                continue;
            };
            let channel = arena.get(sc.channel);
            if !sc.video_seek_applied {
                if sc.resolved_seek_us > 0 {
                    slot.extractor.seek_to(channel.video_input_start_us, true);
                    slot.decoder.flush()?;
                    // The flush invalidated any parked buffer.
                    slot.pending = None;
                    slot.extractor_eos = false;
                    debug!(
                        channel = %slot.name,
                        seek_us = channel.video_input_start_us,
                        "applied video seek"
                    );
                }
                sc.video_seek_applied = true;
            }
            slot.segment_eos = false;
            slot.texture_ready = false;
            slot.filter = sc.filter;
            slot.rotation_degrees = channel.rotation_degrees;
            slot.last_output_us = channel.output_time_us(TrackKind::Video, channel.video_input_start_us);
            slot.last_end_us = slot.last_output_us;
            governor.participate(ThrottleKey::new(TrackKind::Video, &slot.name));
        }
        Ok(())
    }

    /// Run one cooperative step: drain the encoder, then decoders (which
    /// also composite), then extractors.
    pub fn step_pipeline(
        &mut self,
        timeline: &mut Timeline,
        governor: &mut ThrottleGovernor,
        muxer: &mut QueuedMuxer,
    ) -> Result<bool> {
        let mut busy = false;

        while self.drain_encoder(muxer)? != DrainState::None {
            busy = true;
        }
        loop {
            let status = self.drain_decoders(timeline, governor)?;
            if status != DrainState::None {
                busy = true;
            }
            // Not repeating on Consumed keeps a full encoder from deadlock.
            if status != DrainState::RetryImmediately {
                break;
            }
        }
        if self.maybe_signal_end_of_stream()? {
            busy = true;
        }
        while self.drain_extractors()? != DrainState::None {
            busy = true;
        }

        Ok(busy)
    }

    /// Whether this track has consumed the current segment.
    pub fn is_segment_finished(&self) -> bool {
        if self.is_last_segment {
            return self.encoder_eos;
        }
        if self.active.is_empty() {
            return true;
        }
        self.active.iter().all(|&i| self.slots[i].at_end())
    }

    /// Output presentation time of the last written sample.
    pub fn written_presentation_time_us(&self) -> i64 {
        self.written_presentation_us
    }

    /// The encoder's actual output format, once reported.
    pub fn determined_format(&self) -> Option<TrackFormat> {
        self.actual_output_format.clone()
    }

    /// Stop and drop every codec session and surface.
    pub fn release(&mut self) -> Result<()> {
        let mut teardown_error: Option<CoreError> = None;
        for slot in &mut self.slots {
            if let Err(err) = slot.decoder.stop() {
                warn!(channel = %slot.name, %err, "video decoder stop failed");
                teardown_error = Some(err);
            }
            self.compositor.release_surface(slot.surface);
        }
        self.slots.clear();
        self.active.clear();
        if let Some(mut encoder) = self.encoder.take() {
            if let Err(err) = encoder.stop() {
                warn!(%err, "video encoder stop failed");
                teardown_error = Some(err);
            }
        }
        match teardown_error {
            Some(err) => Err(EngineError::Teardown(err.to_string())),
            None => Ok(()),
        }
    }

    fn drain_encoder(&mut self, muxer: &mut QueuedMuxer) -> Result<DrainState> {
        if self.encoder_eos {
            return Ok(DrainState::None);
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| EngineError::Config("video encoder not set up".into()))?;

        match encoder.dequeue_output_buffer(0) {
            DequeueEvent::TryAgainLater => Ok(DrainState::None),
            DequeueEvent::FormatChanged => {
                if self.actual_output_format.is_some() {
                    return Err(EngineError::Core(CoreError::FormatChangedTwice(
                        TrackKind::Video,
                    )));
                }
                let format = encoder.output_format();
                muxer.set_output_format(TrackKind::Video, format.clone())?;
                self.actual_output_format = Some(format);
                Ok(DrainState::RetryImmediately)
            }
            DequeueEvent::BuffersChanged => Ok(DrainState::RetryImmediately),
            DequeueEvent::Buffer { index, mut meta } => {
                if self.actual_output_format.is_none() {
                    return Err(EngineError::Core(CoreError::FormatUndetermined(
                        TrackKind::Video,
                    )));
                }
                if meta.flags.end_of_stream {
                    self.encoder_eos = true;
                    meta.size = 0;
                }
                if meta.flags.codec_config {
                    // Parameter sets travel with the track format.
                    encoder.release_output_buffer(index);
                    return Ok(DrainState::RetryImmediately);
                }
                if meta.size > 0 {
                    muxer.write_sample_data(
                        TrackKind::Video,
                        &encoder.output_buffer(index)[..meta.size],
                        &meta,
                    )?;
                    self.written_presentation_us = meta.presentation_time_us;
                }
                encoder.release_output_buffer(index);
                Ok(DrainState::Consumed)
            }
        }
    }

    fn drain_decoders(
        &mut self,
        timeline: &mut Timeline,
        governor: &mut ThrottleGovernor,
    ) -> Result<DrainState> {
        let (segment, arena) = timeline.segment_and_channels_mut(self.segment_index);
        let output_start_us = segment.output_start_us;
        // Rotations of ramp-up channels this segment; a ramp-down channel
        // whose orientation conflicts with one of them is suppressed instead
        // of blended.
        let ramp_up_rotations: Vec<u32> = self
            .active
            .iter()
            .filter_map(|&i| {
                let slot = &self.slots[i];
                slot.filter
                    .is_some_and(|f| f.is_ramp_up())
                    .then_some(slot.rotation_degrees)
            })
            .collect();
        let mut consumed = false;

        for i in 0..self.active.len() {
            let slot = &mut self.slots[self.active[i]];
            if slot.at_end() || slot.texture_ready {
                continue;
            }

            let (index, meta) = match slot.pending.take() {
                Some(pending) => (pending.index, pending.meta),
                None => match slot.decoder.dequeue_output_buffer(0) {
                    DequeueEvent::TryAgainLater => continue,
                    DequeueEvent::FormatChanged | DequeueEvent::BuffersChanged => {
                        return Ok(DrainState::RetryImmediately)
                    }
                    DequeueEvent::Buffer { index, meta } => (index, meta),
                },
            };

            let key = ThrottleKey::new(TrackKind::Video, &slot.name);

            if meta.flags.end_of_stream {
                slot.decoder_eos = true;
                slot.decoder.release_output_buffer(index, false);
                governor.can_proceed(&key, 0, true);
                segment.force_end_of_stream(arena, TrackKind::Video, slot.last_end_us);
                consumed = true;
                continue;
            }

            let channel = arena.get(slot.channel);

            // Past the resolved end: the channel is done for this segment,
            // but the frame belongs to the next one, so park it.
            if channel
                .input_end_us
                .is_some_and(|end| meta.presentation_time_us >= end)
            {
                slot.segment_eos = true;
                slot.pending = Some(PendingBuffer { index, meta });
                governor.can_proceed(&key, 0, true);
                consumed = true;
                continue;
            }

            // Running ahead of the governed allowance: decline and re-poll.
            let output_us = channel.output_time_us(TrackKind::Video, meta.presentation_time_us);
            if !governor.can_proceed(&key, output_us, false) {
                slot.pending = Some(PendingBuffer { index, meta });
                continue;
            }

            if meta.presentation_time_us >= channel.video_input_start_us && meta.size > 0 {
                // Render to the channel's surface and set its blend opacity.
                slot.decoder.release_output_buffer(index, true);
                slot.texture_ready = true;
                slot.last_output_us = output_us;
                slot.last_end_us = output_us + channel.frame_duration_us.max(0);
                let conflicting = ramp_up_rotations
                    .iter()
                    .any(|&rotation| rotation != slot.rotation_degrees);
                let alpha =
                    effective_alpha(slot.filter, conflicting, output_us - output_start_us);
                self.compositor.set_alpha(slot.surface, alpha);
                trace!(channel = %slot.name, output_us, alpha, "rendered frame to surface");
            } else {
                // Pre-roll before the frame-accurate start point.
                slot.decoder.release_output_buffer(index, false);
            }
            consumed = true;
        }

        // One composed frame once every needed texture is in place.
        let active_count = self.active.len();
        let ready: Vec<usize> = self
            .active
            .iter()
            .copied()
            .filter(|&i| self.slots[i].texture_ready)
            .collect();
        let ended = self
            .active
            .iter()
            .filter(|&&i| self.slots[i].at_end())
            .count();
        if !ready.is_empty() && ready.len() + ended >= active_count {
            let presentation_us = ready
                .iter()
                .map(|&i| self.slots[i].last_output_us)
                .max()
                .unwrap_or(0);
            self.compositor.draw_frame(presentation_us)?;
            for i in ready {
                self.slots[i].texture_ready = false;
            }
            trace!(presentation_us, "composited frame");
            consumed = true;
        }

        Ok(if consumed {
            DrainState::Consumed
        } else {
            DrainState::None
        })
    }

    /// On the final segment, close the encoder's surface input once every
    /// channel has ended.
    fn maybe_signal_end_of_stream(&mut self) -> Result<bool> {
        if !self.is_last_segment || self.eos_signaled {
            return Ok(false);
        }
        let all_ended = self.active.iter().all(|&i| self.slots[i].at_end());
        if self.active.is_empty() || all_ended {
            self.encoder
                .as_mut()
                .ok_or_else(|| EngineError::Config("video encoder not set up".into()))?
                .signal_end_of_input_stream()?;
            self.eos_signaled = true;
            debug!("video encoder end of stream signaled");
            return Ok(true);
        }
        Ok(false)
    }

    fn drain_extractors(&mut self) -> Result<DrainState> {
        let mut consumed = false;
        for i in 0..self.active.len() {
            let slot = &mut self.slots[self.active[i]];
            if slot.extractor_eos || slot.decoder_eos {
                continue;
            }

            let Some(track) = slot.extractor.sample_track_index() else {
                let Some(index) = slot.decoder.dequeue_input_buffer(0) else {
                    continue;
                };
                slot.extractor_eos = true;
                slot.decoder
                    .queue_input_buffer(index, 0, 0, BufferFlags::end_of_stream())?;
                debug!(channel = %slot.name, "video extractor exhausted");
                continue;
            };
            if track != slot.track_index {
                slot.extractor.advance();
                continue;
            }
            let Some(index) = slot.decoder.dequeue_input_buffer(0) else {
                continue;
            };
            let presentation_us = slot.extractor.sample_time_us();
            let flags = slot.extractor.sample_flags();
            let size = slot.extractor.read_sample_data(slot.decoder.input_buffer(index));
            slot.decoder
                .queue_input_buffer(index, size, presentation_us, flags)?;
            slot.extractor.advance();
            consumed = true;
        }
        Ok(if consumed {
            DrainState::Consumed
        } else {
            DrainState::None
        })
    }
}

/// A channel's blend opacity for one frame. A ramp-down channel crossfading
/// against a ramp-up channel of conflicting orientation is suppressed
/// outright rather than blended, since blending differently rotated sources
/// produces double-dimming artifacts.
fn effective_alpha(filter: Option<Filter>, conflicting_ramp_up: bool, elapsed_us: i64) -> f32 {
    match filter {
        None => 1.0,
        Some(filter) if filter.is_ramp_down() && conflicting_ramp_up => 0.0,
        Some(filter) => filter.alpha_at(elapsed_us),
    }
}
