//! The audio track pipeline.
//!
//! Drives extraction → decode → mix → encode for every audio-bearing channel
//! of the current segment. The step order is deliberate: the encoder drains
//! first so its buffer queue is never left full while new decode work is
//! attempted, which would deadlock the decoder and encoder buffer pools
//! against each other.

use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, warn};

use splice_core::{
    AudioFormat, BufferFlags, CodecProvider, CoreError, Decoder, DequeueEvent, Encoder, Extractor,
    TrackFormat, TrackKind,
};
use splice_timeline::{ChannelId, Timeline};

use crate::error::{EngineError, Result};
use crate::governor::{ThrottleGovernor, ThrottleKey};
use crate::mixer::{AudioChunk, AudioMixer, MixerFeed};
use crate::muxer::QueuedMuxer;
use crate::track::{find_track, DrainState, PendingBuffer};

/// One channel's extract/decode chain.
struct AudioSlot {
    channel: ChannelId,
    name: String,
    extractor: Box<dyn Extractor>,
    decoder: Box<dyn Decoder>,
    track_index: usize,
    extractor_eos: bool,
    /// Source exhausted; the decoder is done for good.
    decoder_eos: bool,
    /// Trim boundary reached; the decoder survives into the next segment.
    segment_eos: bool,
    pending: Option<PendingBuffer>,
    last_output_us: i64,
    /// Output time at which the last consumed chunk ends.
    last_end_us: i64,
}

/// Per-track driver for the audio side of the transcode.
pub struct AudioTrackTranscoder {
    output_format: AudioFormat,
    encoder: Option<Box<dyn Encoder>>,
    encoder_eos: bool,
    eos_signaled: bool,
    actual_output_format: Option<TrackFormat>,
    mixer: Option<AudioMixer>,
    mixer_eos: bool,
    slots: Vec<AudioSlot>,
    active: Vec<usize>,
    written_presentation_us: i64,
    segment_index: usize,
    is_last_segment: bool,
}

impl AudioTrackTranscoder {
    /// Create a driver targeting `output_format`.
    pub fn new(output_format: AudioFormat) -> Self {
        Self {
            output_format,
            encoder: None,
            encoder_eos: false,
            eos_signaled: false,
            actual_output_format: None,
            mixer: None,
            mixer_eos: false,
            slots: Vec::new(),
            active: Vec::new(),
            written_presentation_us: 0,
            segment_index: 0,
            is_last_segment: false,
        }
    }

    /// Open the audio encoder. One encoder serves the whole transcode.
    pub fn setup_encoder(&mut self, codecs: &mut dyn CodecProvider) -> Result<()> {
        let mut encoder = codecs.open_encoder(&TrackFormat::Audio(self.output_format.clone()))?;
        encoder.start()?;
        self.encoder = Some(encoder);
        Ok(())
    }

    /// Open or reuse one decoder per audio channel the segment references.
    pub fn setup_decoders(
        &mut self,
        timeline: &mut Timeline,
        segment_index: usize,
        governor: &mut ThrottleGovernor,
        codecs: &mut dyn CodecProvider,
    ) -> Result<()> {
        self.segment_index = segment_index;
        self.is_last_segment = timeline.segment(segment_index).is_last;
        self.mixer_eos = false;

        let wanted: Vec<(ChannelId, String)> = {
            let segment = timeline.segment(segment_index);
            let arena = timeline.channels();
            segment
                .channels()
                .iter()
                .filter(|sc| {
                    arena.get(sc.channel).kind.has_audio()
                        && !sc.filter.is_some_and(|f| f.silences_audio())
                })
                .map(|sc| (sc.channel, sc.name.clone()))
                .collect()
        };

        // Channels no upcoming segment references give their decoders back.
        let mut index = 0;
        while index < self.slots.len() {
            let channel = self.slots[index].channel;
            let keep = wanted.iter().any(|(id, _)| *id == channel)
                || timeline.channel_referenced_after(segment_index, channel);
            if keep {
                index += 1;
            } else {
                let mut slot = self.slots.remove(index);
                debug!(channel = %slot.name, "releasing audio decoder");
                if let Err(err) = slot.decoder.stop() {
                    warn!(channel = %slot.name, %err, "audio decoder stop failed");
                }
            }
        }

        for (id, name) in &wanted {
            if self.slots.iter().any(|s| s.channel == *id) {
                continue;
            }
            let source = timeline.channels().get(*id).source.clone();
            let mut extractor = source.open_extractor().map_err(EngineError::Core)?;
            let (track_index, format) = find_track(extractor.as_ref(), TrackKind::Audio)?;
            extractor.select_track(track_index);
            let mut decoder = codecs.open_decoder(&format, None)?;
            decoder.start()?;
            debug!(channel = %name, track_index, %format, "opened audio decoder");
            self.slots.push(AudioSlot {
                channel: *id,
                name: name.clone(),
                extractor,
                decoder,
                track_index,
                extractor_eos: false,
                decoder_eos: false,
                segment_eos: false,
                pending: None,
                last_output_us: 0,
                last_end_us: 0,
            });
        }

        self.active = wanted
            .iter()
            .filter_map(|(id, _)| self.slots.iter().position(|s| s.channel == *id))
            .collect();

        // Apply any unconsumed seek and reset per-segment state. Slots kept
        // alive for later segments but inactive here (e.g. muted) must not
        // register with the governor.
        let (segment, arena) = timeline.segment_and_channels_mut(segment_index);
        for sc in segment.channels_mut() {
            if !wanted.iter().any(|(id, _)| *id == sc.channel) {
                continue;
            }
            let Some(slot) = self.slots.iter_mut().find(|s| s.channel == sc.channel) else {
                continue;
            };
            let channel = arena.get(sc.channel);
            if !sc.audio_seek_applied {
                if sc.resolved_seek_us > 0 {
                    slot.extractor.seek_to(channel.audio_input_start_us, true);
                    slot.decoder.flush()?;
                    // The flush invalidated any parked buffer.
                    slot.pending = None;
                    slot.extractor_eos = false;
                    debug!(
                        channel = %slot.name,
                        seek_us = channel.audio_input_start_us,
                        "applied audio seek"
                    );
                }
                sc.audio_seek_applied = true;
            }
            slot.segment_eos = false;
            slot.last_output_us = channel.output_time_us(TrackKind::Audio, channel.audio_input_start_us);
            slot.last_end_us = slot.last_output_us;
            governor.participate(ThrottleKey::new(TrackKind::Audio, &slot.name));
        }

        let names: Vec<String> = wanted.iter().map(|(_, name)| name.clone()).collect();
        let mut mixer = AudioMixer::new(self.output_format.clone(), &names, self.is_last_segment);
        if let Some(previous) = self.mixer.take() {
            if let Some(format) = previous.determined_format() {
                mixer.set_actual_decoded_format(format)?;
            }
        }
        self.mixer = Some(mixer);
        Ok(())
    }

    /// Run one cooperative step: drain the encoder, then decoders, feed the
    /// mixer, then extractors.
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
        if self.feed_mixer()? {
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
        self.active.iter().all(|&i| {
            let slot = &self.slots[i];
            slot.decoder_eos || slot.segment_eos
        }) && self.mixer.as_ref().map_or(true, |m| m.is_idle())
    }

    /// Output presentation time of the last written sample.
    pub fn written_presentation_time_us(&self) -> i64 {
        self.written_presentation_us
    }

    /// The encoder's actual output format, once reported.
    pub fn determined_format(&self) -> Option<TrackFormat> {
        self.actual_output_format.clone()
    }

    /// Stop and drop every codec session.
    pub fn release(&mut self) -> Result<()> {
        let mut teardown_error: Option<CoreError> = None;
        for slot in &mut self.slots {
            if let Err(err) = slot.decoder.stop() {
                warn!(channel = %slot.name, %err, "audio decoder stop failed");
                teardown_error = Some(err);
            }
        }
        self.slots.clear();
        self.active.clear();
        if let Some(mut encoder) = self.encoder.take() {
            if let Err(err) = encoder.stop() {
                warn!(%err, "audio encoder stop failed");
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
            .ok_or_else(|| EngineError::Config("audio encoder not set up".into()))?;

        match encoder.dequeue_output_buffer(0) {
            DequeueEvent::TryAgainLater => Ok(DrainState::None),
            DequeueEvent::FormatChanged => {
                if self.actual_output_format.is_some() {
                    return Err(EngineError::Core(CoreError::FormatChangedTwice(
                        TrackKind::Audio,
                    )));
                }
                let format = encoder.output_format();
                muxer.set_output_format(TrackKind::Audio, format.clone())?;
                self.actual_output_format = Some(format);
                Ok(DrainState::RetryImmediately)
            }
            DequeueEvent::BuffersChanged => Ok(DrainState::RetryImmediately),
            DequeueEvent::Buffer { index, mut meta } => {
                if self.actual_output_format.is_none() {
                    return Err(EngineError::Core(CoreError::FormatUndetermined(
                        TrackKind::Audio,
                    )));
                }
                if meta.flags.end_of_stream {
                    self.encoder_eos = true;
                    meta.size = 0;
                }
                if meta.flags.codec_config {
                    // Carried by the track format already.
                    encoder.release_output_buffer(index);
                    return Ok(DrainState::RetryImmediately);
                }
                if meta.size > 0 {
                    muxer.write_sample_data(
                        TrackKind::Audio,
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
        let mut consumed = false;

        for i in 0..self.active.len() {
            let slot = &mut self.slots[self.active[i]];
            if slot.decoder_eos || slot.segment_eos {
                continue;
            }

            let (index, meta) = match slot.pending.take() {
                Some(pending) => (pending.index, pending.meta),
                None => match slot.decoder.dequeue_output_buffer(0) {
                    DequeueEvent::TryAgainLater => continue,
                    DequeueEvent::FormatChanged => {
                        let format = slot.decoder.output_format();
                        let audio = format
                            .as_audio()
                            .ok_or_else(|| {
                                EngineError::Config(
                                    "audio decoder reported a non-audio format".into(),
                                )
                            })?
                            .clone();
                        self.mixer
                            .as_mut()
                            .ok_or_else(|| EngineError::Config("audio mixer not set up".into()))?
                            .set_actual_decoded_format(&audio)?;
                        return Ok(DrainState::RetryImmediately);
                    }
                    DequeueEvent::BuffersChanged => return Ok(DrainState::RetryImmediately),
                    DequeueEvent::Buffer { index, meta } => (index, meta),
                },
            };

            let key = ThrottleKey::new(TrackKind::Audio, &slot.name);

            if meta.flags.end_of_stream {
                slot.decoder_eos = true;
                slot.decoder.release_output_buffer(index, false);
                governor.can_proceed(&key, 0, true);
                self.mixer
                    .as_mut()
                    .ok_or_else(|| EngineError::Config("audio mixer not set up".into()))?
                    .queue_chunk(&slot.name, AudioChunk::end_of_stream())?;
                segment.force_end_of_stream(arena, TrackKind::Audio, slot.last_end_us);
                consumed = true;
                continue;
            }

            let channel = arena.get(slot.channel);

            // Past the resolved end: the channel is done for this segment,
            // but the buffer belongs to the next one, so park it.
            if channel
                .input_end_us
                .is_some_and(|end| meta.presentation_time_us >= end)
            {
                slot.segment_eos = true;
                slot.pending = Some(PendingBuffer { index, meta });
                governor.can_proceed(&key, 0, true);
                self.mixer
                    .as_mut()
                    .ok_or_else(|| EngineError::Config("audio mixer not set up".into()))?
                    .queue_chunk(&slot.name, AudioChunk::end_of_stream())?;
                consumed = true;
                continue;
            }

            // Running ahead of the governed allowance: decline and re-poll.
            let output_us = channel.output_time_us(TrackKind::Audio, meta.presentation_time_us);
            if !governor.can_proceed(&key, output_us, false) {
                slot.pending = Some(PendingBuffer { index, meta });
                continue;
            }

            let bytes = &slot.decoder.output_buffer(index)[..meta.size];
            let mut pcm = vec![0i16; bytes.len() / 2];
            NativeEndian::read_i16_into(bytes, &mut pcm);
            let sample_count = pcm.len() as i64;
            let chunk = AudioChunk {
                pcm: Some(pcm),
                presentation_us: meta.presentation_time_us,
                output_offset_us: channel.audio_offset_us,
                trim_start_us: channel.audio_input_start_us,
                trim_end_us: channel.input_end_us,
            };
            slot.last_output_us = output_us;
            slot.decoder.release_output_buffer(index, false);
            let mixer = self
                .mixer
                .as_mut()
                .ok_or_else(|| EngineError::Config("audio mixer not set up".into()))?;
            slot.last_end_us = output_us + mixer.sample_count_to_duration_us(sample_count);
            mixer.queue_chunk(&slot.name, chunk)?;
            consumed = true;
        }

        Ok(if consumed {
            DrainState::Consumed
        } else {
            DrainState::None
        })
    }

    fn feed_mixer(&mut self) -> Result<bool> {
        if self.mixer_eos || self.encoder_eos {
            return Ok(false);
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| EngineError::Config("audio encoder not set up".into()))?;

        if self.active.is_empty() {
            // Nothing feeds this track in the current segment; on the final
            // segment the encoder still needs its end-of-stream.
            if self.is_last_segment && !self.eos_signaled {
                if let Some(index) = encoder.dequeue_input_buffer(0) {
                    encoder.queue_input_buffer(index, 0, 0, BufferFlags::end_of_stream())?;
                    self.eos_signaled = true;
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        let mixer = self
            .mixer
            .as_mut()
            .ok_or_else(|| EngineError::Config("audio mixer not set up".into()))?;
        let mut busy = false;
        loop {
            match mixer.feed_encoder(encoder.as_mut(), 0)? {
                MixerFeed::Queued { .. } | MixerFeed::Skipped => busy = true,
                MixerFeed::EndOfStream => {
                    self.mixer_eos = true;
                    busy = true;
                    break;
                }
                MixerFeed::Starved => break,
            }
        }
        Ok(busy)
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
                debug!(channel = %slot.name, "audio extractor exhausted");
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
