//! Sample-accurate merging of decoded PCM streams into the audio encoder.
//!
//! One decoded chunk per channel is taken from the per-channel queues, cut to
//! its trim window, remixed into a staging buffer sized to the encoder's
//! input slot, and submitted. Decoders rarely produce chunks the size the
//! encoder wants, so a remix that produces more samples than one encoder
//! buffer holds spills the remainder into an overflow buffer that is drained
//! first on the next feed.

use std::collections::VecDeque;

use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, trace};

use splice_core::{AudioFormat, BufferFlags, Encoder, MICROS_PER_SECOND};

use crate::error::{EngineError, Result};
use crate::remix::{MixBuffer, Remixer};

/// One decoded PCM chunk queued for mixing, or an end-of-stream marker.
#[derive(Debug)]
pub struct AudioChunk {
    /// Interleaved signed 16-bit samples; `None` marks end of stream.
    pub pcm: Option<Vec<i16>>,
    /// Presentation time of the first sample, in input time.
    pub presentation_us: i64,
    /// Input-to-output presentation offset.
    pub output_offset_us: i64,
    /// Input time at which consumption starts (seek trim).
    pub trim_start_us: i64,
    /// Input time at which consumption ends; `None` is open-ended.
    pub trim_end_us: Option<i64>,
}

impl AudioChunk {
    /// An end-of-stream marker for a channel.
    pub fn end_of_stream() -> Self {
        Self {
            pcm: None,
            presentation_us: 0,
            output_offset_us: 0,
            trim_start_us: 0,
            trim_end_us: None,
        }
    }

    fn is_end_of_stream(&self) -> bool {
        self.pcm.is_none()
    }
}

/// Outcome of one [`AudioMixer::feed_encoder`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerFeed {
    /// Some channel queue was empty (or the encoder pool was full); retry on
    /// a later poll.
    Starved,
    /// Buffers were consumed but fell entirely outside their trim windows;
    /// nothing reached the encoder.
    Skipped,
    /// One encoder buffer was submitted at the given output presentation
    /// time.
    Queued { presentation_us: i64 },
    /// Every channel's next entry was an end-of-stream marker. On the final
    /// segment the encoder was signaled directly; earlier segments just
    /// report the condition so the encoder can live on.
    EndOfStream,
}

struct ChannelQueue {
    name: String,
    chunks: VecDeque<AudioChunk>,
}

/// Merges decoded PCM from all audio channels active in a segment into one
/// encoder-bound stream.
pub struct AudioMixer {
    queues: Vec<ChannelQueue>,
    final_segment: bool,
    encode_format: AudioFormat,
    decoded_format: Option<AudioFormat>,
    remixer: Option<Remixer>,
    input_sample_rate: u32,
    input_channel_count: u32,
    overflow: Vec<i16>,
    overflow_position: usize,
    overflow_presentation_us: i64,
    last_presentation_us: i64,
    /// Encoder input slot dequeued but not yet submitted, held across feeds
    /// when a round produces no samples.
    held_buffer: Option<usize>,
}

impl AudioMixer {
    /// Create a mixer feeding an encoder with `encode_format`, merging the
    /// named channels. Only a final-segment mixer may signal the encoder's
    /// end of stream.
    pub fn new(encode_format: AudioFormat, channel_names: &[String], final_segment: bool) -> Self {
        Self {
            queues: channel_names
                .iter()
                .map(|name| ChannelQueue {
                    name: name.clone(),
                    chunks: VecDeque::new(),
                })
                .collect(),
            final_segment,
            encode_format,
            decoded_format: None,
            remixer: None,
            input_sample_rate: 0,
            input_channel_count: 0,
            overflow: Vec::new(),
            overflow_position: 0,
            overflow_presentation_us: 0,
            last_presentation_us: 0,
            held_buffer: None,
        }
    }

    /// Record the decoders' actual output format and pick the remixer.
    ///
    /// Sample-rate conversion is unsupported; channel counts outside mono and
    /// stereo are unsupported on either side.
    pub fn set_actual_decoded_format(&mut self, format: &AudioFormat) -> Result<()> {
        if format.sample_rate != self.encode_format.sample_rate {
            return Err(EngineError::Unsupported(format!(
                "audio sample rate conversion ({} -> {}) not supported",
                format.sample_rate, self.encode_format.sample_rate
            )));
        }
        if format.channel_count != 1 && format.channel_count != 2 {
            return Err(EngineError::Unsupported(format!(
                "input channel count ({}) not supported",
                format.channel_count
            )));
        }
        let output_channel_count = self.encode_format.channel_count;
        if output_channel_count != 1 && output_channel_count != 2 {
            return Err(EngineError::Unsupported(format!(
                "output channel count ({}) not supported",
                output_channel_count
            )));
        }

        self.input_sample_rate = format.sample_rate;
        self.input_channel_count = format.channel_count;
        self.remixer = Some(Remixer::for_channel_counts(
            format.channel_count,
            output_channel_count,
        ));
        self.decoded_format = Some(format.clone());
        debug!(
            %format,
            remixer = ?self.remixer,
            "audio decoded format determined"
        );
        Ok(())
    }

    /// The recorded decoded format, once known.
    pub fn determined_format(&self) -> Option<&AudioFormat> {
        self.decoded_format.as_ref()
    }

    /// Enqueue one decoded chunk (or end-of-stream marker) for `channel`.
    pub fn queue_chunk(&mut self, channel: &str, chunk: AudioChunk) -> Result<()> {
        if self.decoded_format.is_none() && !chunk.is_end_of_stream() {
            return Err(EngineError::BufferBeforeFormat(splice_core::TrackKind::Audio));
        }
        let queue = self
            .queues
            .iter_mut()
            .find(|q| q.name == channel)
            .ok_or_else(|| EngineError::Config(format!("unknown mixer channel '{channel}'")))?;
        queue.chunks.push_back(chunk);
        Ok(())
    }

    /// Whether no PCM remains undelivered. Sticky end-of-stream markers do
    /// not count; they persist until the next segment replaces the mixer.
    pub fn is_idle(&self) -> bool {
        !self.has_overflow()
            && self
                .queues
                .iter()
                .all(|q| q.chunks.iter().all(|c| c.is_end_of_stream()))
    }

    fn has_overflow(&self) -> bool {
        self.overflow_position < self.overflow.len()
    }

    /// Mix the next round of chunks into the encoder.
    pub fn feed_encoder(&mut self, encoder: &mut dyn Encoder, timeout_us: i64) -> Result<MixerFeed> {
        if self.queues.is_empty() {
            return Ok(MixerFeed::Starved);
        }
        let every_queue_ready = self.queues.iter().all(|q| !q.chunks.is_empty());
        if !self.has_overflow() && !every_queue_ready {
            return Ok(MixerFeed::Starved);
        }

        let all_end_of_stream = !self.has_overflow()
            && self.queues.iter().all(|q| {
                q.chunks
                    .front()
                    .is_some_and(|chunk| chunk.is_end_of_stream())
            });
        if all_end_of_stream && !self.final_segment {
            return Ok(MixerFeed::EndOfStream);
        }

        let index = match self.held_buffer.take() {
            Some(index) => index,
            None => match encoder.dequeue_input_buffer(timeout_us) {
                Some(index) => index,
                // Encoder pool is full; retry on a later poll.
                None => return Ok(MixerFeed::Starved),
            },
        };
        let capacity = encoder.input_buffer(index).len() / 2;

        // Leftovers from the previous round go out first, on their own
        // continuation timestamp.
        if self.has_overflow() {
            return self.drain_overflow(encoder, index, capacity);
        }

        if all_end_of_stream {
            encoder.queue_input_buffer(index, 0, 0, BufferFlags::end_of_stream())?;
            debug!("audio mixer signaled end of stream");
            return Ok(MixerFeed::EndOfStream);
        }

        let mut staging = MixBuffer::with_capacity(capacity);
        let mut presentation_us: Option<i64> = None;

        for queue_index in 0..self.queues.len() {
            let chunk = match self.queues[queue_index].chunks.pop_front() {
                Some(chunk) => chunk,
                None => continue,
            };
            if chunk.is_end_of_stream() {
                // Markers are sticky: the channel stays at end of stream
                // until every queue agrees and the encoder is signaled.
                self.queues[queue_index].chunks.push_front(chunk);
                continue;
            }
            trace!(
                channel = %self.queues[queue_index].name,
                presentation_us = chunk.presentation_us,
                "mixing audio chunk"
            );
            if let Some(chunk_presentation) = self.remix_chunk(&chunk, &mut staging)? {
                presentation_us.get_or_insert(chunk_presentation);
            }
        }

        match presentation_us {
            Some(presentation_us) if !staging.is_empty() => {
                let presentation_us = presentation_us.max(self.last_presentation_us);
                let bytes = staging.len() * 2;
                NativeEndian::write_i16_into(
                    staging.as_slice(),
                    &mut encoder.input_buffer(index)[..bytes],
                );
                encoder.queue_input_buffer(index, bytes, presentation_us, BufferFlags::default())?;
                self.last_presentation_us =
                    presentation_us + self.sample_count_to_duration_us(staging.len() as i64);
                trace!(presentation_us, bytes, "submitted audio buffer");
                Ok(MixerFeed::Queued { presentation_us })
            }
            _ => {
                // Everything fell outside its trim window; keep the slot for
                // the next round.
                self.held_buffer = Some(index);
                Ok(MixerFeed::Skipped)
            }
        }
    }

    /// Cut `chunk` to its trim window and remix it into `staging`, spilling
    /// any excess into the overflow buffer. Returns the chunk's output
    /// presentation time, or `None` when it falls entirely outside the
    /// window.
    fn remix_chunk(&mut self, chunk: &AudioChunk, staging: &mut MixBuffer) -> Result<Option<i64>> {
        let remixer = self
            .remixer
            .ok_or(EngineError::BufferBeforeFormat(splice_core::TrackKind::Audio))?;
        let pcm = chunk.pcm.as_deref().unwrap_or(&[]);

        let first_sample = if chunk.trim_start_us <= chunk.presentation_us {
            0
        } else {
            self.duration_us_to_sample_count(chunk.trim_start_us - chunk.presentation_us)
        };
        let last_sample = match chunk.trim_end_us {
            Some(end) if end <= chunk.presentation_us => 0,
            Some(end) => self
                .duration_us_to_sample_count(end - chunk.presentation_us)
                .min(pcm.len()),
            None => pcm.len(),
        };
        if first_sample >= pcm.len() || last_sample == 0 || first_sample >= last_sample {
            return Ok(None);
        }

        let window = &pcm[first_sample..last_sample];
        let consumed = remixer.remix(window, staging);

        if consumed < window.len() {
            // The encoder buffer filled up; the rest carries its own
            // continuation timestamp into the next round.
            let rest = &window[consumed..];
            let frames = rest.len() / remixer.input_samples_per_frame();
            let needed = frames * remixer.output_samples_per_frame();
            let carried = self.overflow.len() - self.overflow_position;
            let mut overflow = MixBuffer::with_capacity(needed.max(carried));
            if carried > 0 {
                // Another channel already spilled this round; merge into its
                // leftovers rather than replacing them.
                Remixer::Passthrough.remix(&self.overflow[self.overflow_position..], &mut overflow);
            } else {
                self.overflow_presentation_us = chunk.presentation_us
                    + chunk.output_offset_us
                    + self.sample_count_to_duration_us((first_sample + consumed) as i64);
            }
            remixer.remix(rest, &mut overflow);
            self.overflow = overflow.as_slice().to_vec();
            self.overflow_position = 0;
            trace!(
                samples = self.overflow.len(),
                presentation_us = self.overflow_presentation_us,
                "spilled samples to overflow"
            );
        }

        Ok(Some(
            (chunk.presentation_us
                + chunk.output_offset_us
                + self.sample_count_to_duration_us(first_sample as i64))
            .max(0),
        ))
    }

    fn drain_overflow(
        &mut self,
        encoder: &mut dyn Encoder,
        index: usize,
        capacity: usize,
    ) -> Result<MixerFeed> {
        let presentation_us = self.overflow_presentation_us
            + self.sample_count_to_duration_us(self.overflow_position as i64);
        let presentation_us = presentation_us.max(self.last_presentation_us);

        let available = self.overflow.len() - self.overflow_position;
        let count = available.min(capacity);
        let slice = &self.overflow[self.overflow_position..self.overflow_position + count];
        let bytes = count * 2;
        NativeEndian::write_i16_into(slice, &mut encoder.input_buffer(index)[..bytes]);
        encoder.queue_input_buffer(index, bytes, presentation_us, BufferFlags::default())?;

        self.overflow_position += count;
        if !self.has_overflow() {
            self.overflow.clear();
            self.overflow_position = 0;
        }
        self.last_presentation_us =
            presentation_us + self.sample_count_to_duration_us(count as i64);
        trace!(presentation_us, bytes, "submitted audio overflow buffer");
        Ok(MixerFeed::Queued { presentation_us })
    }

    /// Duration of `sample_count` interleaved input samples, rounding up.
    pub fn sample_count_to_duration_us(&self, sample_count: i64) -> i64 {
        let rate = i64::from(self.input_sample_rate.max(1));
        let channels = i64::from(self.input_channel_count.max(1));
        (MICROS_PER_SECOND * sample_count / channels + rate - 1) / rate
    }

    /// Number of interleaved input samples covering `duration_us`, rounding
    /// up.
    pub fn duration_us_to_sample_count(&self, duration_us: i64) -> usize {
        let rate = i64::from(self.input_sample_rate.max(1));
        let channels = i64::from(self.input_channel_count.max(1));
        ((duration_us * rate * channels + MICROS_PER_SECOND - 1) / MICROS_PER_SECOND) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_core::{DequeueEvent, SurfaceId, TrackFormat};

    /// Minimal in-memory encoder with a fixed-size input buffer pool.
    struct TestEncoder {
        buffer_samples: usize,
        buffers: Vec<Vec<u8>>,
        free: VecDeque<usize>,
        submitted: Vec<(Vec<i16>, i64, BufferFlags)>,
    }

    impl TestEncoder {
        fn new(pool: usize, buffer_samples: usize) -> Self {
            Self {
                buffer_samples,
                buffers: (0..pool).map(|_| vec![0u8; buffer_samples * 2]).collect(),
                free: (0..pool).collect(),
                submitted: Vec::new(),
            }
        }
    }

    impl Encoder for TestEncoder {
        fn start(&mut self) -> splice_core::Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> splice_core::Result<()> {
            Ok(())
        }

        fn create_input_surface(&mut self) -> splice_core::Result<SurfaceId> {
            Ok(SurfaceId(0))
        }

        fn signal_end_of_input_stream(&mut self) -> splice_core::Result<()> {
            Ok(())
        }

        fn dequeue_input_buffer(&mut self, _timeout_us: i64) -> Option<usize> {
            self.free.pop_front()
        }

        fn input_buffer(&mut self, index: usize) -> &mut [u8] {
            &mut self.buffers[index]
        }

        fn queue_input_buffer(
            &mut self,
            index: usize,
            size: usize,
            presentation_time_us: i64,
            flags: BufferFlags,
        ) -> splice_core::Result<()> {
            let mut samples = vec![0i16; size / 2];
            NativeEndian::read_i16_into(&self.buffers[index][..size], &mut samples);
            self.submitted.push((samples, presentation_time_us, flags));
            self.free.push_back(index);
            Ok(())
        }

        fn dequeue_output_buffer(&mut self, _timeout_us: i64) -> DequeueEvent {
            DequeueEvent::TryAgainLater
        }

        fn output_buffer(&self, _index: usize) -> &[u8] {
            &[]
        }

        fn output_format(&self) -> TrackFormat {
            TrackFormat::Audio(AudioFormat {
                codec: "pcm".into(),
                sample_rate: 48_000,
                channel_count: 1,
                bit_rate: None,
            })
        }

        fn release_output_buffer(&mut self, _index: usize) {}
    }

    fn format(channels: u32) -> AudioFormat {
        AudioFormat {
            codec: "pcm".into(),
            sample_rate: 48_000,
            channel_count: channels,
            bit_rate: None,
        }
    }

    fn chunk(pcm: Vec<i16>, presentation_us: i64) -> AudioChunk {
        AudioChunk {
            pcm: Some(pcm),
            presentation_us,
            output_offset_us: 0,
            trim_start_us: 0,
            trim_end_us: None,
        }
    }

    #[test]
    fn test_sample_rate_conversion_rejected() {
        let mut mixer = AudioMixer::new(format(2), &["a".into()], true);
        let err = mixer.set_actual_decoded_format(&AudioFormat {
            sample_rate: 44_100,
            ..format(2)
        });
        assert!(matches!(err, Err(EngineError::Unsupported(_))));
    }

    #[test]
    fn test_channel_count_outside_range_rejected() {
        let mut mixer = AudioMixer::new(format(2), &["a".into()], true);
        let err = mixer.set_actual_decoded_format(&format(6));
        assert!(matches!(err, Err(EngineError::Unsupported(_))));
    }

    #[test]
    fn test_starved_until_every_queue_has_data() {
        let mut mixer = AudioMixer::new(format(1), &["a".into(), "b".into()], true);
        mixer.set_actual_decoded_format(&format(1)).unwrap();
        let mut encoder = TestEncoder::new(4, 1024);

        mixer.queue_chunk("a", chunk(vec![1; 100], 0)).unwrap();
        assert_eq!(
            mixer.feed_encoder(&mut encoder, 0).unwrap(),
            MixerFeed::Starved
        );

        mixer.queue_chunk("b", chunk(vec![2; 100], 0)).unwrap();
        assert!(matches!(
            mixer.feed_encoder(&mut encoder, 0).unwrap(),
            MixerFeed::Queued { .. }
        ));
        assert_eq!(encoder.submitted.len(), 1);
        assert_eq!(encoder.submitted[0].0.len(), 100);
    }

    #[test]
    fn test_overflow_carries_continuation_timestamp() {
        let mut mixer = AudioMixer::new(format(1), &["a".into()], true);
        mixer.set_actual_decoded_format(&format(1)).unwrap();
        // Encoder buffers hold 100 samples; the chunk carries 250.
        let mut encoder = TestEncoder::new(4, 100);

        mixer.queue_chunk("a", chunk(vec![7; 250], 0)).unwrap();

        let first = mixer.feed_encoder(&mut encoder, 0).unwrap();
        assert_eq!(first, MixerFeed::Queued { presentation_us: 0 });

        // 100 samples at 48kHz mono ≈ 2084us, rounded up.
        let second = mixer.feed_encoder(&mut encoder, 0).unwrap();
        let MixerFeed::Queued { presentation_us } = second else {
            panic!("expected queued, got {:?}", second);
        };
        assert_eq!(presentation_us, 2_084);

        let third = mixer.feed_encoder(&mut encoder, 0).unwrap();
        assert!(matches!(third, MixerFeed::Queued { .. }));
        assert_eq!(
            encoder.submitted.iter().map(|(s, _, _)| s.len()).sum::<usize>(),
            250
        );
        assert!(mixer.is_idle());
    }

    #[test]
    fn test_presentation_times_monotonic() {
        let mut mixer = AudioMixer::new(format(1), &["a".into()], true);
        mixer.set_actual_decoded_format(&format(1)).unwrap();
        let mut encoder = TestEncoder::new(8, 100);

        mixer.queue_chunk("a", chunk(vec![1; 300], 0)).unwrap();
        mixer.queue_chunk("a", chunk(vec![2; 300], 6_250)).unwrap();

        let mut last = i64::MIN;
        loop {
            match mixer.feed_encoder(&mut encoder, 0).unwrap() {
                MixerFeed::Queued { presentation_us } => {
                    assert!(presentation_us >= last);
                    last = presentation_us;
                }
                MixerFeed::Starved => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(mixer.is_idle());
    }

    #[test]
    fn test_trim_window_cuts_samples() {
        let mut mixer = AudioMixer::new(format(1), &["a".into()], true);
        mixer.set_actual_decoded_format(&format(1)).unwrap();
        let mut encoder = TestEncoder::new(4, 1024);

        // 480 samples = 10ms at 48kHz mono; trim keeps [2.5ms, 7.5ms).
        let mut c = chunk(vec![9; 480], 0);
        c.trim_start_us = 2_500;
        c.trim_end_us = Some(7_500);
        mixer.queue_chunk("a", c).unwrap();

        let fed = mixer.feed_encoder(&mut encoder, 0).unwrap();
        let MixerFeed::Queued { presentation_us } = fed else {
            panic!("expected queued");
        };
        assert_eq!(presentation_us, 2_500);
        assert_eq!(encoder.submitted[0].0.len(), 240);
    }

    #[test]
    fn test_chunk_outside_window_is_skipped() {
        let mut mixer = AudioMixer::new(format(1), &["a".into()], true);
        mixer.set_actual_decoded_format(&format(1)).unwrap();
        let mut encoder = TestEncoder::new(4, 1024);

        let mut c = chunk(vec![9; 480], 0);
        c.trim_end_us = Some(0);
        mixer.queue_chunk("a", c).unwrap();

        assert_eq!(
            mixer.feed_encoder(&mut encoder, 0).unwrap(),
            MixerFeed::Skipped
        );
    }

    #[test]
    fn test_all_end_of_stream_signals_encoder() {
        let mut mixer = AudioMixer::new(format(1), &["a".into(), "b".into()], true);
        mixer.set_actual_decoded_format(&format(1)).unwrap();
        let mut encoder = TestEncoder::new(4, 1024);

        mixer.queue_chunk("a", AudioChunk::end_of_stream()).unwrap();
        mixer.queue_chunk("b", chunk(vec![1; 10], 0)).unwrap();
        // Channel b still has data; its chunk mixes, the marker sticks.
        assert!(matches!(
            mixer.feed_encoder(&mut encoder, 0).unwrap(),
            MixerFeed::Queued { .. }
        ));

        mixer.queue_chunk("b", AudioChunk::end_of_stream()).unwrap();
        assert_eq!(
            mixer.feed_encoder(&mut encoder, 0).unwrap(),
            MixerFeed::EndOfStream
        );
        let (_, _, flags) = encoder.submitted.last().unwrap();
        assert!(flags.end_of_stream);
    }

    #[test]
    fn test_duration_conversions_round_up() {
        let mut mixer = AudioMixer::new(format(1), &["a".into()], true);
        mixer.set_actual_decoded_format(&format(1)).unwrap();
        // 100 samples at 48kHz = 2083.3us, rounds up to 2084.
        assert_eq!(mixer.sample_count_to_duration_us(100), 2_084);
        // 2084us at 48kHz = 100.03 samples, rounds up to 101.
        assert_eq!(mixer.duration_us_to_sample_count(2_084), 101);
    }
}
