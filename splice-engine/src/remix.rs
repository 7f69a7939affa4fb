//! Channel-count remixing of interleaved signed 16-bit PCM.
//!
//! Two-operand mixing uses Viktor Toth's loudness-preserving law, computed in
//! an unsigned-shifted domain: quiet operands (below the midpoint) blend
//! multiplicatively, loud ones use the complementary formula, and the result
//! is converted back to the signed range.

/// Midpoint of the unsigned 16-bit domain.
const SIGNED_SHORT_LIMIT: i32 = 32_768;
/// Maximum of the unsigned 16-bit domain.
const UNSIGNED_SHORT_MAX: i32 = 65_535;

/// Mix two signed 16-bit samples without clipping artifacts.
pub fn mix(a: i16, b: i16) -> i16 {
    let a = a as i32 + SIGNED_SHORT_LIMIT;
    let b = b as i32 + SIGNED_SHORT_LIMIT;
    let mut m = if a < SIGNED_SHORT_LIMIT || b < SIGNED_SHORT_LIMIT {
        a * b / SIGNED_SHORT_LIMIT
    } else {
        2 * (a + b) - a * b / SIGNED_SHORT_LIMIT - (UNSIGNED_SHORT_MAX + 1)
    };
    if m > UNSIGNED_SHORT_MAX {
        m = UNSIGNED_SHORT_MAX;
    }
    (m - SIGNED_SHORT_LIMIT) as i16
}

/// A fixed-capacity staging buffer that remix variants write into.
///
/// When the buffer already holds samples from a previous channel, a remix
/// pass mixes new data pairwise against the existing content in place;
/// otherwise it writes directly. Content never exceeds the capacity fixed at
/// construction.
#[derive(Debug)]
pub struct MixBuffer {
    data: Vec<i16>,
    len: usize,
}

impl MixBuffer {
    /// Create a buffer holding up to `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    /// Total sample capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The held samples.
    pub fn as_slice(&self) -> &[i16] {
        &self.data[..self.len]
    }

    /// Drop all content.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Channel-count conversion between one decoded stream and the encoder
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remixer {
    /// Stereo in, mono out.
    Downmix,
    /// Mono in, stereo out.
    Upmix,
    /// Same channel count both sides.
    Passthrough,
}

impl Remixer {
    /// Pick the variant for a validated input/output channel-count pair.
    pub fn for_channel_counts(input: u32, output: u32) -> Self {
        if input > output {
            Self::Downmix
        } else if input < output {
            Self::Upmix
        } else {
            Self::Passthrough
        }
    }

    /// Input samples consumed per frame.
    pub fn input_samples_per_frame(&self) -> usize {
        match self {
            Self::Downmix => 2,
            Self::Upmix | Self::Passthrough => 1,
        }
    }

    /// Output samples produced per frame.
    pub fn output_samples_per_frame(&self) -> usize {
        match self {
            Self::Upmix => 2,
            Self::Downmix | Self::Passthrough => 1,
        }
    }

    /// Remix `input` into `output`, bounded by whichever side runs out
    /// first. Returns the number of input samples consumed so the caller can
    /// continue the rest into an overflow buffer.
    pub fn remix(&self, input: &[i16], output: &mut MixBuffer) -> usize {
        let in_per_frame = self.input_samples_per_frame();
        let out_per_frame = self.output_samples_per_frame();
        let in_frames = input.len() / in_per_frame;
        let mixing = !output.is_empty();
        // Mixing reuses occupied slots from the front; appending is bounded
        // by the free tail.
        let out_frames = if mixing {
            output.capacity() / out_per_frame
        } else {
            (output.capacity() - output.len) / out_per_frame
        };
        let frames = in_frames.min(out_frames);

        match self {
            Self::Downmix => {
                for i in 0..frames {
                    let a = mix(input[2 * i], input[2 * i + 1]);
                    write_frame(output, i, &[a]);
                }
            }
            Self::Upmix => {
                for i in 0..frames {
                    let a = input[i];
                    write_frame(output, 2 * i, &[a, a]);
                }
            }
            Self::Passthrough => {
                for (i, &a) in input.iter().take(frames).enumerate() {
                    write_frame(output, i, &[a]);
                }
            }
        }

        output.len = output.len.max(frames * out_per_frame);
        frames * in_per_frame
    }
}

/// Write `samples` starting at `base`, mixing against any existing content.
fn write_frame(output: &mut MixBuffer, base: usize, samples: &[i16]) {
    for (offset, &sample) in samples.iter().enumerate() {
        let index = base + offset;
        output.data[index] = if index < output.len {
            mix(sample, output.data[index])
        } else {
            sample
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_silence() {
        assert_eq!(mix(0, 0), 0);
    }

    #[test]
    fn test_mix_with_silence_is_identity() {
        for &s in &[0i16, 1, -1, 12_345, -12_345, 32_767, -32_768] {
            assert_eq!(mix(s, 0), s);
            assert_eq!(mix(0, s), s);
        }
    }

    #[test]
    fn test_mix_no_wrap_at_full_scale() {
        let m = mix(32_767, 32_767);
        assert_eq!(m, 32_767);
        let m = mix(-32_768, -32_768);
        assert_eq!(m, -32_768);
    }

    #[test]
    fn test_downmix_known_pairs() {
        let input = [0i16, 0, 1_000, 0, 0, -5_000];
        let mut out = MixBuffer::with_capacity(3);
        let consumed = Remixer::Downmix.remix(&input, &mut out);
        assert_eq!(consumed, 6);
        assert_eq!(out.as_slice(), &[0, 1_000, -5_000]);
    }

    #[test]
    fn test_upmix_duplicates_samples() {
        let input = [100i16, -200];
        let mut out = MixBuffer::with_capacity(4);
        let consumed = Remixer::Upmix.remix(&input, &mut out);
        assert_eq!(consumed, 2);
        assert_eq!(out.as_slice(), &[100, 100, -200, -200]);
    }

    #[test]
    fn test_downmix_of_upmix_round_trips_at_silence_and_full_scale() {
        // The mixing law compresses mid-scale same-sign pairs, but silence
        // and full-scale values must survive the round trip without wrapping.
        for &x in &[0i16, 1, -1, 32_767, -32_768] {
            let mut stereo = MixBuffer::with_capacity(2);
            Remixer::Upmix.remix(&[x], &mut stereo);
            let mut mono = MixBuffer::with_capacity(1);
            Remixer::Downmix.remix(stereo.as_slice(), &mut mono);
            let back = mono.as_slice()[0];
            assert!((back as i32 - x as i32).abs() <= 1, "{} -> {}", x, back);
        }
    }

    #[test]
    fn test_bounds_input_larger_than_output() {
        let input = [1i16; 100];
        let mut out = MixBuffer::with_capacity(10);
        let consumed = Remixer::Passthrough.remix(&input, &mut out);
        assert_eq!(consumed, 10);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_bounds_output_larger_than_input() {
        let input = [1i16; 4];
        let mut out = MixBuffer::with_capacity(100);
        let consumed = Remixer::Passthrough.remix(&input, &mut out);
        assert_eq!(consumed, 4);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_bounds_downmix_odd_output_space() {
        // 8 input samples = 4 stereo frames, but only room for 3 mono.
        let input = [500i16; 8];
        let mut out = MixBuffer::with_capacity(3);
        let consumed = Remixer::Downmix.remix(&input, &mut out);
        assert_eq!(consumed, 6);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_mix_against_existing_content() {
        let mut out = MixBuffer::with_capacity(4);
        Remixer::Passthrough.remix(&[1000, 1000, 1000, 1000], &mut out);
        Remixer::Passthrough.remix(&[2000, 2000], &mut out);
        // First two slots mixed, last two untouched.
        assert!(out.as_slice()[0] > 1000);
        assert_eq!(out.as_slice()[2], 1000);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_second_channel_extends_existing() {
        let mut out = MixBuffer::with_capacity(4);
        Remixer::Passthrough.remix(&[1000, 1000], &mut out);
        Remixer::Passthrough.remix(&[2000, 2000, 2000, 2000], &mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(out.as_slice()[3], 2000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn remix_never_overruns_either_buffer(
                input in proptest::collection::vec(any::<i16>(), 0..256),
                capacity in 0usize..128,
                variant in 0u8..3,
            ) {
                let remixer = match variant {
                    0 => Remixer::Downmix,
                    1 => Remixer::Upmix,
                    _ => Remixer::Passthrough,
                };
                let mut out = MixBuffer::with_capacity(capacity);
                let consumed = remixer.remix(&input, &mut out);

                prop_assert!(consumed <= input.len());
                prop_assert!(out.len() <= capacity);
                prop_assert_eq!(consumed % remixer.input_samples_per_frame(), 0);

                // Exactly min(input frames, output frame capacity) processed.
                let frames = consumed / remixer.input_samples_per_frame();
                let in_frames = input.len() / remixer.input_samples_per_frame();
                let out_frames = capacity / remixer.output_samples_per_frame();
                prop_assert_eq!(frames, in_frames.min(out_frames));
                prop_assert_eq!(out.len(), frames * remixer.output_samples_per_frame());
            }
        }
    }
}
