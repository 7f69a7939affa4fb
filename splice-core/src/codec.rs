//! Collaborator interfaces to the platform codec, container and compositor
//! layers.
//!
//! The engine never talks to hardware directly; everything behind these
//! traits is implemented by the platform integration (or by mocks in tests).
//! Codec sessions follow an index-based buffer-pool contract: callers dequeue
//! a buffer slot with a short timeout, fill or read it, and hand it back.
//! Dequeue calls must return promptly; the engine polls cooperatively and
//! never blocks inside a collaborator.

use crate::error::Result;
use crate::format::TrackFormat;

/// Flags attached to a sample or codec buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// The buffer marks the end of the stream and carries no data.
    pub end_of_stream: bool,
    /// The buffer carries codec configuration (e.g. SPS/PPS), not media data.
    pub codec_config: bool,
    /// The buffer starts at a sync point (key frame).
    pub sync_frame: bool,
}

impl BufferFlags {
    /// Flags for an end-of-stream marker buffer.
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Self::default()
        }
    }
}

/// Metadata describing one codec buffer's payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferMeta {
    /// Presentation timestamp in microseconds.
    pub presentation_time_us: i64,
    /// Payload size in bytes.
    pub size: usize,
    /// Buffer flags.
    pub flags: BufferFlags,
}

/// Outcome of a non-blocking output-buffer dequeue.
#[derive(Debug, Clone, Copy)]
pub enum DequeueEvent {
    /// No buffer is ready; try again on a later poll.
    TryAgainLater,
    /// The session's output format is now known (or changed); query it with
    /// `output_format` before dequeuing again.
    FormatChanged,
    /// The session's buffer pool was reallocated; dequeue again.
    BuffersChanged,
    /// An output buffer is ready at `index`.
    Buffer { index: usize, meta: BufferMeta },
}

/// Identifier of a compositor input or output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// A decoder session.
pub trait Decoder {
    /// Start the session.
    fn start(&mut self) -> Result<()>;

    /// Stop the session.
    fn stop(&mut self) -> Result<()>;

    /// Discard all in-flight buffers (used after a seek).
    fn flush(&mut self) -> Result<()>;

    /// Dequeue an input buffer slot, or `None` if the pool is full.
    fn dequeue_input_buffer(&mut self, timeout_us: i64) -> Option<usize>;

    /// Access the input buffer at `index` for filling.
    fn input_buffer(&mut self, index: usize) -> &mut [u8];

    /// Submit the filled input buffer at `index`.
    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<()>;

    /// Dequeue the next output buffer or status event.
    fn dequeue_output_buffer(&mut self, timeout_us: i64) -> DequeueEvent;

    /// Access the output buffer at `index`.
    fn output_buffer(&self, index: usize) -> &[u8];

    /// The session's actual output format. Only valid after a
    /// [`DequeueEvent::FormatChanged`] has been observed.
    fn output_format(&self) -> TrackFormat;

    /// Return the output buffer at `index` to the pool. When the decoder was
    /// opened with a render target, `render` forwards the frame to it.
    fn release_output_buffer(&mut self, index: usize, render: bool);
}

/// An encoder session. Same buffer-pool shape as [`Decoder`], plus surface
/// input for video.
pub trait Encoder {
    /// Start the session.
    fn start(&mut self) -> Result<()>;

    /// Stop the session.
    fn stop(&mut self) -> Result<()>;

    /// Create the surface that feeds this encoder (video only). Frames drawn
    /// to the surface by the compositor become encoder input.
    fn create_input_surface(&mut self) -> Result<SurfaceId>;

    /// Signal end of input on the encoder's surface (video only).
    fn signal_end_of_input_stream(&mut self) -> Result<()>;

    /// Dequeue an input buffer slot, or `None` if the pool is full.
    fn dequeue_input_buffer(&mut self, timeout_us: i64) -> Option<usize>;

    /// Access the input buffer at `index` for filling.
    fn input_buffer(&mut self, index: usize) -> &mut [u8];

    /// Submit the filled input buffer at `index`.
    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<()>;

    /// Dequeue the next output buffer or status event.
    fn dequeue_output_buffer(&mut self, timeout_us: i64) -> DequeueEvent;

    /// Access the output buffer at `index`.
    fn output_buffer(&self, index: usize) -> &[u8];

    /// The session's actual output format. Only valid after a
    /// [`DequeueEvent::FormatChanged`] has been observed.
    fn output_format(&self) -> TrackFormat;

    /// Return the output buffer at `index` to the pool.
    fn release_output_buffer(&mut self, index: usize);
}

/// A demultiplexer session over one source container.
pub trait Extractor {
    /// Number of tracks in the container.
    fn track_count(&self) -> usize;

    /// Format of the track at `index`.
    fn track_format(&self, index: usize) -> Option<TrackFormat>;

    /// Restrict sample reads to the track at `index`.
    fn select_track(&mut self, index: usize);

    /// Track index of the current sample, or `None` at end of stream.
    fn sample_track_index(&self) -> Option<usize>;

    /// Copy the current sample's payload into `buf`, returning its size.
    fn read_sample_data(&mut self, buf: &mut [u8]) -> usize;

    /// Presentation time of the current sample in microseconds.
    fn sample_time_us(&self) -> i64;

    /// Flags of the current sample.
    fn sample_flags(&self) -> BufferFlags;

    /// Advance to the next sample. Returns `false` at end of stream.
    fn advance(&mut self) -> bool;

    /// Seek to `time_us`. With `to_previous_sync`, lands on the closest sync
    /// sample at or before the target so decoding can restart cleanly.
    fn seek_to(&mut self, time_us: i64, to_previous_sync: bool);
}

/// The GPU compositor that blends decoder output surfaces into the encoder's
/// input surface.
pub trait FrameCompositor {
    /// Allocate an input surface for one decoder.
    fn create_surface(&mut self) -> SurfaceId;

    /// Release a previously created input surface.
    fn release_surface(&mut self, surface: SurfaceId);

    /// Bind the encoder input surface that `draw_frame` renders into.
    fn set_output_surface(&mut self, surface: SurfaceId);

    /// Set the blend opacity of an input surface for the next draw.
    fn set_alpha(&mut self, surface: SurfaceId, alpha: f32);

    /// Blend every input surface holding a frame into the output surface and
    /// submit the result at `presentation_time_us`.
    fn draw_frame(&mut self, presentation_time_us: i64) -> Result<()>;
}

/// The container writer receiving the final muxed output.
pub trait ContainerMuxer {
    /// Record the display rotation of the video track.
    fn set_orientation_hint(&mut self, degrees: u32);

    /// Declare a track's format. Must be called for every track before
    /// `start`.
    fn set_track_format(&mut self, kind: crate::format::TrackKind, format: &TrackFormat)
        -> Result<()>;

    /// Start the muxer. All track formats must have been declared.
    fn start(&mut self) -> Result<()>;

    /// Write one encoded sample.
    fn write_sample_data(
        &mut self,
        kind: crate::format::TrackKind,
        data: &[u8],
        meta: &BufferMeta,
    ) -> Result<()>;

    /// Finalize the container.
    fn stop(&mut self) -> Result<()>;

    /// Release native resources.
    fn release(&mut self) -> Result<()>;
}

/// Factory for codec sessions.
pub trait CodecProvider {
    /// Open a decoder for `format`, optionally rendering to `surface`.
    fn open_decoder(
        &mut self,
        format: &TrackFormat,
        surface: Option<SurfaceId>,
    ) -> Result<Box<dyn Decoder>>;

    /// Open an encoder producing `format`.
    fn open_encoder(&mut self, format: &TrackFormat) -> Result<Box<dyn Encoder>>;
}
