//! Track transcoder capability set.

use splice_core::{BufferMeta, CodecProvider, CoreError, Extractor, TrackFormat, TrackKind};
use splice_timeline::Timeline;

use crate::audio_track::AudioTrackTranscoder;
use crate::error::Result;
use crate::governor::ThrottleGovernor;
use crate::muxer::QueuedMuxer;
use crate::passthrough::PassThroughTrackTranscoder;
use crate::video_track::VideoTrackTranscoder;

/// Progress signal from one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Nothing to do.
    None,
    /// Re-poll the stage right away (e.g. after a format change).
    RetryImmediately,
    /// A buffer was moved through the stage.
    Consumed,
}

/// A decoded buffer parked for deferred consumption.
///
/// When a policy declines a buffer (past the segment's end time, or above
/// the throttle allowance), the buffer is not released back to its decoder;
/// it waits in this one-slot option and is re-examined before any new
/// dequeue.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingBuffer {
    pub index: usize,
    pub meta: BufferMeta,
}

/// Locate the first track of `kind` in an extractor.
pub(crate) fn find_track(
    extractor: &dyn Extractor,
    kind: TrackKind,
) -> Result<(usize, TrackFormat)> {
    for index in 0..extractor.track_count() {
        if let Some(format) = extractor.track_format(index) {
            if format.kind() == kind {
                return Ok((index, format));
            }
        }
    }
    Err(crate::error::EngineError::Core(CoreError::Container(
        format!("source has no {kind} track"),
    )))
}

/// One per-track pipeline driver.
///
/// The engine depends only on this closed capability set; the three variants
/// are the only implementations.
pub enum TrackTranscoder {
    Audio(AudioTrackTranscoder),
    Video(VideoTrackTranscoder),
    PassThrough(PassThroughTrackTranscoder),
}

impl TrackTranscoder {
    /// Which output track this driver feeds.
    pub fn track_kind(&self) -> TrackKind {
        match self {
            Self::Audio(_) => TrackKind::Audio,
            Self::Video(_) => TrackKind::Video,
            Self::PassThrough(t) => t.track_kind(),
        }
    }

    /// Open the track's encoder. Called once for the whole transcode.
    pub fn setup_encoder(
        &mut self,
        codecs: &mut dyn CodecProvider,
        muxer: &mut QueuedMuxer,
    ) -> Result<()> {
        match self {
            Self::Audio(t) => t.setup_encoder(codecs),
            Self::Video(t) => t.setup_encoder(codecs),
            Self::PassThrough(t) => t.setup_encoder(muxer),
        }
    }

    /// Open or reuse decoders for the channels the segment references,
    /// releasing those no upcoming segment needs, and register with the
    /// governor.
    pub fn setup_decoders(
        &mut self,
        timeline: &mut Timeline,
        segment_index: usize,
        governor: &mut ThrottleGovernor,
        codecs: &mut dyn CodecProvider,
    ) -> Result<()> {
        match self {
            Self::Audio(t) => t.setup_decoders(timeline, segment_index, governor, codecs),
            Self::Video(t) => t.setup_decoders(timeline, segment_index, governor, codecs),
            Self::PassThrough(t) => t.setup_segment(timeline, segment_index),
        }
    }

    /// Run one cooperative pipeline step. Returns whether any stage made
    /// progress.
    pub fn step_pipeline(
        &mut self,
        timeline: &mut Timeline,
        governor: &mut ThrottleGovernor,
        muxer: &mut QueuedMuxer,
    ) -> Result<bool> {
        match self {
            Self::Audio(t) => t.step_pipeline(timeline, governor, muxer),
            Self::Video(t) => t.step_pipeline(timeline, governor, muxer),
            Self::PassThrough(t) => t.step_pipeline(muxer),
        }
    }

    /// Whether the current segment has been fully consumed by this track.
    pub fn is_segment_finished(&self) -> bool {
        match self {
            Self::Audio(t) => t.is_segment_finished(),
            Self::Video(t) => t.is_segment_finished(),
            Self::PassThrough(t) => t.is_segment_finished(),
        }
    }

    /// Output presentation time of the last sample written to the muxer.
    pub fn written_presentation_time_us(&self) -> i64 {
        match self {
            Self::Audio(t) => t.written_presentation_time_us(),
            Self::Video(t) => t.written_presentation_time_us(),
            Self::PassThrough(t) => t.written_presentation_time_us(),
        }
    }

    /// The track's actual output format, once reported by the encoder.
    pub fn determined_format(&self) -> Option<TrackFormat> {
        match self {
            Self::Audio(t) => t.determined_format(),
            Self::Video(t) => t.determined_format(),
            Self::PassThrough(t) => Some(t.determined_format()),
        }
    }

    /// Release codec resources.
    pub fn release(&mut self) -> Result<()> {
        match self {
            Self::Audio(t) => t.release(),
            Self::Video(t) => t.release(),
            Self::PassThrough(t) => t.release(),
        }
    }
}
