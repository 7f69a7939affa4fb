//! Track passthrough.
//!
//! When the format strategy elects no re-encode for a track, its samples are
//! copied from the extractor straight to the muxer, bypassing codecs and the
//! compositor entirely.

use tracing::debug;

use splice_core::{BufferMeta, Extractor, MediaSource, TrackFormat, TrackKind};
use splice_timeline::Timeline;

use crate::error::{EngineError, Result};
use crate::muxer::QueuedMuxer;
use crate::track::find_track;

/// Copies one source track's samples directly to the output container.
pub struct PassThroughTrackTranscoder {
    kind: TrackKind,
    source: std::sync::Arc<dyn MediaSource>,
    format: TrackFormat,
    extractor: Option<Box<dyn Extractor>>,
    track_index: usize,
    buffer: Vec<u8>,
    /// Output time at which the current segment stops consuming, or
    /// `i64::MAX` when open-ended.
    segment_end_us: i64,
    eos: bool,
    written_presentation_us: i64,
}

impl PassThroughTrackTranscoder {
    /// Create a passthrough for the `kind` track of `source`, whose input
    /// format is `format`.
    pub fn new(kind: TrackKind, source: std::sync::Arc<dyn MediaSource>, format: TrackFormat) -> Self {
        Self {
            kind,
            source,
            format,
            extractor: None,
            track_index: 0,
            buffer: vec![0u8; 256 * 1024],
            segment_end_us: i64::MAX,
            eos: false,
            written_presentation_us: 0,
        }
    }

    /// Which track this passthrough feeds.
    pub fn track_kind(&self) -> TrackKind {
        self.kind
    }

    /// Declare the (unchanged) output format to the muxer.
    pub fn setup_encoder(&mut self, muxer: &mut QueuedMuxer) -> Result<()> {
        muxer.set_output_format(self.kind, self.format.clone())
    }

    /// Note the segment's output boundary; the extractor opens lazily on the
    /// first segment.
    pub fn setup_segment(&mut self, timeline: &mut Timeline, segment_index: usize) -> Result<()> {
        if self.extractor.is_none() {
            let mut extractor = self.source.open_extractor().map_err(EngineError::Core)?;
            let (track_index, _) = find_track(extractor.as_ref(), self.kind)?;
            extractor.select_track(track_index);
            self.track_index = track_index;
            self.extractor = Some(extractor);
            debug!(kind = %self.kind, track_index, "opened passthrough extractor");
        }
        let segment = timeline.segment(segment_index);
        self.segment_end_us = match segment.resolved_duration_us() {
            Some(duration) => segment.output_start_us + duration,
            None => i64::MAX,
        };
        Ok(())
    }

    /// Copy samples up to the segment boundary.
    pub fn step_pipeline(&mut self, muxer: &mut QueuedMuxer) -> Result<bool> {
        if self.eos {
            return Ok(false);
        }
        let extractor = self
            .extractor
            .as_mut()
            .ok_or_else(|| EngineError::Config("passthrough extractor not set up".into()))?;

        let mut busy = false;
        loop {
            let Some(track) = extractor.sample_track_index() else {
                self.eos = true;
                debug!(kind = %self.kind, "passthrough source exhausted");
                break;
            };
            if track != self.track_index {
                extractor.advance();
                continue;
            }
            let presentation_us = extractor.sample_time_us();
            if presentation_us >= self.segment_end_us {
                break;
            }
            let flags = extractor.sample_flags();
            let size = extractor.read_sample_data(&mut self.buffer);
            let meta = BufferMeta {
                presentation_time_us: presentation_us,
                size,
                flags,
            };
            muxer.write_sample_data(self.kind, &self.buffer[..size], &meta)?;
            self.written_presentation_us = presentation_us;
            extractor.advance();
            busy = true;
        }
        Ok(busy)
    }

    /// Whether the current segment's span has been copied.
    pub fn is_segment_finished(&self) -> bool {
        if self.eos {
            return true;
        }
        self.extractor
            .as_ref()
            .map_or(false, |e| match e.sample_track_index() {
                None => true,
                Some(_) => e.sample_time_us() >= self.segment_end_us,
            })
    }

    /// Output presentation time of the last copied sample.
    pub fn written_presentation_time_us(&self) -> i64 {
        self.written_presentation_us
    }

    /// The track's output format (identical to its input format).
    pub fn determined_format(&self) -> TrackFormat {
        self.format.clone()
    }

    /// Drop the extractor.
    pub fn release(&mut self) -> Result<()> {
        self.extractor = None;
        Ok(())
    }
}
