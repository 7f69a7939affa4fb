//! Deferred-format multiplexing.
//!
//! Hardware encoders report their actual output format only after producing
//! their first output, so the container muxer cannot start when transcoding
//! begins. The queued muxer buffers every written sample until both expected
//! tracks have reported a format, then starts the underlying muxer, flushes
//! the queue in original arrival order, and switches to passthrough.

use tracing::{debug, trace};

use splice_core::{BufferMeta, ContainerMuxer, CoreError, TrackFormat, TrackKind};

use crate::error::{EngineError, Result};

struct QueuedSample {
    kind: TrackKind,
    data: Vec<u8>,
    meta: BufferMeta,
}

/// Muxer front-end that defers writing until every track's format is known.
pub struct QueuedMuxer {
    inner: Box<dyn ContainerMuxer>,
    expects_video: bool,
    expects_audio: bool,
    video_format: Option<TrackFormat>,
    audio_format: Option<TrackFormat>,
    queue: Vec<QueuedSample>,
    started: bool,
}

impl QueuedMuxer {
    /// Wrap `inner`, expecting formats for the indicated tracks.
    pub fn new(inner: Box<dyn ContainerMuxer>, expects_video: bool, expects_audio: bool) -> Self {
        Self {
            inner,
            expects_video,
            expects_audio,
            video_format: None,
            audio_format: None,
            queue: Vec::new(),
            started: false,
        }
    }

    /// Record the display rotation. Must precede the first format report.
    pub fn set_orientation_hint(&mut self, degrees: u32) {
        self.inner.set_orientation_hint(degrees);
    }

    /// Report one track's actual output format. Reporting the same track
    /// twice is a fatal error. When every expected track has reported, the
    /// underlying muxer starts and the queue flushes in arrival order.
    pub fn set_output_format(&mut self, kind: TrackKind, format: TrackFormat) -> Result<()> {
        let slot = match kind {
            TrackKind::Video => &mut self.video_format,
            TrackKind::Audio => &mut self.audio_format,
        };
        if slot.is_some() {
            return Err(EngineError::Core(CoreError::FormatChangedTwice(kind)));
        }
        debug!(%kind, %format, "muxer track format determined");
        *slot = Some(format);

        if self.ready() {
            self.start_and_flush()?;
        }
        Ok(())
    }

    fn ready(&self) -> bool {
        (!self.expects_video || self.video_format.is_some())
            && (!self.expects_audio || self.audio_format.is_some())
    }

    fn start_and_flush(&mut self) -> Result<()> {
        if let Some(format) = &self.video_format {
            self.inner.set_track_format(TrackKind::Video, format)?;
        }
        if let Some(format) = &self.audio_format {
            self.inner.set_track_format(TrackKind::Audio, format)?;
        }
        self.inner.start()?;
        self.started = true;

        debug!(queued = self.queue.len(), "flushing deferred samples");
        for sample in self.queue.drain(..) {
            self.inner
                .write_sample_data(sample.kind, &sample.data, &sample.meta)?;
        }
        Ok(())
    }

    /// Write one encoded sample, buffering it if formats are still pending.
    /// The payload is copied when queued so the caller can recycle its
    /// buffer.
    pub fn write_sample_data(
        &mut self,
        kind: TrackKind,
        data: &[u8],
        meta: &BufferMeta,
    ) -> Result<()> {
        if self.started {
            trace!(%kind, size = data.len(), presentation_us = meta.presentation_time_us, "writing sample");
            self.inner.write_sample_data(kind, data, meta)?;
        } else {
            trace!(%kind, size = data.len(), "queueing sample until formats resolve");
            self.queue.push(QueuedSample {
                kind,
                data: data.to_vec(),
                meta: *meta,
            });
        }
        Ok(())
    }

    /// Whether the underlying muxer has started.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Finalize the container. Fails if formats never resolved while samples
    /// were written.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started && !self.queue.is_empty() {
            let kind = if self.expects_video && self.video_format.is_none() {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            return Err(EngineError::Core(CoreError::FormatUndetermined(kind)));
        }
        if self.started {
            self.inner.stop()?;
        }
        Ok(())
    }

    /// Release the underlying muxer's resources.
    pub fn release(&mut self) -> Result<()> {
        self.inner.release()?;
        Ok(())
    }
}
