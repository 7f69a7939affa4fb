//! The top-level transcoding engine.
//!
//! One loop per segment, interleaving non-blocking steps of both track
//! pipelines. There is no parallel execution across tracks, only
//! cooperative polling, with a short sleep when no stage anywhere makes
//! progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use splice_core::{
    AudioFormat, CodecProvider, ContainerMuxer, FormatStrategy, FrameCompositor, TrackKind,
    VideoFormat,
};
use splice_timeline::Timeline;

use crate::audio_track::AudioTrackTranscoder;
use crate::error::{EngineError, Result};
use crate::governor::{ThrottleConfig, ThrottleGovernor};
use crate::muxer::QueuedMuxer;
use crate::passthrough::PassThroughTrackTranscoder;
use crate::track::TrackTranscoder;
use crate::video_track::VideoTrackTranscoder;

/// Progress value reported while the total duration is unknown.
pub const PROGRESS_UNKNOWN: f64 = -1.0;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Update the progress value every this many loop iterations.
    pub progress_interval_steps: u64,
    /// Sleep this long when a loop iteration makes no progress, in
    /// milliseconds.
    pub idle_sleep_ms: u64,
    /// Cross-track pacing configuration.
    pub throttle: ThrottleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            progress_interval_steps: 10,
            idle_sleep_ms: 10,
            throttle: ThrottleConfig::default(),
        }
    }
}

/// How a transcode run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeOutcome {
    /// The whole timeline was written.
    Completed,
    /// The stall watchdog aborted the run.
    Canceled,
    /// The run failed with an error.
    Failed,
}

struct ProgressState {
    bits: AtomicU64,
    outcome: Mutex<Option<TranscodeOutcome>>,
}

/// Shared, pollable view of a transcode's progress and terminal state.
///
/// The run itself is synchronous; this handle lets another thread (a UI, a
/// status endpoint) observe it without callbacks.
#[derive(Clone)]
pub struct ProgressHandle {
    state: Arc<ProgressState>,
}

impl ProgressHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(ProgressState {
                bits: AtomicU64::new(0f64.to_bits()),
                outcome: Mutex::new(None),
            }),
        }
    }

    /// Current progress in `[0, 1]`, or a negative value when unknown.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.state.bits.load(Ordering::Relaxed))
    }

    /// Terminal state, once the run has ended.
    pub fn outcome(&self) -> Option<TranscodeOutcome> {
        *self.state.outcome.lock()
    }

    fn set_progress(&self, value: f64) {
        self.state.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    fn set_outcome(&self, outcome: TranscodeOutcome) {
        *self.state.outcome.lock() = Some(outcome);
    }
}

/// Counters from a finished run.
#[derive(Debug, Clone, Default)]
pub struct TranscodeStats {
    /// Segments fully processed.
    pub segments_completed: usize,
    /// Engine loop iterations executed.
    pub loop_iterations: u64,
    /// Last video presentation time written, in microseconds.
    pub video_written_us: i64,
    /// Last audio presentation time written, in microseconds.
    pub audio_written_us: i64,
    /// Total planned output duration, when known.
    pub total_duration_us: Option<i64>,
}

/// The platform collaborators one transcode runs against.
pub struct Collaborators {
    /// Codec session factory.
    pub codecs: Box<dyn CodecProvider>,
    /// GPU frame compositor.
    pub compositor: Box<dyn FrameCompositor>,
    /// Output container writer.
    pub muxer: Box<dyn ContainerMuxer>,
}

/// The transcoding engine.
pub struct Engine {
    config: EngineConfig,
    progress: ProgressHandle,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// Create an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            progress: ProgressHandle::new(),
        }
    }

    /// A pollable handle onto this engine's progress.
    pub fn progress_handle(&self) -> ProgressHandle {
        self.progress.clone()
    }

    /// Transcode `timeline` through the given collaborators. Blocks the
    /// calling thread until the run completes, is canceled by the stall
    /// watchdog, or fails.
    pub fn transcode(
        &mut self,
        timeline: &mut Timeline,
        io: Collaborators,
        strategy: &dyn FormatStrategy,
    ) -> Result<TranscodeStats> {
        let result = self.run(timeline, io, strategy);
        match &result {
            Ok(_) => {
                self.progress.set_progress(1.0);
                self.progress.set_outcome(TranscodeOutcome::Completed);
            }
            Err(EngineError::Stalled(_)) => self.progress.set_outcome(TranscodeOutcome::Canceled),
            Err(_) => self.progress.set_outcome(TranscodeOutcome::Failed),
        }
        result
    }

    fn run(
        &mut self,
        timeline: &mut Timeline,
        io: Collaborators,
        strategy: &dyn FormatStrategy,
    ) -> Result<TranscodeStats> {
        timeline.validate()?;
        timeline.probe_metadata()?;

        let probe = probe_inputs(timeline)?;
        let video_output = probe
            .video
            .as_ref()
            .and_then(|(_, format)| strategy.video_output_format(format));
        let audio_output = probe
            .audio
            .as_ref()
            .and_then(|(_, format)| strategy.audio_output_format(format));
        if video_output.is_none() && audio_output.is_none() {
            return Err(EngineError::Config(
                "format strategy elected passthrough for every track; nothing to transcode".into(),
            ));
        }

        let Collaborators {
            mut codecs,
            compositor,
            muxer,
        } = io;
        let mut muxer = QueuedMuxer::new(muxer, probe.video.is_some(), probe.audio.is_some());
        if probe.rotation_degrees != 0 {
            muxer.set_orientation_hint(probe.rotation_degrees);
        }

        let mut tracks: Vec<TrackTranscoder> = Vec::new();
        if let Some((source, input)) = probe.video {
            let track = match video_output {
                Some(output) => {
                    TrackTranscoder::Video(VideoTrackTranscoder::new(output, compositor))
                }
                None => TrackTranscoder::PassThrough(PassThroughTrackTranscoder::new(
                    TrackKind::Video,
                    source,
                    splice_core::TrackFormat::Video(input),
                )),
            };
            tracks.push(track);
        }
        if let Some((source, input)) = probe.audio {
            let track = match audio_output {
                Some(output) => TrackTranscoder::Audio(AudioTrackTranscoder::new(output)),
                None => TrackTranscoder::PassThrough(PassThroughTrackTranscoder::new(
                    TrackKind::Audio,
                    source,
                    splice_core::TrackFormat::Audio(input),
                )),
            };
            tracks.push(track);
        }

        for track in &mut tracks {
            track.setup_encoder(codecs.as_mut(), &mut muxer)?;
        }

        let total_duration_us = timeline.total_duration_us();
        if total_duration_us.is_none() {
            self.progress.set_progress(PROGRESS_UNKNOWN);
        }
        info!(
            segments = timeline.segment_count(),
            total_duration_us = ?total_duration_us,
            "starting transcode"
        );

        let mut governor = ThrottleGovernor::new(self.config.throttle.clone());
        let mut stats = TranscodeStats {
            total_duration_us,
            ..TranscodeStats::default()
        };

        let run_result = self.run_segments(
            timeline,
            &mut tracks,
            &mut governor,
            &mut muxer,
            codecs.as_mut(),
            total_duration_us,
            &mut stats,
        );

        for track in &tracks {
            match track.track_kind() {
                TrackKind::Video => stats.video_written_us = track.written_presentation_time_us(),
                TrackKind::Audio => stats.audio_written_us = track.written_presentation_time_us(),
            }
        }

        match run_result {
            Ok(()) => {
                muxer.stop()?;
                let mut teardown_error = None;
                for track in &mut tracks {
                    if let Err(err) = track.release() {
                        teardown_error = Some(err);
                    }
                }
                muxer.release()?;
                if let Some(err) = teardown_error {
                    // Native sessions may have leaked; a clean-looking output
                    // cannot be trusted.
                    return Err(err);
                }
                info!(
                    segments = stats.segments_completed,
                    iterations = stats.loop_iterations,
                    "transcode completed"
                );
                Ok(stats)
            }
            Err(err) => {
                for track in &mut tracks {
                    if let Err(release_err) = track.release() {
                        warn!(%release_err, "track release failed during abort");
                    }
                }
                if let Err(release_err) = muxer.release() {
                    warn!(%release_err, "muxer release failed during abort");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_segments(
        &mut self,
        timeline: &mut Timeline,
        tracks: &mut [TrackTranscoder],
        governor: &mut ThrottleGovernor,
        muxer: &mut QueuedMuxer,
        codecs: &mut dyn CodecProvider,
        total_duration_us: Option<i64>,
        stats: &mut TranscodeStats,
    ) -> Result<()> {
        let mut output_start_us = 0i64;

        for segment_index in 0..timeline.segment_count() {
            timeline.start_segment(segment_index, output_start_us, output_start_us, output_start_us)?;
            governor.start_segment();
            for track in tracks.iter_mut() {
                track.setup_decoders(timeline, segment_index, governor, codecs)?;
            }
            debug!(
                segment = segment_index,
                output_start_us = timeline.segment(segment_index).output_start_us,
                "segment started"
            );

            loop {
                let mut stepped = false;
                for track in tracks.iter_mut() {
                    if track.step_pipeline(timeline, governor, muxer)? {
                        stepped = true;
                    }
                }
                stats.loop_iterations += 1;

                if stats.loop_iterations % self.config.progress_interval_steps.max(1) == 0 {
                    self.update_progress(total_duration_us, tracks);
                }

                if tracks.iter().all(|t| t.is_segment_finished()) {
                    break;
                }
                governor.step(stepped)?;
                if !stepped {
                    std::thread::sleep(Duration::from_millis(self.config.idle_sleep_ms));
                }
            }

            let segment = timeline.segment(segment_index);
            output_start_us = segment.output_start_us + segment.resolved_duration_us().unwrap_or(0);
            stats.segments_completed += 1;
            debug!(segment = segment_index, "segment finished");
        }
        Ok(())
    }

    fn update_progress(&self, total_duration_us: Option<i64>, tracks: &[TrackTranscoder]) {
        let Some(total) = total_duration_us.filter(|t| *t > 0) else {
            self.progress.set_progress(PROGRESS_UNKNOWN);
            return;
        };
        if tracks.is_empty() {
            return;
        }
        let sum: f64 = tracks
            .iter()
            .map(|t| (t.written_presentation_time_us() as f64 / total as f64).min(1.0))
            .sum();
        self.progress.set_progress(sum / tracks.len() as f64);
    }
}

struct ProbedInputs {
    video: Option<(Arc<dyn splice_core::MediaSource>, VideoFormat)>,
    audio: Option<(Arc<dyn splice_core::MediaSource>, AudioFormat)>,
    rotation_degrees: u32,
}

/// Find the first video and audio input formats across the timeline's
/// channels, plus the first video source's rotation.
fn probe_inputs(timeline: &Timeline) -> Result<ProbedInputs> {
    let mut probe = ProbedInputs {
        video: None,
        audio: None,
        rotation_degrees: 0,
    };
    for (_, channel) in timeline.channels().iter() {
        if (probe.video.is_some() || !channel.kind.has_video())
            && (probe.audio.is_some() || !channel.kind.has_audio())
        {
            continue;
        }
        let extractor = channel.source.open_extractor().map_err(EngineError::Core)?;
        for track_index in 0..extractor.track_count() {
            match extractor.track_format(track_index) {
                Some(splice_core::TrackFormat::Video(format))
                    if probe.video.is_none() && channel.kind.has_video() =>
                {
                    probe.rotation_degrees = channel
                        .source
                        .metadata()
                        .map(|m| m.rotation_degrees)
                        .unwrap_or(0);
                    probe.video = Some((channel.source.clone(), format));
                }
                Some(splice_core::TrackFormat::Audio(format))
                    if probe.audio.is_none() && channel.kind.has_audio() =>
                {
                    probe.audio = Some((channel.source.clone(), format));
                }
                _ => {}
            }
        }
    }
    Ok(probe)
}
