//! # Splice Engine
//!
//! A timeline-driven, multi-track audio/video transcoding engine.
//!
//! Given named input channels and an ordered timeline of segments (cuts,
//! trims, seeks, crossfades, audio mixes), the engine drives per-track
//! pipelines (extraction, decode, mix/composite, encode, mux) into a
//! single synchronized output container.
//!
//! The moving parts:
//! - [`remix`]: channel-count conversion of interleaved 16-bit PCM
//! - [`mixer`]: sample-accurate merging of decoded audio streams, with
//!   overflow carry-over between encoder buffers
//! - [`governor`]: cooperative cross-track pacing and stall cancellation
//! - [`muxer`]: deferred-format multiplexing
//! - [`track`], [`audio_track`], [`video_track`], [`passthrough`]: the
//!   per-track drain state machines
//! - [`engine`]: the segment loop, progress reporting and teardown policy
//!
//! Platform collaborators (codec sessions, extractors, the compositor, the
//! container writer) live behind the trait boundary in `splice-core`; the
//! timeline data model lives in `splice-timeline`.
//!
//! ```text
//! let mut timeline = Timeline::new();
//! timeline.add_channel("movie", source)?;
//! timeline.create_segment()?.output("movie")?;
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! let progress = engine.progress_handle();
//! let stats = engine.transcode(&mut timeline, collaborators, &strategy)?;
//! ```

pub mod audio_track;
pub mod engine;
pub mod error;
pub mod governor;
pub mod mixer;
pub mod muxer;
pub mod passthrough;
pub mod remix;
pub mod track;
pub mod video_track;

pub use audio_track::AudioTrackTranscoder;
pub use engine::{
    Collaborators, Engine, EngineConfig, ProgressHandle, TranscodeOutcome, TranscodeStats,
    PROGRESS_UNKNOWN,
};
pub use error::{EngineError, Result};
pub use governor::{ThrottleConfig, ThrottleGovernor, ThrottleKey};
pub use mixer::{AudioChunk, AudioMixer, MixerFeed};
pub use muxer::QueuedMuxer;
pub use passthrough::PassThroughTrackTranscoder;
pub use remix::{mix, MixBuffer, Remixer};
pub use track::{DrainState, TrackTranscoder};
pub use video_track::VideoTrackTranscoder;
