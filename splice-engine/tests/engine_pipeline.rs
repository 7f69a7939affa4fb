//! Engine integration tests.
//!
//! Drives the full engine against mock collaborators (extractor, identity
//! codecs, compositor and container muxer) to verify segment sequencing,
//! synchronization and the deferred-format muxing protocol end to end.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, NativeEndian};

use splice_core::{
    AudioFormat, BufferFlags, BufferMeta, CodecProvider, ContainerMuxer, Decoder, DequeueEvent,
    Encoder, Extractor, FormatStrategy, FrameCompositor, MediaSource, SourceMetadata, SurfaceId,
    TrackFormat, TrackKind, VideoFormat,
};
use splice_engine::{Collaborators, Engine, EngineConfig, EngineError, ThrottleConfig, TranscodeOutcome};
use splice_timeline::{Filter, Timeline};

const FRAME_US: i64 = 25_000;
const CHUNK_US: i64 = 10_000;
const SAMPLE_RATE: u32 = 48_000;

// =============================================================================
// Mock source & extractor
// =============================================================================

#[derive(Clone)]
struct MediaSpec {
    duration_us: i64,
    has_video: bool,
    has_audio: bool,
    rotation_degrees: u32,
    pcm_value: i16,
}

impl MediaSpec {
    fn audio_video(duration_us: i64) -> Self {
        Self {
            duration_us,
            has_video: true,
            has_audio: true,
            rotation_degrees: 0,
            pcm_value: 1_000,
        }
    }
}

struct MockSource {
    spec: MediaSpec,
}

impl MediaSource for MockSource {
    fn metadata(&self) -> splice_core::Result<SourceMetadata> {
        Ok(SourceMetadata {
            duration_us: self.spec.duration_us,
            rotation_degrees: self.spec.rotation_degrees,
            has_video: self.spec.has_video,
            has_audio: self.spec.has_audio,
            frame_duration_us: Some(FRAME_US),
        })
    }

    fn open_extractor(&self) -> splice_core::Result<Box<dyn Extractor>> {
        Ok(Box::new(MockExtractor::new(&self.spec)))
    }
}

struct MockSample {
    time_us: i64,
    data: Vec<u8>,
    sync: bool,
}

struct MockTrack {
    format: TrackFormat,
    samples: Vec<MockSample>,
}

struct MockExtractor {
    tracks: Vec<MockTrack>,
    selected: Option<usize>,
    cursor: usize,
}

impl MockExtractor {
    fn new(spec: &MediaSpec) -> Self {
        let mut tracks = Vec::new();
        if spec.has_video {
            let mut samples = Vec::new();
            let mut t = 0;
            let mut index = 0;
            while t < spec.duration_us {
                samples.push(MockSample {
                    time_us: t,
                    data: vec![0xAB; 64],
                    sync: index % 4 == 0,
                });
                t += FRAME_US;
                index += 1;
            }
            tracks.push(MockTrack {
                format: TrackFormat::Video(VideoFormat {
                    codec: "h264".into(),
                    width: 320,
                    height: 240,
                    frame_rate: 1_000_000.0 / FRAME_US as f64,
                    bit_rate: None,
                }),
                samples,
            });
        }
        if spec.has_audio {
            let chunk_samples = (CHUNK_US * SAMPLE_RATE as i64 / 1_000_000) as usize;
            let mut samples = Vec::new();
            let mut t = 0;
            while t < spec.duration_us {
                let pcm = vec![spec.pcm_value; chunk_samples];
                let mut data = vec![0u8; chunk_samples * 2];
                NativeEndian::write_i16_into(&pcm, &mut data);
                samples.push(MockSample {
                    time_us: t,
                    data,
                    sync: true,
                });
                t += CHUNK_US;
            }
            tracks.push(MockTrack {
                format: TrackFormat::Audio(AudioFormat {
                    codec: "aac".into(),
                    sample_rate: SAMPLE_RATE,
                    channel_count: 1,
                    bit_rate: None,
                }),
                samples,
            });
        }
        Self {
            tracks,
            selected: None,
            cursor: 0,
        }
    }

    fn selected_track(&self) -> Option<&MockTrack> {
        self.selected.map(|i| &self.tracks[i])
    }
}

impl Extractor for MockExtractor {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).map(|t| t.format.clone())
    }

    fn select_track(&mut self, index: usize) {
        self.selected = Some(index);
        self.cursor = 0;
    }

    fn sample_track_index(&self) -> Option<usize> {
        let track = self.selected_track()?;
        if self.cursor < track.samples.len() {
            self.selected
        } else {
            None
        }
    }

    fn read_sample_data(&mut self, buf: &mut [u8]) -> usize {
        let Some(track) = self.selected.map(|i| &self.tracks[i]) else {
            return 0;
        };
        let data = &track.samples[self.cursor].data;
        buf[..data.len()].copy_from_slice(data);
        data.len()
    }

    fn sample_time_us(&self) -> i64 {
        self.selected_track()
            .map(|t| t.samples[self.cursor].time_us)
            .unwrap_or(0)
    }

    fn sample_flags(&self) -> BufferFlags {
        let sync = self
            .selected_track()
            .map(|t| t.samples[self.cursor].sync)
            .unwrap_or(false);
        BufferFlags {
            sync_frame: sync,
            ..BufferFlags::default()
        }
    }

    fn advance(&mut self) -> bool {
        self.cursor += 1;
        self.selected_track()
            .map(|t| self.cursor < t.samples.len())
            .unwrap_or(false)
    }

    fn seek_to(&mut self, time_us: i64, to_previous_sync: bool) {
        let Some(track) = self.selected.map(|i| &self.tracks[i]) else {
            return;
        };
        let mut landing = 0;
        for (index, sample) in track.samples.iter().enumerate() {
            if sample.time_us <= time_us && (!to_previous_sync || sample.sync) {
                landing = index;
            }
            if sample.time_us > time_us {
                break;
            }
        }
        self.cursor = landing;
    }
}

// =============================================================================
// Mock codecs
// =============================================================================

/// Identity decoder: each queued input buffer comes back out unchanged.
struct MockDecoder {
    format: TrackFormat,
    produce: bool,
    format_reported: bool,
    input_buffers: Vec<Vec<u8>>,
    input_free: VecDeque<usize>,
    queued: VecDeque<(Vec<u8>, i64, BufferFlags)>,
    output_buffers: Vec<Vec<u8>>,
    output_free: VecDeque<usize>,
}

impl MockDecoder {
    fn new(format: TrackFormat, produce: bool) -> Self {
        Self {
            format,
            produce,
            format_reported: false,
            input_buffers: (0..4).map(|_| vec![0u8; 4096]).collect(),
            input_free: (0..4).collect(),
            queued: VecDeque::new(),
            output_buffers: (0..4).map(|_| vec![0u8; 4096]).collect(),
            output_free: (0..4).collect(),
        }
    }
}

impl Decoder for MockDecoder {
    fn start(&mut self) -> splice_core::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> splice_core::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> splice_core::Result<()> {
        self.queued.clear();
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout_us: i64) -> Option<usize> {
        self.input_free.pop_front()
    }

    fn input_buffer(&mut self, index: usize) -> &mut [u8] {
        &mut self.input_buffers[index]
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> splice_core::Result<()> {
        let data = self.input_buffers[index][..size].to_vec();
        self.queued.push_back((data, presentation_time_us, flags));
        self.input_free.push_back(index);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout_us: i64) -> DequeueEvent {
        if !self.format_reported {
            self.format_reported = true;
            return DequeueEvent::FormatChanged;
        }
        if !self.produce || self.queued.is_empty() {
            return DequeueEvent::TryAgainLater;
        }
        let Some(slot) = self.output_free.pop_front() else {
            return DequeueEvent::TryAgainLater;
        };
        let (data, presentation_time_us, flags) = self.queued.pop_front().unwrap();
        self.output_buffers[slot][..data.len()].copy_from_slice(&data);
        DequeueEvent::Buffer {
            index: slot,
            meta: BufferMeta {
                presentation_time_us,
                size: data.len(),
                flags,
            },
        }
    }

    fn output_buffer(&self, index: usize) -> &[u8] {
        &self.output_buffers[index]
    }

    fn output_format(&self) -> TrackFormat {
        self.format.clone()
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) {
        self.output_free.push_back(index);
    }
}

/// Identity audio encoder: PCM in, the same bytes out.
struct MockAudioEncoder {
    format: TrackFormat,
    format_reported: bool,
    input_buffers: Vec<Vec<u8>>,
    input_free: VecDeque<usize>,
    queued: VecDeque<(Vec<u8>, i64, BufferFlags)>,
    output_buffers: Vec<Vec<u8>>,
    output_free: VecDeque<usize>,
}

impl MockAudioEncoder {
    fn new(format: TrackFormat) -> Self {
        Self {
            format,
            format_reported: false,
            input_buffers: (0..4).map(|_| vec![0u8; 4096]).collect(),
            input_free: (0..4).collect(),
            queued: VecDeque::new(),
            output_buffers: (0..4).map(|_| vec![0u8; 4096]).collect(),
            output_free: (0..4).collect(),
        }
    }
}

impl Encoder for MockAudioEncoder {
    fn start(&mut self) -> splice_core::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> splice_core::Result<()> {
        Ok(())
    }

    fn create_input_surface(&mut self) -> splice_core::Result<SurfaceId> {
        Err(splice_core::CoreError::Unsupported(
            "audio encoder has no surface".into(),
        ))
    }

    fn signal_end_of_input_stream(&mut self) -> splice_core::Result<()> {
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout_us: i64) -> Option<usize> {
        self.input_free.pop_front()
    }

    fn input_buffer(&mut self, index: usize) -> &mut [u8] {
        &mut self.input_buffers[index]
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> splice_core::Result<()> {
        let data = self.input_buffers[index][..size].to_vec();
        self.queued.push_back((data, presentation_time_us, flags));
        self.input_free.push_back(index);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout_us: i64) -> DequeueEvent {
        if !self.format_reported {
            self.format_reported = true;
            return DequeueEvent::FormatChanged;
        }
        if self.queued.is_empty() {
            return DequeueEvent::TryAgainLater;
        }
        let Some(slot) = self.output_free.pop_front() else {
            return DequeueEvent::TryAgainLater;
        };
        let (data, presentation_time_us, flags) = self.queued.pop_front().unwrap();
        self.output_buffers[slot][..data.len()].copy_from_slice(&data);
        DequeueEvent::Buffer {
            index: slot,
            meta: BufferMeta {
                presentation_time_us,
                size: data.len(),
                flags,
            },
        }
    }

    fn output_buffer(&self, index: usize) -> &[u8] {
        &self.output_buffers[index]
    }

    fn output_format(&self) -> TrackFormat {
        self.format.clone()
    }

    fn release_output_buffer(&mut self, index: usize) {
        self.output_free.push_back(index);
    }
}

/// Frames drawn by the compositor travel to the video encoder through this
/// bus, standing in for the shared GPU surface.
#[derive(Default)]
struct SurfaceBus {
    frames: VecDeque<i64>,
    end_of_stream: bool,
}

struct MockVideoEncoder {
    format: TrackFormat,
    format_reported: bool,
    eos_emitted: bool,
    bus: Rc<RefCell<SurfaceBus>>,
    output_buffers: Vec<Vec<u8>>,
    output_free: VecDeque<usize>,
}

impl MockVideoEncoder {
    fn new(format: TrackFormat, bus: Rc<RefCell<SurfaceBus>>) -> Self {
        Self {
            format,
            format_reported: false,
            eos_emitted: false,
            bus,
            output_buffers: (0..8).map(|_| vec![0u8; 256]).collect(),
            output_free: (0..8).collect(),
        }
    }
}

impl Encoder for MockVideoEncoder {
    fn start(&mut self) -> splice_core::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> splice_core::Result<()> {
        Ok(())
    }

    fn create_input_surface(&mut self) -> splice_core::Result<SurfaceId> {
        Ok(SurfaceId(9_999))
    }

    fn signal_end_of_input_stream(&mut self) -> splice_core::Result<()> {
        self.bus.borrow_mut().end_of_stream = true;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout_us: i64) -> Option<usize> {
        None
    }

    fn input_buffer(&mut self, _index: usize) -> &mut [u8] {
        &mut []
    }

    fn queue_input_buffer(
        &mut self,
        _index: usize,
        _size: usize,
        _presentation_time_us: i64,
        _flags: BufferFlags,
    ) -> splice_core::Result<()> {
        Err(splice_core::CoreError::Unsupported(
            "surface-fed encoder".into(),
        ))
    }

    fn dequeue_output_buffer(&mut self, _timeout_us: i64) -> DequeueEvent {
        if !self.format_reported {
            self.format_reported = true;
            return DequeueEvent::FormatChanged;
        }
        let frame = self.bus.borrow_mut().frames.pop_front();
        if let Some(presentation_time_us) = frame {
            let Some(slot) = self.output_free.pop_front() else {
                self.bus.borrow_mut().frames.push_front(presentation_time_us);
                return DequeueEvent::TryAgainLater;
            };
            return DequeueEvent::Buffer {
                index: slot,
                meta: BufferMeta {
                    presentation_time_us,
                    size: 128,
                    flags: BufferFlags::default(),
                },
            };
        }
        if self.bus.borrow().end_of_stream && !self.eos_emitted {
            if let Some(slot) = self.output_free.pop_front() {
                self.eos_emitted = true;
                return DequeueEvent::Buffer {
                    index: slot,
                    meta: BufferMeta {
                        presentation_time_us: 0,
                        size: 0,
                        flags: BufferFlags::end_of_stream(),
                    },
                };
            }
        }
        DequeueEvent::TryAgainLater
    }

    fn output_buffer(&self, index: usize) -> &[u8] {
        &self.output_buffers[index]
    }

    fn output_format(&self) -> TrackFormat {
        self.format.clone()
    }

    fn release_output_buffer(&mut self, index: usize) {
        self.output_free.push_back(index);
    }
}

struct MockCodecs {
    bus: Rc<RefCell<SurfaceBus>>,
    stall_audio_decoder: bool,
}

impl CodecProvider for MockCodecs {
    fn open_decoder(
        &mut self,
        format: &TrackFormat,
        _surface: Option<SurfaceId>,
    ) -> splice_core::Result<Box<dyn Decoder>> {
        let produce = !(self.stall_audio_decoder && format.kind() == TrackKind::Audio);
        Ok(Box::new(MockDecoder::new(format.clone(), produce)))
    }

    fn open_encoder(&mut self, format: &TrackFormat) -> splice_core::Result<Box<dyn Encoder>> {
        match format.kind() {
            TrackKind::Audio => Ok(Box::new(MockAudioEncoder::new(format.clone()))),
            TrackKind::Video => Ok(Box::new(MockVideoEncoder::new(
                format.clone(),
                self.bus.clone(),
            ))),
        }
    }
}

// =============================================================================
// Mock compositor & muxer
// =============================================================================

#[derive(Default)]
struct DrawLog {
    /// (presentation time, alphas by surface) per composed frame.
    draws: Vec<(i64, Vec<(SurfaceId, f32)>)>,
}

struct MockCompositor {
    bus: Rc<RefCell<SurfaceBus>>,
    log: Rc<RefCell<DrawLog>>,
    next_surface: u64,
    alphas: Vec<(SurfaceId, f32)>,
}

impl MockCompositor {
    fn new(bus: Rc<RefCell<SurfaceBus>>, log: Rc<RefCell<DrawLog>>) -> Self {
        Self {
            bus,
            log,
            next_surface: 0,
            alphas: Vec::new(),
        }
    }
}

impl FrameCompositor for MockCompositor {
    fn create_surface(&mut self) -> SurfaceId {
        let id = SurfaceId(self.next_surface);
        self.next_surface += 1;
        self.alphas.push((id, 1.0));
        id
    }

    fn release_surface(&mut self, surface: SurfaceId) {
        self.alphas.retain(|(id, _)| *id != surface);
    }

    fn set_output_surface(&mut self, _surface: SurfaceId) {}

    fn set_alpha(&mut self, surface: SurfaceId, alpha: f32) {
        for (id, value) in &mut self.alphas {
            if *id == surface {
                *value = alpha;
            }
        }
    }

    fn draw_frame(&mut self, presentation_time_us: i64) -> splice_core::Result<()> {
        self.log
            .borrow_mut()
            .draws
            .push((presentation_time_us, self.alphas.clone()));
        self.bus.borrow_mut().frames.push_back(presentation_time_us);
        Ok(())
    }
}

#[derive(Default)]
struct MuxLog {
    started: bool,
    stopped: bool,
    formats: Vec<TrackKind>,
    writes: Vec<(TrackKind, i64, usize)>,
}

struct MockMuxer {
    log: Rc<RefCell<MuxLog>>,
}

impl ContainerMuxer for MockMuxer {
    fn set_orientation_hint(&mut self, _degrees: u32) {}

    fn set_track_format(
        &mut self,
        kind: TrackKind,
        _format: &TrackFormat,
    ) -> splice_core::Result<()> {
        self.log.borrow_mut().formats.push(kind);
        Ok(())
    }

    fn start(&mut self) -> splice_core::Result<()> {
        self.log.borrow_mut().started = true;
        Ok(())
    }

    fn write_sample_data(
        &mut self,
        kind: TrackKind,
        data: &[u8],
        meta: &BufferMeta,
    ) -> splice_core::Result<()> {
        assert!(self.log.borrow().started, "write before muxer start");
        self.log
            .borrow_mut()
            .writes
            .push((kind, meta.presentation_time_us, data.len()));
        Ok(())
    }

    fn stop(&mut self) -> splice_core::Result<()> {
        self.log.borrow_mut().stopped = true;
        Ok(())
    }

    fn release(&mut self) -> splice_core::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Strategies & harness
// =============================================================================

struct TranscodeBoth;

impl FormatStrategy for TranscodeBoth {
    fn video_output_format(&self, input: &VideoFormat) -> Option<VideoFormat> {
        Some(VideoFormat {
            codec: "h264".into(),
            width: input.width,
            height: input.height,
            frame_rate: input.frame_rate,
            bit_rate: Some(2_000_000),
        })
    }

    fn audio_output_format(&self, _input: &AudioFormat) -> Option<AudioFormat> {
        Some(AudioFormat {
            codec: "aac".into(),
            sample_rate: SAMPLE_RATE,
            channel_count: 1,
            bit_rate: Some(128_000),
        })
    }
}

struct AudioPassThrough;

impl FormatStrategy for AudioPassThrough {
    fn video_output_format(&self, input: &VideoFormat) -> Option<VideoFormat> {
        TranscodeBoth.video_output_format(input)
    }

    fn audio_output_format(&self, _input: &AudioFormat) -> Option<AudioFormat> {
        None
    }
}

struct Harness {
    engine: Engine,
    collaborators: Collaborators,
    mux_log: Rc<RefCell<MuxLog>>,
    draw_log: Rc<RefCell<DrawLog>>,
}

fn harness(stall_audio_decoder: bool, config: EngineConfig) -> Harness {
    let bus = Rc::new(RefCell::new(SurfaceBus::default()));
    let mux_log = Rc::new(RefCell::new(MuxLog::default()));
    let draw_log = Rc::new(RefCell::new(DrawLog::default()));
    Harness {
        engine: Engine::new(config),
        collaborators: Collaborators {
            codecs: Box::new(MockCodecs {
                bus: bus.clone(),
                stall_audio_decoder,
            }),
            compositor: Box::new(MockCompositor::new(bus, draw_log.clone())),
            muxer: Box::new(MockMuxer {
                log: mux_log.clone(),
            }),
        },
        mux_log,
        draw_log,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        idle_sleep_ms: 1,
        ..EngineConfig::default()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_single_channel_single_segment() {
    let mut timeline = Timeline::new();
    timeline
        .add_channel(
            "movie",
            Arc::new(MockSource {
                spec: MediaSpec::audio_video(1_000_000),
            }),
        )
        .unwrap();
    timeline.create_segment().unwrap().output("movie").unwrap();

    let Harness {
        mut engine,
        collaborators,
        mux_log,
        ..
    } = harness(false, fast_config());
    let progress = engine.progress_handle();
    let stats = engine
        .transcode(&mut timeline, collaborators, &TranscodeBoth)
        .unwrap();

    assert_eq!(progress.outcome(), Some(TranscodeOutcome::Completed));
    assert_eq!(progress.progress(), 1.0);
    assert_eq!(stats.segments_completed, 1);

    let log = mux_log.borrow();
    assert!(log.started);
    assert!(log.stopped);
    assert_eq!(log.formats.len(), 2);

    // Video timestamps strictly increasing, none repeated, spanning the
    // whole source.
    let video: Vec<i64> = log
        .writes
        .iter()
        .filter(|(kind, _, _)| *kind == TrackKind::Video)
        .map(|(_, presentation_us, _)| *presentation_us)
        .collect();
    assert_eq!(video.len(), 40);
    assert!(video.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(video[0], 0);
    assert_eq!(*video.last().unwrap(), 975_000);

    // Audio timestamps monotonically increasing, covering the source.
    let audio: Vec<i64> = log
        .writes
        .iter()
        .filter(|(kind, _, _)| *kind == TrackKind::Audio)
        .map(|(_, presentation_us, _)| *presentation_us)
        .collect();
    assert!(!audio.is_empty());
    assert!(audio.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(audio[0], 0);
    assert_eq!(*audio.last().unwrap(), 990_000);
}

#[test]
fn test_crossfade_timeline() {
    let mut timeline = Timeline::new();
    timeline
        .add_channel(
            "a",
            Arc::new(MockSource {
                spec: MediaSpec::audio_video(2_000_000),
            }),
        )
        .unwrap();
    timeline
        .add_channel(
            "b",
            Arc::new(MockSource {
                spec: MediaSpec {
                    pcm_value: -2_000,
                    ..MediaSpec::audio_video(2_000_000)
                },
            }),
        )
        .unwrap();

    timeline
        .create_segment()
        .unwrap()
        .output("a")
        .unwrap()
        .duration(1_000_000);
    timeline
        .create_segment()
        .unwrap()
        .output_filtered("a", Filter::RampDown { duration_us: 500_000 })
        .unwrap()
        .output_filtered("b", Filter::RampUp { duration_us: 500_000 })
        .unwrap()
        .duration(500_000);
    timeline
        .create_segment()
        .unwrap()
        .output("b")
        .unwrap()
        .duration(500_000);

    assert_eq!(timeline.total_duration_us(), Some(2_000_000));

    let Harness {
        mut engine,
        collaborators,
        mux_log,
        draw_log,
    } = harness(false, fast_config());
    let progress = engine.progress_handle();
    let stats = engine
        .transcode(&mut timeline, collaborators, &TranscodeBoth)
        .unwrap();

    assert_eq!(progress.outcome(), Some(TranscodeOutcome::Completed));
    assert_eq!(stats.segments_completed, 3);

    // 2s of output at 25ms per frame.
    let log = mux_log.borrow();
    let video: Vec<i64> = log
        .writes
        .iter()
        .filter(|(kind, _, _)| *kind == TrackKind::Video)
        .map(|(_, presentation_us, _)| *presentation_us)
        .collect();
    assert_eq!(video.len(), 80);
    assert!(video.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*video.last().unwrap(), 1_975_000);

    // At the crossfade midpoint both channels blend at half opacity:
    // channel "a" (surface 0) fades out, channel "b" (surface 1) fades in.
    let draws = draw_log.borrow();
    let midpoint = draws
        .draws
        .iter()
        .find(|(presentation_us, _)| *presentation_us == 1_250_000)
        .expect("midpoint frame composed");
    let alpha_of = |surface: u64| {
        midpoint
            .1
            .iter()
            .find(|(id, _)| *id == SurfaceId(surface))
            .map(|(_, alpha)| *alpha)
            .expect("surface present")
    };
    assert!((alpha_of(0) - 0.5).abs() < 1e-6);
    assert!((alpha_of(1) - 0.5).abs() < 1e-6);

    // Fade endpoints.
    let start = draws
        .draws
        .iter()
        .find(|(presentation_us, _)| *presentation_us == 1_000_000)
        .expect("crossfade start composed");
    let start_alpha_b = start
        .1
        .iter()
        .find(|(id, _)| *id == SurfaceId(1))
        .map(|(_, alpha)| *alpha)
        .unwrap();
    assert!(start_alpha_b < 0.05);
}

#[test]
fn test_frame_accurate_seek() {
    let mut timeline = Timeline::new();
    timeline
        .add_channel(
            "movie",
            Arc::new(MockSource {
                spec: MediaSpec::audio_video(1_000_000),
            }),
        )
        .unwrap();
    // 30ms requested; rounds down to one whole 25ms frame.
    timeline
        .create_segment()
        .unwrap()
        .output("movie")
        .unwrap()
        .seek("movie", 30_000)
        .unwrap();

    let Harness {
        mut engine,
        collaborators,
        mux_log,
        ..
    } = harness(false, fast_config());
    let stats = engine
        .transcode(&mut timeline, collaborators, &TranscodeBoth)
        .unwrap();
    assert_eq!(stats.segments_completed, 1);

    let log = mux_log.borrow();
    let video: Vec<i64> = log
        .writes
        .iter()
        .filter(|(kind, _, _)| *kind == TrackKind::Video)
        .map(|(_, presentation_us, _)| *presentation_us)
        .collect();
    // Pre-roll frames before the seek point are decoded but never rendered;
    // output starts at zero and spans source duration minus the seek.
    assert_eq!(video[0], 0);
    assert_eq!(video.len(), 39);
    assert_eq!(*video.last().unwrap(), 950_000);

    let audio: Vec<i64> = log
        .writes
        .iter()
        .filter(|(kind, _, _)| *kind == TrackKind::Audio)
        .map(|(_, presentation_us, _)| *presentation_us)
        .collect();
    assert_eq!(audio[0], 0);
    assert!(audio.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_audio_passthrough_track() {
    let mut timeline = Timeline::new();
    timeline
        .add_channel(
            "movie",
            Arc::new(MockSource {
                spec: MediaSpec::audio_video(500_000),
            }),
        )
        .unwrap();
    timeline.create_segment().unwrap().output("movie").unwrap();

    let Harness {
        mut engine,
        collaborators,
        mux_log,
        ..
    } = harness(false, fast_config());
    let stats = engine
        .transcode(&mut timeline, collaborators, &AudioPassThrough)
        .unwrap();
    assert_eq!(stats.segments_completed, 1);

    let log = mux_log.borrow();
    // 50 source chunks copied byte for byte.
    let audio: Vec<(i64, usize)> = log
        .writes
        .iter()
        .filter(|(kind, _, _)| *kind == TrackKind::Audio)
        .map(|(_, presentation_us, size)| (*presentation_us, *size))
        .collect();
    assert_eq!(audio.len(), 50);
    assert!(audio.iter().all(|(_, size)| *size == 960));
    assert_eq!(audio[0].0, 0);
    assert_eq!(audio.last().unwrap().0, 490_000);
}

#[test]
fn test_stalled_pipeline_is_canceled_within_limit() {
    let mut timeline = Timeline::new();
    timeline
        .add_channel(
            "movie",
            Arc::new(MockSource {
                spec: MediaSpec::audio_video(500_000),
            }),
        )
        .unwrap();
    timeline.create_segment().unwrap().output("movie").unwrap();

    let config = EngineConfig {
        idle_sleep_ms: 1,
        throttle: ThrottleConfig {
            lead_window_us: 100_000,
            max_blocked_ms: 100,
        },
        ..EngineConfig::default()
    };
    let Harness {
        mut engine,
        collaborators,
        ..
    } = harness(true, config);
    let progress = engine.progress_handle();

    let started = Instant::now();
    let err = engine
        .transcode(&mut timeline, collaborators, &TranscodeBoth)
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, EngineError::Stalled(_)));
    assert_eq!(progress.outcome(), Some(TranscodeOutcome::Canceled));
    // Not sooner than the configured limit, not indefinitely later.
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(10));
}
