//! # Splice Core
//!
//! Core types and collaborator interfaces for the Splice transcoding engine.
//!
//! This crate provides the building blocks shared by the timeline model and
//! the transcoding engine:
//! - Error handling types
//! - Track and media format descriptors
//! - Microsecond time helpers
//! - The trait boundary to platform collaborators (extractors, codec
//!   sessions, the frame compositor, and the container muxer)

pub mod codec;
pub mod error;
pub mod format;
pub mod source;
pub mod strategy;
pub mod time;

pub use codec::{
    BufferFlags, BufferMeta, CodecProvider, ContainerMuxer, Decoder, DequeueEvent, Encoder,
    Extractor, FrameCompositor, SurfaceId,
};
pub use error::{CoreError, Result};
pub use format::{AudioFormat, TrackFormat, TrackKind, VideoFormat};
pub use source::{MediaSource, SourceMetadata};
pub use strategy::FormatStrategy;
pub use time::MICROS_PER_SECOND;
