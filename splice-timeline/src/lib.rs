//! # Splice Timeline
//!
//! The timeline data model for the Splice transcoding engine.
//!
//! A [`Timeline`] wires named input channels to an ordered list of
//! [`Segment`]s. Each segment references a subset of the channels, optionally
//! with a per-channel seek and an opacity [`Filter`], and either a fixed
//! duration or (last segment only) an open-ended one. Before a segment
//! becomes active the engine calls [`Timeline::start_segment`], which
//! translates the segment-relative seeks and durations into absolute input
//! and output time coordinates on the channel records, including
//! frame-accurate seek rounding with carried remainders and independent
//! audio/video input-to-output offsets.

mod channel;
mod error;
mod filter;
mod segment;
mod timeline;

pub use channel::{ChannelArena, ChannelId, ChannelKind, InputChannel};
pub use error::{Result, TimelineError};
pub use filter::Filter;
pub use segment::{Segment, SegmentBuilder, SegmentChannel};
pub use timeline::Timeline;
