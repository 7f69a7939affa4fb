//! Per-channel filters.

use serde::{Deserialize, Serialize};

/// A filter applied to one channel for the duration of one segment.
///
/// Ramps fade a video channel's opacity linearly over their declared
/// duration, measured from the segment's output start. `Mute` silences a
/// channel's audio contribution; `Suppress` removes a channel's video
/// contribution entirely while its decoder keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Fade opacity from 0 to 1 over `duration_us`.
    RampUp { duration_us: i64 },
    /// Fade opacity from 1 to 0 over `duration_us`.
    RampDown { duration_us: i64 },
    /// Silence the channel's audio.
    Mute,
    /// Force the channel's video opacity to zero.
    Suppress,
}

impl Filter {
    /// Video opacity at `elapsed_us` since the segment's output start.
    pub fn alpha_at(&self, elapsed_us: i64) -> f32 {
        match *self {
            Self::RampUp { duration_us } => ramp_fraction(elapsed_us, duration_us),
            Self::RampDown { duration_us } => 1.0 - ramp_fraction(elapsed_us, duration_us),
            Self::Mute => 1.0,
            Self::Suppress => 0.0,
        }
    }

    /// Whether this filter removes the channel's audio contribution.
    pub fn silences_audio(&self) -> bool {
        matches!(self, Self::Mute | Self::Suppress)
    }

    /// Whether this filter is a fade-in.
    pub fn is_ramp_up(&self) -> bool {
        matches!(self, Self::RampUp { .. })
    }

    /// Whether this filter is a fade-out.
    pub fn is_ramp_down(&self) -> bool {
        matches!(self, Self::RampDown { .. })
    }
}

fn ramp_fraction(elapsed_us: i64, duration_us: i64) -> f32 {
    if duration_us <= 0 {
        return 1.0;
    }
    (elapsed_us as f64 / duration_us as f64).clamp(0.0, 1.0) as f32
}
