//! Cross-track pacing.
//!
//! The governor keeps any one channel's decode pipeline from running far
//! ahead of the slowest participant, which would otherwise exhaust encoder
//! buffer pools or desynchronize the audio and video presentation clocks. It
//! is cooperative and advisory: a channel whose presentation time has run
//! past the threshold simply declines to consume further buffers until the
//! others catch up. It never sleeps or blocks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use splice_core::TrackKind;

use crate::error::{EngineError, Result};

/// Pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// How far past the slowest participant any channel may run, in
    /// microseconds.
    pub lead_window_us: i64,
    /// Maximum continuous no-progress time before the transcode is aborted,
    /// in milliseconds.
    pub max_blocked_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            lead_window_us: 100_000,
            max_blocked_ms: 5_000,
        }
    }
}

impl ThrottleConfig {
    /// The stall limit as a [`Duration`].
    pub fn max_blocked(&self) -> Duration {
        Duration::from_millis(self.max_blocked_ms)
    }
}

/// Identifies one channel within one track pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub track: TrackKind,
    pub channel: String,
}

impl ThrottleKey {
    /// Build a key for a track/channel pair.
    pub fn new(track: TrackKind, channel: &str) -> Self {
        Self {
            track,
            channel: channel.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Report {
    /// Not yet heard from this round.
    Pending,
    /// Reported a presentation position.
    At(i64),
    /// Reported end of stream; excluded from the pacing minimum.
    EndOfStream,
}

/// The cross-track pacing and stall-cancellation governor.
pub struct ThrottleGovernor {
    config: ThrottleConfig,
    participants: HashMap<ThrottleKey, Report>,
    threshold_us: i64,
    blocked_since: Option<Instant>,
}

impl ThrottleGovernor {
    /// Create a governor with the given configuration.
    pub fn new(config: ThrottleConfig) -> Self {
        let threshold_us = config.lead_window_us;
        Self {
            config,
            participants: HashMap::new(),
            threshold_us,
            blocked_since: None,
        }
    }

    /// Reset per-segment state: participants re-register, the first lead
    /// window's worth of buffers may flow immediately.
    pub fn start_segment(&mut self) {
        self.participants.clear();
        self.threshold_us = self.config.lead_window_us;
        self.blocked_since = None;
    }

    /// Register a channel as relevant for this segment's pacing.
    pub fn participate(&mut self, key: ThrottleKey) {
        self.participants.entry(key).or_insert(Report::Pending);
    }

    /// The current presentation-time ceiling.
    pub fn threshold_us(&self) -> i64 {
        self.threshold_us
    }

    /// Record `key`'s position and decide whether it may consume the buffer
    /// at `presentation_us`. End-of-stream channels always proceed and stop
    /// influencing the minimum.
    pub fn can_proceed(&mut self, key: &ThrottleKey, presentation_us: i64, is_end_of_stream: bool) -> bool {
        let report = if is_end_of_stream {
            Report::EndOfStream
        } else {
            Report::At(presentation_us)
        };
        if let Some(entry) = self.participants.get_mut(key) {
            // End of stream is terminal for the segment.
            if *entry != Report::EndOfStream {
                *entry = report;
            }
        } else {
            self.participants.insert(key.clone(), report);
        }

        if is_end_of_stream {
            return true;
        }
        let allowed = presentation_us <= self.threshold_us;
        trace!(
            ?key,
            presentation_us,
            threshold_us = self.threshold_us,
            allowed,
            "throttle decision"
        );
        allowed
    }

    /// Advance the round: once every participant has reported, the threshold
    /// becomes the minimum reported position plus the lead window. Tracks
    /// no-progress time and aborts past the configured maximum.
    pub fn step(&mut self, progressed: bool) -> Result<()> {
        let all_reported = self
            .participants
            .values()
            .all(|r| !matches!(r, Report::Pending));
        if all_reported && !self.participants.is_empty() {
            let minimum = self
                .participants
                .values()
                .filter_map(|r| match r {
                    Report::At(position) => Some(*position),
                    _ => None,
                })
                .min();
            if let Some(minimum) = minimum {
                self.threshold_us = minimum + self.config.lead_window_us;
            }
            for report in self.participants.values_mut() {
                if *report != Report::EndOfStream {
                    *report = Report::Pending;
                }
            }
            debug!(threshold_us = self.threshold_us, "throttle round complete");
        }

        if progressed {
            self.blocked_since = None;
        } else {
            let since = *self.blocked_since.get_or_insert_with(Instant::now);
            if since.elapsed() > self.config.max_blocked() {
                return Err(EngineError::Stalled(self.config.max_blocked()));
            }
        }
        Ok(())
    }
}
