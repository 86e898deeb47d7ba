//! Cooldown gate between two bitrate adjustments of one media kind.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct AdjustmentTracker {
    interval: Duration,
    last_adjustment: Option<Instant>,
}

impl AdjustmentTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_adjustment: None,
        }
    }

    /// True once `interval` has elapsed since the last recorded adjustment.
    pub fn can_adjust(&self, now: Instant) -> bool {
        match self.last_adjustment {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn track_adjustment(&mut self, now: Instant) {
        self.last_adjustment = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_adjustment = None;
    }
}
