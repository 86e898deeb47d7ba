//! Rolling window of outbound packet counters for one media kind.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::media::NetworkDataPoint;

/// Default number of retained samples.
pub const DEFAULT_CAPACITY: usize = 10;

/// Slack added to the requested window so a sample taken a little late
/// still counts as "N seconds ago".
pub const WINDOW_TOLERANCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct NetworkDataCache {
    samples: VecDeque<NetworkDataPoint>,
    capacity: usize,
}

impl NetworkDataCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    pub fn push(&mut self, point: NetworkDataPoint) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Loss rate over the last `window`, measured against `now`.
    ///
    /// Returns `None` when the history cannot cover the window; the caller
    /// skips its adjustment for this cycle.
    pub fn packet_loss_rate(&self, window: Duration, now: Instant) -> Option<f64> {
        let newest_idx = self.samples.len().checked_sub(1)?;
        let newest = &self.samples[newest_idx];
        let horizon = window + WINDOW_TOLERANCE;

        let oldest_idx = self
            .samples
            .iter()
            .position(|p| now.saturating_duration_since(p.timestamp) <= horizon)?;

        let baseline = if oldest_idx == newest_idx {
            // Only the newest sample is recent enough: compare against the one
            // before it.
            self.samples.get(newest_idx.checked_sub(1)?)?
        } else {
            &self.samples[oldest_idx]
        };

        Some(loss_between(baseline, newest))
    }
}

impl Default for NetworkDataCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// `lost / (sent + lost)` over the delta between two samples. No sent packets
/// counts as total loss.
fn loss_between(from: &NetworkDataPoint, to: &NetworkDataPoint) -> f64 {
    let sent = to.packets_sent.saturating_sub(from.packets_sent);
    let lost = to.packets_lost.saturating_sub(from.packets_lost);
    if sent == 0 {
        return 1.0;
    }
    lost as f64 / (sent + lost) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::media::TransportStats;

    fn point(sent: u64, lost: u64, at: Instant) -> NetworkDataPoint {
        NetworkDataPoint::new(
            TransportStats {
                packets_sent: sent,
                packets_lost: lost,
            },
            at,
        )
    }

    #[test]
    fn evicts_oldest_when_full() {
        let t0 = Instant::now();
        let mut cache = NetworkDataCache::new(3);
        for i in 0..5 {
            cache.push(point(i, 0, t0 + Duration::from_secs(i)));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.samples.front().map(|p| p.packets_sent), Some(2));
        assert_eq!(cache.samples.back().map(|p| p.packets_sent), Some(4));
    }

    #[test]
    fn ten_second_window_over_steady_loss() {
        let t0 = Instant::now();
        let mut cache = NetworkDataCache::default();
        for i in 0..=10u64 {
            cache.push(point(100 * i, i, t0 + Duration::from_secs(i)));
        }
        let now = t0 + Duration::from_secs(10);
        let loss = cache.packet_loss_rate(Duration::from_secs(10), now).unwrap();
        assert!((loss - 1.0 / 101.0).abs() < 1e-9, "loss = {loss}");
    }

    #[test]
    fn fewer_than_two_samples_is_unknown() {
        let t0 = Instant::now();
        let mut cache = NetworkDataCache::default();
        assert_eq!(cache.packet_loss_rate(Duration::from_secs(1), t0), None);
        cache.push(point(100, 1, t0));
        assert_eq!(cache.packet_loss_rate(Duration::from_secs(1), t0), None);
    }

    #[test]
    fn stale_history_is_unknown() {
        let t0 = Instant::now();
        let mut cache = NetworkDataCache::default();
        cache.push(point(0, 0, t0));
        cache.push(point(100, 0, t0 + Duration::from_secs(1)));
        let later = t0 + Duration::from_secs(30);
        assert_eq!(cache.packet_loss_rate(Duration::from_secs(10), later), None);
    }

    #[test]
    fn falls_back_to_previous_sample_when_only_newest_qualifies() {
        let t0 = Instant::now();
        let mut cache = NetworkDataCache::default();
        cache.push(point(0, 0, t0));
        cache.push(point(90, 10, t0 + Duration::from_secs(5)));
        let now = t0 + Duration::from_secs(5);
        let loss = cache.packet_loss_rate(Duration::from_secs(1), now).unwrap();
        assert!((loss - 0.1).abs() < 1e-9);
    }

    #[test]
    fn nothing_sent_counts_as_total_loss() {
        let t0 = Instant::now();
        let mut cache = NetworkDataCache::default();
        cache.push(point(50, 0, t0));
        cache.push(point(50, 0, t0 + Duration::from_secs(1)));
        let loss = cache
            .packet_loss_rate(Duration::from_secs(1), t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(loss, 1.0);
    }
}
