//! Bitrate adaptation: loss-driven control of outbound sender encodings.
//!
//! Two tickers post onto the session queue while at least one media kind is
//! active:
//! 1. Fast loop (1 s): samples transport stats into the [`NetworkDataCache`]
//!    and answers critical loss over the last second immediately, bypassing
//!    the cooldown.
//! 2. Slow loop (5 s): once a kind's [`AdjustmentTracker`] allows it,
//!    increases or decreases bitrate based on loss over the last 10 seconds.
//!
//! For video every change also recomputes the resolution downscale factor.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::config::{BitrateConfig, SessionConfig};
use crate::domain::media::{MediaKind, NetworkDataPoint};

use super::adjustment_tracker::AdjustmentTracker;
use super::network_data::NetworkDataCache;
use super::ports::PeerConnection;
use super::session::{AdjustmentLoop, SessionEvent, SessionQueue};

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Loss window evaluated by the fast loop.
const FAST_WINDOW: Duration = Duration::from_secs(1);
/// Loss window evaluated by the slow loop.
const SLOW_WINDOW: Duration = Duration::from_secs(10);

/// (minimum bitrate, target width) buckets, highest first. Bitrates at or
/// above the first bucket keep the source width.
const WIDTH_BUCKETS: [(u32, u32); 6] = [
    (2_500_000, 720),
    (1_500_000, 540),
    (1_000_000, 480),
    (600_000, 360),
    (350_000, 240),
    (0, 144),
];
const FULL_WIDTH_BITRATE: u32 = 3_500_000;

// ---------------------------------------------------------------------------
// Decision rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increase,
    Decrease,
    CriticalDecrease,
    Maintain,
}

pub fn classify(loss_rate: f64, config: &BitrateConfig) -> Adjustment {
    if loss_rate >= config.critical_threshold {
        Adjustment::CriticalDecrease
    } else if loss_rate >= config.high_threshold {
        Adjustment::Decrease
    } else if loss_rate <= config.low_threshold {
        Adjustment::Increase
    } else {
        Adjustment::Maintain
    }
}

/// Bitrate after applying `adjustment` to `current`, clamped to the config
/// bounds. `None` means nothing executes: Maintain, or a critical decrease on
/// a path that does not handle critical loss.
pub fn next_bitrate(
    current: u32,
    adjustment: Adjustment,
    config: &BitrateConfig,
    handle_critical_loss: bool,
) -> Option<u32> {
    let factor = match adjustment {
        Adjustment::Increase => 1.0 + config.step_up,
        Adjustment::Decrease => 1.0 - config.step_down,
        Adjustment::CriticalDecrease if handle_critical_loss => 1.0 - config.step_critical_down,
        Adjustment::CriticalDecrease | Adjustment::Maintain => return None,
    };
    let scaled = (f64::from(current) * factor).round();
    Some(scaled.clamp(f64::from(config.min_bitrate), f64::from(config.max_bitrate)) as u32)
}

/// Output width the encoder should target at `bitrate`.
pub fn target_width(bitrate: u32, source_width: u32) -> u32 {
    if bitrate >= FULL_WIDTH_BITRATE {
        return source_width;
    }
    WIDTH_BUCKETS
        .iter()
        .find(|(min_bitrate, _)| bitrate >= *min_bitrate)
        .map(|(_, width)| *width)
        .unwrap_or(144)
}

/// `scale_resolution_down_by` for `bitrate`; never upscales.
pub fn resolution_scale(bitrate: u32, source_width: u32) -> f64 {
    let target = target_width(bitrate, source_width);
    (f64::from(source_width) / f64::from(target)).max(1.0)
}

// ---------------------------------------------------------------------------
// Per-kind state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct KindState {
    config: BitrateConfig,
    cache: NetworkDataCache,
    tracker: AdjustmentTracker,
    active: bool,
}

impl KindState {
    fn new(config: &BitrateConfig, history: usize) -> Self {
        Self {
            tracker: AdjustmentTracker::new(config.cooldown()),
            config: config.clone(),
            cache: NetworkDataCache::new(history),
            active: false,
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.cache.clear();
        self.tracker.reset();
    }
}

/// The two tickers; aborted when dropped.
struct LoopTimers {
    fast: JoinHandle<()>,
    slow: JoinHandle<()>,
}

impl Drop for LoopTimers {
    fn drop(&mut self) {
        self.fast.abort();
        self.slow.abort();
    }
}

// ---------------------------------------------------------------------------
// Adjustor
// ---------------------------------------------------------------------------

/// Owned by the negotiation engine; all methods run on the session actor.
pub struct BitrateAdjustor {
    audio: KindState,
    video: KindState,
    source_width: u32,
    fast_period: Duration,
    slow_period: Duration,
    queue: SessionQueue,
    timers: Option<LoopTimers>,
}

impl BitrateAdjustor {
    pub fn new(config: &SessionConfig, queue: SessionQueue) -> Self {
        Self {
            audio: KindState::new(&config.audio, config.network_history),
            video: KindState::new(&config.video, config.network_history),
            source_width: config.video_source_width,
            fast_period: Duration::from_millis(config.fast_loop_ms),
            slow_period: Duration::from_millis(config.slow_loop_ms),
            queue,
            timers: None,
        }
    }

    fn kind(&self, kind: MediaKind) -> &KindState {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    fn kind_mut(&mut self, kind: MediaKind) -> &mut KindState {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    pub fn is_active(&self, kind: MediaKind) -> bool {
        self.kind(kind).active
    }

    pub fn timers_running(&self) -> bool {
        self.timers.is_some()
    }

    /// Activate adjustment for `kind`. Pushes the start bitrate to the sender
    /// and starts the shared tickers if they are not running yet.
    pub fn start(&mut self, kind: MediaKind, pc: &dyn PeerConnection) {
        if self.is_active(kind) {
            return;
        }
        self.kind_mut(kind).active = true;

        let config = self.kind(kind).config.clone();
        if let Some(mut params) = pc.sender_parameters(kind) {
            params.min_bitrate_bps = Some(config.min_bitrate);
            params.max_bitrate_bps = Some(config.start_bitrate);
            if kind == MediaKind::Video {
                params.scale_resolution_down_by =
                    Some(resolution_scale(config.start_bitrate, self.source_width));
            }
            if let Err(e) = pc.set_sender_parameters(kind, params) {
                warn!(%kind, "Failed to apply start bitrate: {e}");
            }
        }
        info!(%kind, start = config.start_bitrate, "Bitrate adjustment started");

        if self.timers.is_none() {
            self.timers = Some(LoopTimers {
                fast: spawn_ticker(self.queue.clone(), self.fast_period, AdjustmentLoop::Fast),
                slow: spawn_ticker(self.queue.clone(), self.slow_period, AdjustmentLoop::Slow),
            });
        }
    }

    /// Deactivate `kind`; the tickers stop once no kind is left.
    pub fn stop(&mut self, kind: MediaKind) {
        if !self.is_active(kind) {
            return;
        }
        self.kind_mut(kind).reset();
        if !self.audio.active && !self.video.active {
            self.timers = None;
        }
        info!(%kind, "Bitrate adjustment stopped");
    }

    pub fn stop_all(&mut self) {
        self.timers = None;
        self.audio.reset();
        self.video.reset();
    }

    pub async fn on_tick(&mut self, which: AdjustmentLoop, pc: &dyn PeerConnection, now: Instant) {
        match which {
            AdjustmentLoop::Fast => self.fast_tick(pc, now).await,
            AdjustmentLoop::Slow => self.slow_tick(pc, now),
        }
    }

    /// Sample stats and react to critical loss over the last second.
    pub async fn fast_tick(&mut self, pc: &dyn PeerConnection, now: Instant) {
        for kind in MediaKind::ALL {
            if !self.is_active(kind) {
                continue;
            }
            let Some(stats) = pc.transport_stats(kind).await else {
                debug!(%kind, "No transport stats this tick");
                continue;
            };
            let state = self.kind_mut(kind);
            state.cache.push(NetworkDataPoint::new(stats, now));

            let Some(loss) = state.cache.packet_loss_rate(FAST_WINDOW, now) else {
                continue;
            };
            if loss >= state.config.critical_threshold {
                warn!(%kind, loss, "Critical packet loss");
                self.apply(kind, Adjustment::CriticalDecrease, true, pc, now);
            }
        }
    }

    /// Regular adjustment over the long window, gated by the cooldown.
    pub fn slow_tick(&mut self, pc: &dyn PeerConnection, now: Instant) {
        for kind in MediaKind::ALL {
            let state = self.kind(kind);
            if !state.active || !state.tracker.can_adjust(now) {
                continue;
            }
            let Some(loss) = state.cache.packet_loss_rate(SLOW_WINDOW, now) else {
                debug!(%kind, "Not enough loss history");
                continue;
            };
            let adjustment = classify(loss, &state.config);
            debug!(%kind, loss, ?adjustment, "Slow loop decision");
            self.apply(kind, adjustment, false, pc, now);
        }
    }

    /// Execute one decision; returns the new bitrate when the sender changed.
    fn apply(
        &mut self,
        kind: MediaKind,
        adjustment: Adjustment,
        handle_critical_loss: bool,
        pc: &dyn PeerConnection,
        now: Instant,
    ) -> Option<u32> {
        let source_width = self.source_width;
        let state = self.kind_mut(kind);

        let Some(mut params) = pc.sender_parameters(kind) else {
            debug!(%kind, "No sender to adjust");
            return None;
        };
        let current = params.max_bitrate_bps.unwrap_or(state.config.start_bitrate);
        let target = next_bitrate(current, adjustment, &state.config, handle_critical_loss)?;
        if target == current {
            return None;
        }

        params.min_bitrate_bps = Some(state.config.min_bitrate);
        params.max_bitrate_bps = Some(target);
        if kind == MediaKind::Video {
            params.scale_resolution_down_by = Some(resolution_scale(target, source_width));
        }
        if let Err(e) = pc.set_sender_parameters(kind, params) {
            warn!(%kind, "Failed to update sender parameters: {e}");
            return None;
        }

        state.tracker.track_adjustment(now);
        info!(%kind, from = current, to = target, ?adjustment, "Bitrate target updated");
        Some(target)
    }
}

fn spawn_ticker(queue: SessionQueue, period: Duration, which: AdjustmentLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if queue.send(SessionEvent::BitrateTick(which)).is_err() {
                break;
            }
        }
    })
}
