//! Media-plane value types: kinds, transport counters, sender encodings.
//!
//! Pure data, no I/O.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Media kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    /// Default local track identifier for this kind.
    pub fn track_id(self) -> &'static str {
        match self {
            Self::Audio => "audio0",
            Self::Video => "video0",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport counters
// ---------------------------------------------------------------------------

/// Cumulative outbound counters for one media kind, as reported by the
/// transport's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_lost: u64,
}

/// One sample in the rolling loss history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDataPoint {
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub timestamp: Instant,
}

impl NetworkDataPoint {
    pub fn new(stats: TransportStats, timestamp: Instant) -> Self {
        Self {
            packets_sent: stats.packets_sent,
            packets_lost: stats.packets_lost,
            timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Sender encoding parameters
// ---------------------------------------------------------------------------

/// Outbound encoding knobs of one sender (`RTCRtpEncodingParameters` subset).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncodingParameters {
    pub min_bitrate_bps: Option<u32>,
    pub max_bitrate_bps: Option<u32>,
    pub scale_resolution_down_by: Option<f64>,
    pub max_framerate: Option<u32>,
}
