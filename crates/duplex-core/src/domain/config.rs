//! Session configuration.
//!
//! Immutable once a session starts. Every field has a default so partial
//! TOML files deserialize cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::CallError;
use super::media::MediaKind;
use super::peer::{IceServer, RtcConfiguration};

/// Bounds and tuning for one media kind's bitrate control loop.
///
/// A `[audio]` / `[video]` table must be complete; omit it to keep the
/// per-kind defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitrateConfig {
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub start_bitrate: u32,
    /// Fractional increase, e.g. 0.15 = +15%.
    pub step_up: f64,
    pub step_down: f64,
    pub step_critical_down: f64,
    /// Loss at or below which bitrate may grow.
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
    /// Minimum time between two regular adjustments.
    pub cooldown_secs: f64,
}

impl BitrateConfig {
    pub fn audio() -> Self {
        Self {
            min_bitrate: 16_000,
            max_bitrate: 128_000,
            start_bitrate: 32_000,
            step_up: 0.10,
            step_down: 0.15,
            step_critical_down: 0.25,
            low_threshold: 0.02,
            high_threshold: 0.05,
            critical_threshold: 0.10,
            cooldown_secs: 10.0,
        }
    }

    pub fn video() -> Self {
        Self {
            min_bitrate: 100_000,
            max_bitrate: 6_000_000,
            start_bitrate: 1_000_000,
            step_up: 0.15,
            step_down: 0.15,
            step_critical_down: 0.25,
            low_threshold: 0.02,
            high_threshold: 0.05,
            critical_threshold: 0.10,
            cooldown_secs: 10.0,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs)
    }

    pub fn validate(&self, kind: MediaKind) -> Result<(), CallError> {
        let fail = |msg: &str| Err(CallError::InvalidConfig(format!("{kind}: {msg}")));
        if self.min_bitrate == 0 || self.min_bitrate > self.max_bitrate {
            return fail("min_bitrate must be > 0 and <= max_bitrate");
        }
        if !(self.min_bitrate..=self.max_bitrate).contains(&self.start_bitrate) {
            return fail("start_bitrate must lie within [min_bitrate, max_bitrate]");
        }
        for step in [self.step_up, self.step_down, self.step_critical_down] {
            if !(0.0..1.0).contains(&step) {
                return fail("steps must lie within [0, 1)");
            }
        }
        if !(self.low_threshold <= self.high_threshold
            && self.high_threshold <= self.critical_threshold
            && self.critical_threshold <= 1.0)
        {
            return fail("thresholds must satisfy low <= high <= critical <= 1");
        }
        if !self.cooldown_secs.is_finite() || self.cooldown_secs < 0.0 {
            return fail("cooldown_secs must be a non-negative number");
        }
        Ok(())
    }
}

/// Everything a call session needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
    /// Time allowed in Connecting before the call is torn down.
    pub connection_timeout_secs: u64,
    pub audio: BitrateConfig,
    pub video: BitrateConfig,
    /// Capture width used for resolution downscaling.
    pub video_source_width: u32,
    /// Loss samples retained per media kind.
    pub network_history: usize,
    pub fast_loop_ms: u64,
    pub slow_loop_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            }],
            connection_timeout_secs: 30,
            audio: BitrateConfig::audio(),
            video: BitrateConfig::video(),
            video_source_width: 1280,
            network_history: 10,
            fast_loop_ms: 1_000,
            slow_loop_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn rtc_configuration(&self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: self.ice_servers.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), CallError> {
        self.audio.validate(MediaKind::Audio)?;
        self.video.validate(MediaKind::Video)?;
        if self.connection_timeout_secs == 0 {
            return Err(CallError::InvalidConfig(
                "connection_timeout_secs must be > 0".into(),
            ));
        }
        if self.network_history < 2 {
            return Err(CallError::InvalidConfig(
                "network_history must keep at least 2 samples".into(),
            ));
        }
        if self.fast_loop_ms == 0 || self.slow_loop_ms == 0 {
            return Err(CallError::InvalidConfig("loop periods must be > 0".into()));
        }
        if self.video_source_width == 0 {
            return Err(CallError::InvalidConfig("video_source_width must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: SessionConfig = toml::from_str(
            r#"
            connection_timeout_secs = 12
            video_source_width = 1920
            "#,
        )
        .unwrap();
        assert_eq!(cfg.connection_timeout_secs, 12);
        assert_eq!(cfg.video_source_width, 1920);
        assert_eq!(cfg.video, BitrateConfig::video());
        assert_eq!(cfg.audio, BitrateConfig::audio());
        assert_eq!(cfg.network_history, 10);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut cfg = SessionConfig::default();
        cfg.audio.min_bitrate = 200_000;
        assert!(matches!(cfg.validate(), Err(CallError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut cfg = SessionConfig::default();
        cfg.video.high_threshold = 0.5;
        assert!(cfg.validate().is_err());
    }
}
