//! Session wiring: configuration loading and adapter assembly.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use duplex_core::adapters::loopback::peer_connection::LoopbackPeerConnectionFactory;
use duplex_core::adapters::path_monitor::ManualPathMonitor;
use duplex_core::adapters::quic::client::QuicSignalingChannel;
use duplex_core::adapters::signal_codec::CborSignalCodec;
use duplex_core::application::ports::{CallEvents, NetworkPathMonitor};
use duplex_core::{CallManager, EngineDeps, SessionConfig};

/// Read a TOML session config; missing file argument means defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: SessionConfig =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Everything one CLI run keeps alive.
pub struct CliSession {
    pub manager: CallManager,
    pub factory: Arc<LoopbackPeerConnectionFactory>,
    pub path: Arc<ManualPathMonitor>,
    _events: Arc<dyn CallEvents>,
}

impl CliSession {
    pub fn build(
        config: SessionConfig,
        relay: SocketAddr,
        events: Arc<dyn CallEvents>,
    ) -> anyhow::Result<Self> {
        let factory = Arc::new(LoopbackPeerConnectionFactory::new(true));
        let path = Arc::new(ManualPathMonitor::new());
        let monitor: Arc<dyn NetworkPathMonitor> = path.clone();
        let manager = CallManager::spawn(
            config,
            EngineDeps {
                factory: factory.clone(),
                signaling: Arc::new(QuicSignalingChannel::new(relay, "localhost")),
                codec: Arc::new(CborSignalCodec),
            },
            &events,
            Some(monitor),
        )?;
        Ok(Self {
            manager,
            factory,
            path,
            _events: events,
        })
    }

    /// Apply simulated loss to the current call's connection, if any.
    pub fn set_loss(&self, loss: f64) {
        if let Some(pc) = self.factory.last_created() {
            pc.set_simulated_loss(loss);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_gives_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn reads_partial_file() {
        let dir = std::env::temp_dir().join(format!("duplex-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("session.toml");
        std::fs::write(&file, "connection_timeout_secs = 5\n").unwrap();

        let config = load_config(Some(&file)).unwrap();
        assert_eq!(config.connection_timeout_secs, 5);
        assert_eq!(config.video, SessionConfig::default().video);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
