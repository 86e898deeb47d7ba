//! [`NetworkPathMonitor`] driven by hand.

use tokio::sync::watch;

use crate::application::ports::{NetworkPathMonitor, PathStatus};

/// Reports whatever status was last [`set`](Self::set). Starts satisfied.
#[derive(Debug)]
pub struct ManualPathMonitor {
    tx: watch::Sender<PathStatus>,
}

impl ManualPathMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PathStatus::Satisfied);
        Self { tx }
    }

    pub fn set(&self, status: PathStatus) {
        self.tx.send_replace(status);
    }
}

impl Default for ManualPathMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkPathMonitor for ManualPathMonitor {
    fn subscribe(&self) -> watch::Receiver<PathStatus> {
        self.tx.subscribe()
    }
}
