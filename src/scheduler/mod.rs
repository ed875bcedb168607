//! Background maintenance: retention cleanup and liveness sweeps.

mod lifecycle;
mod liveness;
mod retention;

pub use lifecycle::*;
pub use liveness::*;
pub use retention::*;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;

/// Owns the two long-lived loops.
pub struct Scheduler {
    cleanup_loop: BackgroundLoop,
    liveness_loop: BackgroundLoop,
    retention: Arc<RetentionSweep>,
    monitor: Arc<LivenessMonitor>,
}

impl Scheduler {
    pub fn new(config: &ServerConfig, cleanup: CleanupEngine, monitor: LivenessMonitor) -> Self {
        Self {
            cleanup_loop: BackgroundLoop::new("Cleanup", config.cleanup_interval()),
            liveness_loop: BackgroundLoop::new("Liveness", config.liveness_interval()),
            retention: Arc::new(RetentionSweep::new(cleanup, config.retention_days)),
            monitor: Arc::new(monitor),
        }
    }

    /// Start both loops as children of `root`.
    pub fn start(&self, root: &CancellationToken) -> Result<()> {
        self.cleanup_loop.start(root, self.retention.clone())?;
        self.liveness_loop.start(root, self.monitor.clone())?;
        Ok(())
    }

    /// Stop both loops, waiting for in-flight iterations.
    pub async fn stop(&self) {
        tokio::join!(self.cleanup_loop.stop(), self.liveness_loop.stop());
    }

    #[cfg(test)]
    pub fn states(&self) -> (LoopState, LoopState) {
        (self.cleanup_loop.state(), self.liveness_loop.state())
    }
}
