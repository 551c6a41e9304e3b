//! Periodic staleness eviction.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::DispatchService;

/// Background task calling [`DispatchService::evict_stale`] on an interval.
pub struct StaleSweeper {
    handle: JoinHandle<()>,
}

impl StaleSweeper {
    pub fn spawn(service: Arc<DispatchService>, every: Duration) -> Self {
        let every = every.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match service.evict_stale().await {
                    Ok(0) => debug!("[Sweeper] Nothing stale"),
                    Ok(n) => debug!("[Sweeper] Swept {} agents", n),
                    Err(e) => warn!("[Sweeper] Sweep failed, retrying next tick: {}", e),
                }
            }
        });
        info!("🧹 [Sweeper] Evicting stale agents every {:?}", every);
        StaleSweeper { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for StaleSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
