//! Periodic refresh trigger.
//!
//! Refreshes once on start and then every `interval`. A tick that lands
//! while a cycle is still running joins it instead of queueing another.
//! Stops when the coordinator shuts down.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use super::DiscoveryCoordinator;
use crate::error::DiscoveryError;

/// Run the poller on its own task.
pub fn spawn_poller(coordinator: &DiscoveryCoordinator, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(run_poller(coordinator.clone(), interval))
}

pub async fn run_poller(coordinator: DiscoveryCoordinator, interval: Duration) {
    let shutdown = coordinator.shutdown_token();

    info!(
        interval_secs = interval.as_secs(),
        "📡 Discovery poller starting, initial refresh..."
    );
    if !refresh_once(&coordinator).await {
        return;
    }

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip the immediate tick (we already ran)

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !refresh_once(&coordinator).await {
            break;
        }
    }

    info!("📡 Discovery poller stopped");
}

/// One scheduled refresh. False once the coordinator is shut down.
async fn refresh_once(coordinator: &DiscoveryCoordinator) -> bool {
    match coordinator.refresh().await {
        Ok(snapshot) => {
            info!(
                cycle_id = snapshot.cycle_id,
                endpoints = snapshot.len(),
                "Scheduled refresh complete"
            );
            true
        }
        Err(DiscoveryError::Cancelled) => false,
        Err(e) => {
            warn!(error = %e, "Scheduled refresh failed");
            true
        }
    }
}
