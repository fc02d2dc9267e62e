//! Background jobs
//!
//! Three loops run for the lifetime of the process: the catalog refresh,
//! the guide refresh, and a watchdog that reaps leases and sessions whose
//! owners went away without cleaning up.

pub mod progress;
pub mod refresh;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::pool::MacPoolManager;
use crate::session::SessionBroker;

pub use progress::{ProgressTracker, RefreshProgress};
pub use refresh::RefreshService;

/// Spawn the periodic loops. The first catalog and guide refresh are run
/// inline by the caller before serving, so every loop skips its immediate
/// first tick.
pub fn spawn_background_jobs(
    config: Arc<Config>,
    service: Arc<RefreshService>,
    pool: Arc<MacPoolManager>,
    broker: Arc<SessionBroker>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let catalog_service = Arc::clone(&service);
    let catalog_interval = config.catalog_interval();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(catalog_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            catalog_service.refresh_catalog().await;
        }
    }));

    let epg_service = Arc::clone(&service);
    let epg_interval = config.epg_interval();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(epg_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            epg_service.refresh_epg().await;
        }
    }));

    let watchdog_interval = config.watchdog_interval();
    let liveness_timeout = config.liveness_timeout();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(watchdog_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let leases = pool.force_release_stale(liveness_timeout);
            let sessions = broker.prune_stale();
            if leases > 0 || sessions > 0 {
                info!(leases, sessions, "watchdog reaped stale holders");
            } else {
                debug!("watchdog pass clean");
            }
        }
    }));

    handles
}
