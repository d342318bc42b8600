//! Telemetry ingest: driver tap into the trajectory store.
//!
//! Persistence appends are best-effort; failures bump a health counter
//! and never surface to the fleet path.

use crate::state::Core;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

const PRUNE_INTERVAL_SECS: u64 = 60;

pub async fn run_telemetry_loop(core: Arc<Core>, mut shutdown: broadcast::Receiver<()>) {
    let mut tap = core.driver.telemetry_tap();
    let mut prune_tick = interval(Duration::from_secs(PRUNE_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Telemetry loop shutting down");
                break;
            }
            _ = prune_tick.tick() => {
                let removed = core.store.prune(core.clock.now());
                if removed > 0 {
                    tracing::debug!("Pruned {} expired trajectory samples", removed);
                }
            }
            received = tap.recv() => {
                match received {
                    Ok(sample) => {
                        if core.store.append(sample.clone()) {
                            if let Err(err) = core.persistence.append_trajectory(&sample).await {
                                core.health.count_persistence_error();
                                tracing::debug!("Trajectory append failed: {}", err);
                            }
                        } else {
                            core.health.count_telemetry_dropped(1);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        core.health.count_telemetry_dropped(skipped);
                        tracing::warn!("Telemetry tap lagged, skipped {} samples", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Telemetry tap closed");
                        break;
                    }
                }
            }
        }
    }
}
