//! Live proximity scan at the broadcast cadence.

use crate::alerts::{self, Alert};
use crate::state::Core;
use skygrid_core::LiveMonitor;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;

pub async fn run_monitor_loop(core: Arc<Core>, mut shutdown: broadcast::Receiver<()>) {
    let mut monitor = LiveMonitor::new(&core.config.coordination);
    let mut ticker = interval(core.config.coordination.tick_period());

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Live monitor shutting down");
                break;
            }
            _ = ticker.tick() => {
                let now = core.clock.now();
                let latest = core.store.latest_all();
                let outcome = monitor.scan(&latest, now);

                *core.live_conflicts.write().expect("conflicts lock") =
                    outcome.conflicts;

                for conflict in outcome.alerts {
                    tracing::warn!(
                        "Conflict: {} <-> {} at {:.1} m ({:?})",
                        conflict.vehicle_a,
                        conflict.vehicle_b.as_deref().unwrap_or("-"),
                        conflict.min_distance_m,
                        conflict.severity
                    );
                    if let Err(err) = core.persistence.append_conflict_event(&conflict).await {
                        core.health.count_persistence_error();
                        tracing::debug!("Conflict event append failed: {}", err);
                    }
                    alerts::post(&core.alerts, Alert::conflict(conflict, now));
                }
            }
        }
    }
}
