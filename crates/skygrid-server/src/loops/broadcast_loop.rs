//! Fixed-rate snapshot composition and fan-out.

use crate::state::Core;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;

pub async fn run_broadcast_loop(core: Arc<Core>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(core.config.coordination.tick_period());

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Broadcaster shutting down");
                break;
            }
            _ = ticker.tick() => {
                let now = core.clock.now();
                let mut drones: Vec<_> = core.driver.status_all().await.into_values().collect();
                drones.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
                let conflicts = core
                    .live_conflicts
                    .read()
                    .expect("conflicts lock")
                    .clone();

                core.broadcaster.publish(now, drones, conflicts);
            }
        }
    }
}
