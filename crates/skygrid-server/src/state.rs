//! Core assembly: the owned components wired together at startup.
//!
//! There are no process-global handles; handlers and loops receive an
//! `Arc<Core>`, which makes per-test instantiation trivial.

use crate::alerts::{self, AlertBus};
use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::driver::FleetDriver;
use crate::loops;
use crate::persistence::Persistence;
use crate::registry::MissionRegistry;
use skygrid_core::clock::Clock;
use skygrid_core::{Conflict, DeconflictionEngine, TrajectoryStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Deadline for draining missions at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Counters for errors that are absorbed rather than surfaced per-request.
#[derive(Debug, Default)]
pub struct Health {
    telemetry_dropped: AtomicU64,
    persistence_errors: AtomicU64,
}

impl Health {
    pub fn count_telemetry_dropped(&self, n: u64) {
        self.telemetry_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count_persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_dropped(&self) -> u64 {
        self.telemetry_dropped.load(Ordering::Relaxed)
    }

    pub fn persistence_errors(&self) -> u64 {
        self.persistence_errors.load(Ordering::Relaxed)
    }
}

pub struct Core {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<TrajectoryStore>,
    pub driver: Arc<dyn FleetDriver>,
    pub persistence: Arc<dyn Persistence>,
    pub registry: Arc<MissionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    /// Latest monitor tick output, consumed by the broadcast loop.
    pub live_conflicts: Arc<RwLock<Vec<Conflict>>>,
    pub alerts: AlertBus,
    pub health: Arc<Health>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Core {
    pub fn new(
        config: Config,
        driver: Arc<dyn FleetDriver>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(TrajectoryStore::new(
            config.coordination.trajectory_retention_s,
        ));
        let alerts = alerts::alert_bus();
        let health = Arc::new(Health::default());
        let (shutdown_tx, _) = broadcast::channel(8);

        let registry = Arc::new(MissionRegistry::new(
            DeconflictionEngine::new(&config.coordination),
            store.clone(),
            persistence.clone(),
            clock.clone(),
            alerts.clone(),
            health.clone(),
            driver.vehicle_ids(),
        ));

        Self {
            config,
            clock,
            store,
            driver,
            persistence,
            registry,
            broadcaster: Arc::new(Broadcaster::new()),
            live_conflicts: Arc::new(RwLock::new(Vec::new())),
            alerts,
            health,
            shutdown_tx,
        }
    }

    /// Start the long-lived background tasks.
    pub fn spawn_loops(self: &Arc<Self>) {
        tokio::spawn(loops::telemetry_loop::run_telemetry_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(loops::monitor_loop::run_monitor_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(loops::broadcast_loop::run_broadcast_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(loops::dispatch_loop::run_dispatch_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        ));
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Cancel every non-terminal mission and stop all vehicles.
    /// Idempotent: a second call finds only terminal missions.
    pub async fn emergency_stop(&self) -> anyhow::Result<()> {
        for mission in self.registry.list_active() {
            if let Err(err) = self.registry.cancel(&mission.mission_id).await {
                tracing::warn!(
                    "Emergency cancel of {} failed: {}",
                    mission.mission_id,
                    err
                );
            }
        }
        self.driver.emergency_stop_all().await?;
        tracing::warn!("Emergency stop issued to all vehicles");
        Ok(())
    }

    /// Stop loops, cancel scheduled missions, and stop running vehicles,
    /// waiting at most the shutdown deadline before proceeding regardless.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for mission in self.registry.list_active() {
                let _ = self.registry.cancel(&mission.mission_id).await;
                let _ = self
                    .driver
                    .command(&mission.vehicle_id, skygrid_core::DriverCommand::Stop)
                    .await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            tracing::warn!("Shutdown deadline exceeded; proceeding");
        }
    }
}
