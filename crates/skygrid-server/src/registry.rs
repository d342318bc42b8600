//! Mission registry: atomic admission, lifecycle transitions, cancellation.
//!
//! Writes are serialized by a single admission lock held for the duration
//! of one deconfliction evaluation; reads go straight to the sharded map
//! and never block. A mission admitted while the lock is held is visible
//! to every later `schedule` call.

use crate::alerts::{self, Alert, AlertBus};
use crate::persistence::{Persistence, PersistenceError};
use crate::state::Health;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use skygrid_core::clock::{new_mission_id, Clock};
use skygrid_core::{
    Conflict, CoreError, DeconflictionEngine, Evaluation, Mission, MissionCandidate, MissionState,
    TrajectoryStore,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify, Semaphore};

/// Deadline for one authoritative mission write.
const PERSIST_DEADLINE: Duration = Duration::from_secs(2);
/// Callers queued on the admission lock beyond this are shed.
const MAX_PENDING_ADMISSIONS: usize = 32;

#[derive(Debug)]
pub enum ScheduleOutcome {
    /// Admitted; the new mission id.
    Scheduled(String),
    /// Rejected with the conflicts found. No state change.
    Rejected(Vec<Conflict>),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error("mission store write failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("admission queue full")]
    ResourceExhausted,
}

pub struct MissionRegistry {
    missions: DashMap<String, Mission>,
    admission: Mutex<()>,
    admission_slots: Semaphore,
    engine: DeconflictionEngine,
    store: Arc<TrajectoryStore>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    alerts: AlertBus,
    health: Arc<Health>,
    known_vehicles: Vec<String>,
    /// Signalled on admission so the dispatcher re-arms its timer.
    pub dispatch_wake: Notify,
    cancel_tx: broadcast::Sender<String>,
}

impl MissionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: DeconflictionEngine,
        store: Arc<TrajectoryStore>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        alerts: AlertBus,
        health: Arc<Health>,
        known_vehicles: Vec<String>,
    ) -> Self {
        let (cancel_tx, _) = broadcast::channel(64);
        Self {
            missions: DashMap::new(),
            admission: Mutex::new(()),
            admission_slots: Semaphore::new(MAX_PENDING_ADMISSIONS),
            engine,
            store,
            persistence,
            clock,
            alerts,
            health,
            known_vehicles,
            dispatch_wake: Notify::new(),
            cancel_tx,
        }
    }

    /// Atomically evaluate and admit a candidate mission.
    pub async fn schedule(
        &self,
        candidate: MissionCandidate,
    ) -> Result<ScheduleOutcome, ScheduleError> {
        if !self.known_vehicles.contains(&candidate.vehicle_id) {
            return Err(CoreError::UnknownVehicle(candidate.vehicle_id).into());
        }

        let _slot = self
            .admission_slots
            .try_acquire()
            .map_err(|_| ScheduleError::ResourceExhausted)?;
        let _admission = self.admission.lock().await;

        let now = self.clock.now();
        let active = self.active_snapshot();
        let live = self.store.latest_all();
        let evaluation = self.engine.evaluate(&candidate, &active, &live, now)?;

        if !evaluation.safe {
            return Ok(ScheduleOutcome::Rejected(evaluation.conflicts));
        }

        let mission = Mission {
            mission_id: new_mission_id(),
            vehicle_id: candidate.vehicle_id,
            waypoints: candidate.waypoints,
            start_time: candidate.start_time,
            end_time: candidate.end_time,
            state: MissionState::Scheduled,
            fail_reason: None,
            created_at: now,
        };

        // Authoritative write: the mission exists once the store says so.
        self.persist_with_retry(&mission).await?;

        let mission_id = mission.mission_id.clone();
        self.missions.insert(mission_id.clone(), mission);
        self.dispatch_wake.notify_one();

        tracing::info!("Scheduled mission {}", mission_id);
        Ok(ScheduleOutcome::Scheduled(mission_id))
    }

    async fn persist_with_retry(&self, mission: &Mission) -> Result<(), PersistenceError> {
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                PERSIST_DEADLINE,
                self.persistence.put_mission(mission),
            )
            .await;

            let err = match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(_) => PersistenceError::Transient("mission write deadline exceeded".into()),
            };

            self.health.count_persistence_error();
            if attempt == 0 && err.is_transient() {
                tracing::warn!("Mission write failed, retrying once: {}", err);
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }

    /// Cancel a mission. Terminal missions are a no-op returning the
    /// current state; a running mission additionally gets a driver STOP
    /// from its execution task (which emits the CANCELLED alert on
    /// acknowledgement).
    pub async fn cancel(&self, mission_id: &str) -> Result<MissionState, CoreError> {
        let snapshot = {
            let mut entry = self
                .missions
                .get_mut(mission_id)
                .ok_or_else(|| CoreError::UnknownMission(mission_id.to_string()))?;
            if entry.state.is_terminal() {
                return Ok(entry.state);
            }
            let was_running = entry.state == MissionState::Running;
            entry.state = MissionState::Cancelled;
            (entry.value().clone(), was_running)
        };
        let (mission, was_running) = snapshot;

        self.persist_best_effort(&mission).await;

        if was_running {
            let _ = self.cancel_tx.send(mission.mission_id.clone());
        } else {
            alerts::post(
                &self.alerts,
                Alert::mission_cancelled(
                    &mission.mission_id,
                    "cancelled before dispatch",
                    self.clock.now(),
                ),
            );
        }

        tracing::info!("Cancelled mission {}", mission.mission_id);
        Ok(MissionState::Cancelled)
    }

    pub fn get(&self, mission_id: &str) -> Option<Mission> {
        self.missions.get(mission_id).map(|m| m.value().clone())
    }

    /// All missions in the registry, ordered by start time.
    pub fn list_all(&self) -> Vec<Mission> {
        let mut missions: Vec<Mission> = self
            .missions
            .iter()
            .map(|m| m.value().clone())
            .collect();
        missions.sort_by_key(|m| m.start_time);
        missions
    }

    /// Missions in {SCHEDULED, RUNNING}.
    pub fn list_active(&self) -> Vec<Mission> {
        let mut missions: Vec<Mission> = self
            .missions
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.value().clone())
            .collect();
        missions.sort_by_key(|m| m.start_time);
        missions
    }

    pub(crate) fn active_snapshot(&self) -> Vec<Mission> {
        self.list_active()
    }

    /// Earliest start among scheduled missions; drives the dispatcher timer.
    pub fn next_start_time(&self) -> Option<DateTime<Utc>> {
        self.missions
            .iter()
            .filter(|m| m.state == MissionState::Scheduled)
            .map(|m| m.start_time)
            .min()
    }

    /// Scheduled missions whose start time has arrived.
    pub fn due_missions(&self, now: DateTime<Utc>) -> Vec<Mission> {
        let mut due: Vec<Mission> = self
            .missions
            .iter()
            .filter(|m| m.state == MissionState::Scheduled && m.start_time <= now)
            .map(|m| m.value().clone())
            .collect();
        due.sort_by_key(|m| m.start_time);
        due
    }

    /// Second deconfliction pass at dispatch time, restricted to live
    /// traffic.
    pub fn revalidate_live(&self, mission: &Mission) -> Evaluation {
        let candidate = MissionCandidate::from_mission(mission);
        self.engine.evaluate_live(
            &candidate,
            &self.active_snapshot(),
            &self.store.latest_all(),
            self.clock.now(),
        )
    }

    /// Apply a lifecycle transition if it is legal. Returns false when the
    /// mission is missing or the transition is not allowed (e.g. the
    /// mission was cancelled concurrently).
    pub async fn transition(
        &self,
        mission_id: &str,
        to: MissionState,
        reason: Option<&str>,
    ) -> bool {
        let snapshot = {
            let Some(mut entry) = self.missions.get_mut(mission_id) else {
                return false;
            };
            if !entry.state.can_transition_to(to) {
                return false;
            }
            entry.state = to;
            if let Some(reason) = reason {
                entry.fail_reason = Some(reason.to_string());
            }
            entry.value().clone()
        };
        self.persist_best_effort(&snapshot).await;
        true
    }

    /// Subscribe to cancellation signals for running missions.
    pub fn cancel_events(&self) -> broadcast::Receiver<String> {
        self.cancel_tx.subscribe()
    }

    async fn persist_best_effort(&self, mission: &Mission) {
        if let Err(err) = self.persistence.put_mission(mission).await {
            self.health.count_persistence_error();
            tracing::warn!(
                "Best-effort mission write failed for {}: {}",
                mission.mission_id,
                err
            );
        }
    }

    /// Replay persisted missions at startup. Scheduled missions whose
    /// window is still live are restored; missions persisted as RUNNING
    /// lost their execution context and are marked failed.
    pub async fn restore(&self) -> Result<(), PersistenceError> {
        let now = self.clock.now();
        let persisted = self
            .persistence
            .list_missions(&crate::persistence::MissionFilter {
                active_only: true,
                ..Default::default()
            })
            .await?;

        for mut mission in persisted {
            match mission.state {
                MissionState::Scheduled if mission.end_time > now => {
                    self.missions.insert(mission.mission_id.clone(), mission);
                }
                MissionState::Scheduled => {
                    mission.state = MissionState::Failed;
                    mission.fail_reason = Some("window expired before restart".to_string());
                    self.persist_best_effort(&mission).await;
                }
                MissionState::Running => {
                    mission.state = MissionState::Failed;
                    mission.fail_reason = Some("interrupted by restart".to_string());
                    self.persist_best_effort(&mission).await;
                }
                _ => {}
            }
        }

        let restored = self.missions.len();
        if restored > 0 {
            tracing::info!("Restored {} scheduled mission(s)", restored);
            self.dispatch_wake.notify_one();
        }
        Ok(())
    }
}
