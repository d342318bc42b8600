//! In-memory persistence for tests and local development.

use super::{MissionFilter, Persistence, PersistenceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skygrid_core::{Conflict, Mission, TrajectorySample};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Test double backing the [`Persistence`] trait with plain collections.
///
/// `fail_next_puts` injects transient failures into upcoming mission
/// writes so retry paths can be exercised deterministically.
#[derive(Default)]
pub struct MemoryStore {
    missions: Mutex<HashMap<String, Mission>>,
    trajectories: Mutex<Vec<TrajectorySample>>,
    conflicts: Mutex<Vec<Conflict>>,
    fail_puts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` mission writes fail with a transient error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Option<PersistenceError> {
        let remaining = self.fail_puts.load(Ordering::SeqCst);
        if remaining == 0 {
            return None;
        }
        self.fail_puts.store(remaining - 1, Ordering::SeqCst);
        Some(PersistenceError::Transient(
            "injected write failure".to_string(),
        ))
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn put_mission(&self, mission: &Mission) -> Result<(), PersistenceError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        self.missions
            .lock()
            .expect("missions lock")
            .insert(mission.mission_id.clone(), mission.clone());
        Ok(())
    }

    async fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, PersistenceError> {
        Ok(self
            .missions
            .lock()
            .expect("missions lock")
            .get(mission_id)
            .cloned())
    }

    async fn list_missions(
        &self,
        filter: &MissionFilter,
    ) -> Result<Vec<Mission>, PersistenceError> {
        let mut missions: Vec<Mission> = self
            .missions
            .lock()
            .expect("missions lock")
            .values()
            .filter(|m| {
                filter
                    .vehicle_id
                    .as_ref()
                    .map_or(true, |v| *v == m.vehicle_id)
                    && (!filter.active_only || m.is_active())
            })
            .cloned()
            .collect();
        missions.sort_by_key(|m| m.start_time);
        Ok(missions)
    }

    async fn append_trajectory(&self, sample: &TrajectorySample) -> Result<(), PersistenceError> {
        self.trajectories
            .lock()
            .expect("trajectories lock")
            .push(sample.clone());
        Ok(())
    }

    async fn range_trajectory(
        &self,
        vehicle_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrajectorySample>, PersistenceError> {
        let mut samples: Vec<TrajectorySample> = self
            .trajectories
            .lock()
            .expect("trajectories lock")
            .iter()
            .filter(|s| s.vehicle_id == vehicle_id && s.timestamp >= from && s.timestamp <= to)
            .cloned()
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    async fn append_conflict_event(&self, conflict: &Conflict) -> Result<(), PersistenceError> {
        self.conflicts
            .lock()
            .expect("conflicts lock")
            .push(conflict.clone());
        Ok(())
    }

    async fn range_conflicts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Conflict>, PersistenceError> {
        let mut conflicts: Vec<Conflict> = self
            .conflicts
            .lock()
            .expect("conflicts lock")
            .iter()
            .filter(|c| c.time_from >= from && c.time_from <= to)
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.time_from);
        Ok(conflicts)
    }
}
