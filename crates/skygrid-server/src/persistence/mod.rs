//! Narrow key-value/time-series persistence interface.
//!
//! Mission writes are authoritative-with-ack; trajectory and conflict
//! appends are best-effort-with-retry. Errors are classified so callers
//! can decide which failures to retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skygrid_core::{Conflict, Mission, TrajectorySample};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// Worth one retry: timeouts, pool exhaustion, locked database.
    #[error("transient persistence failure: {0}")]
    Transient(String),
    /// Not retried: schema errors, corrupt rows, closed store.
    #[error("permanent persistence failure: {0}")]
    Permanent(String),
}

impl PersistenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::Transient(_))
    }
}

/// Filter for mission listing.
#[derive(Debug, Clone, Default)]
pub struct MissionFilter {
    pub vehicle_id: Option<String>,
    pub active_only: bool,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn put_mission(&self, mission: &Mission) -> Result<(), PersistenceError>;
    async fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, PersistenceError>;
    async fn list_missions(&self, filter: &MissionFilter) -> Result<Vec<Mission>, PersistenceError>;

    async fn append_trajectory(&self, sample: &TrajectorySample) -> Result<(), PersistenceError>;
    async fn range_trajectory(
        &self,
        vehicle_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrajectorySample>, PersistenceError>;

    async fn append_conflict_event(&self, conflict: &Conflict) -> Result<(), PersistenceError>;
    async fn range_conflicts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Conflict>, PersistenceError>;
}
