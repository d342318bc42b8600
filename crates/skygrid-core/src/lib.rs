//! Skygrid Core - Pure coordination logic for a small UAV fleet
//!
//! This crate contains the domain models, geo math, trajectory storage,
//! deconfliction engine, and live proximity monitor with NO networking
//! or async runtime dependencies.

pub mod clock;
pub mod config;
pub mod deconflict;
pub mod error;
pub mod geo;
pub mod models;
pub mod monitor;
pub mod trajectory;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordinationConfig;
pub use deconflict::{DeconflictionEngine, Evaluation, MissionCandidate};
pub use error::CoreError;
pub use models::{
    Conflict, ConflictKind, ConflictSeverity, DriverCommand, Mission, MissionState,
    TrajectorySample, VehicleState, Waypoint,
};
pub use monitor::LiveMonitor;
pub use trajectory::TrajectoryStore;
