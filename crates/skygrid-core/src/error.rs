//! Error types surfaced by the coordination core.

use thiserror::Error;

/// Failures returned synchronously to callers.
///
/// A rejected mission with an attached conflict list is NOT an error; it is
/// reported through [`crate::deconflict::Evaluation`]. These variants cover
/// malformed input and unavailable collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// Candidate plan is structurally unusable (no waypoints).
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Mission window is empty or reversed.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// Derived cruise speed exceeds the configured ceiling.
    #[error("cruise speed {speed_mps:.1} m/s exceeds limit {limit_mps:.1} m/s")]
    InvalidSpeed { speed_mps: f64, limit_mps: f64 },

    /// Vehicle id is not part of the fleet inventory.
    #[error("unknown vehicle {0}")]
    UnknownVehicle(String),

    /// Mission id does not resolve to a registry record.
    #[error("unknown mission {0}")]
    UnknownMission(String),
}
