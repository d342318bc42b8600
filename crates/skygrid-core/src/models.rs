//! Core data models for the coordination service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live kinematic state of one vehicle, as reported by the fleet driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Altitude above ground level, meters.
    pub altitude_m: f64,
    /// Local-frame velocity, meters per second (x east, y north, z up).
    #[serde(default)]
    pub velocity_x: f64,
    #[serde(default)]
    pub velocity_y: f64,
    #[serde(default)]
    pub velocity_z: f64,
    /// Battery fraction in [0, 1].
    pub battery: f64,
    pub armed: bool,
    pub mode: String,
    pub last_update: DateTime<Utc>,
}

/// One recorded telemetry sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    #[serde(default)]
    pub velocity_x: f64,
    #[serde(default)]
    pub velocity_y: f64,
    #[serde(default)]
    pub velocity_z: f64,
}

impl TrajectorySample {
    /// Capture a sample from a vehicle state snapshot.
    pub fn from_state(state: &VehicleState) -> Self {
        Self {
            vehicle_id: state.vehicle_id.clone(),
            timestamp: state.last_update,
            lat: state.lat,
            lon: state.lon,
            altitude_m: state.altitude_m,
            velocity_x: state.velocity_x,
            velocity_y: state.velocity_y,
            velocity_z: state.velocity_z,
        }
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(alias = "alt")]
    pub altitude_m: f64,
}

/// Mission lifecycle states.
///
/// Legal transitions: Scheduled -> Running -> {Completed, Failed};
/// any non-terminal state -> Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionState {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl MissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionState::Completed | MissionState::Failed | MissionState::Cancelled
        )
    }

    /// Whether a transition between two states is legal.
    pub fn can_transition_to(&self, next: MissionState) -> bool {
        use MissionState::*;
        match (self, next) {
            (Scheduled, Running) | (Scheduled, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// An admitted plan with lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub mission_id: String,
    pub vehicle_id: String,
    pub waypoints: Vec<Waypoint>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub state: MissionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Mission {
    /// Scheduled or running, i.e. occupying its vehicle's time window.
    pub fn is_active(&self) -> bool {
        matches!(self.state, MissionState::Scheduled | MissionState::Running)
    }

    /// Whether this mission's window overlaps `[start, end)`.
    pub fn window_overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// Two current positions below the safety buffer.
    Live,
    /// Two planned segments' closest approach below the buffer.
    Planned,
    /// A planned segment against a live trajectory projection.
    Mixed,
    /// Candidate window overlaps another mission of the same vehicle.
    Exclusivity,
    /// Advisory: waypoint altitude below the configured floor.
    Altitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Warning,
    Critical,
}

impl ConflictSeverity {
    /// Severity from closest approach: critical at or below half the buffer.
    pub fn from_distance(min_distance_m: f64, buffer_m: f64) -> Self {
        if min_distance_m <= buffer_m / 2.0 {
            ConflictSeverity::Critical
        } else {
            ConflictSeverity::Warning
        }
    }
}

/// A detected spatio-temporal conflict.
///
/// `time_from == time_to` for instantaneous (live) conflicts. `vehicle_b`
/// is absent for non-pairwise kinds such as altitude advisories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub vehicle_a: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_b: Option<String>,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub min_distance_m: f64,
    pub severity: ConflictSeverity,
}

/// Command issued to a vehicle through the fleet driver.
///
/// Serialized shape matches the control API: `{"command": "goto", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum DriverCommand {
    Arm,
    Disarm,
    Takeoff { altitude_m: f64 },
    Land,
    Rtl,
    Goto { lat: f64, lon: f64, altitude_m: f64 },
    Stop,
}

impl DriverCommand {
    /// Short tag for logs and acknowledgements.
    pub fn name(&self) -> &'static str {
        match self {
            DriverCommand::Arm => "arm",
            DriverCommand::Disarm => "disarm",
            DriverCommand::Takeoff { .. } => "takeoff",
            DriverCommand::Land => "land",
            DriverCommand::Rtl => "rtl",
            DriverCommand::Goto { .. } => "goto",
            DriverCommand::Stop => "stop",
        }
    }
}
