//! Coordination parameters and their defaults.

use serde::{Deserialize, Serialize};

/// Tunable parameters shared by the engine, monitor, scheduler, and
/// broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Minimum allowed 3-D separation between any two vehicles, meters.
    pub safety_buffer_m: f64,
    /// Broadcaster and monitor tick rate.
    pub update_hz: f64,
    /// How long live trajectory samples are retained, seconds.
    pub trajectory_retention_s: u64,
    /// Forward-projection window for mixed (planned vs live) conflicts.
    pub projection_horizon_s: f64,
    /// Interval between repeat alerts for a continuously conflicting pair.
    pub dedup_reminder_s: f64,
    /// Conflict-free gap after which a pair is cleared from the dedup table.
    pub dedup_clear_s: f64,
    /// Temporal sampling resolution of the deconfliction engine, seconds.
    pub deconflict_resolution_s: f64,
    /// Ceiling on a candidate mission's derived cruise speed.
    pub max_cruise_speed_mps: f64,
    /// Waypoints below this altitude raise an advisory conflict.
    pub altitude_floor_m: f64,
    /// Watchdog applied to every driver command.
    pub driver_command_timeout_s: f64,
    /// Fleet inventory size.
    pub max_drones: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            safety_buffer_m: 10.0,
            update_hz: 2.0,
            trajectory_retention_s: 3600,
            projection_horizon_s: 30.0,
            dedup_reminder_s: 5.0,
            dedup_clear_s: 3.0,
            deconflict_resolution_s: 0.5,
            max_cruise_speed_mps: 20.0,
            altitude_floor_m: 2.0,
            driver_command_timeout_s: 15.0,
            max_drones: 10,
        }
    }
}

impl CoordinationConfig {
    /// Validate parameter ranges.
    /// Returns a list of validation errors (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !(self.safety_buffer_m > 0.0) {
            errors.push("safety_buffer_m must be positive".to_string());
        }
        if !(self.update_hz > 0.0) {
            errors.push("update_hz must be positive".to_string());
        }
        if self.trajectory_retention_s == 0 {
            errors.push("trajectory_retention_s must be at least 1".to_string());
        }
        if !(self.deconflict_resolution_s > 0.0) {
            errors.push("deconflict_resolution_s must be positive".to_string());
        }
        if !(self.max_cruise_speed_mps > 0.0) {
            errors.push("max_cruise_speed_mps must be positive".to_string());
        }
        if self.projection_horizon_s < 0.0 {
            errors.push("projection_horizon_s cannot be negative".to_string());
        }
        if !(self.dedup_reminder_s > 0.0) || !(self.dedup_clear_s > 0.0) {
            errors.push("alert dedup intervals must be positive".to_string());
        }
        if !(self.driver_command_timeout_s > 0.0) {
            errors.push("driver_command_timeout_s must be positive".to_string());
        }
        if self.max_drones == 0 {
            errors.push("max_drones must be at least 1".to_string());
        }

        errors
    }

    /// Broadcast/monitor tick period derived from `update_hz`.
    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.update_hz)
    }
}
