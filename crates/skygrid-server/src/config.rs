//! Server configuration from environment.

use skygrid_core::CoordinationConfig;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub database_max_connections: u32,
    pub coordination: CoordinationConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = CoordinationConfig::default();
        Self {
            port: env_parse("SKYGRID_PORT", 5000),
            database_path: env::var("SKYGRID_DB_PATH")
                .unwrap_or_else(|_| "data/skygrid.db".to_string()),
            database_max_connections: env_parse("SKYGRID_DB_MAX_CONNECTIONS", 5),
            coordination: CoordinationConfig {
                safety_buffer_m: env_parse("SKYGRID_SAFETY_BUFFER_M", defaults.safety_buffer_m),
                update_hz: env_parse("SKYGRID_UPDATE_HZ", defaults.update_hz),
                trajectory_retention_s: env_parse(
                    "SKYGRID_TRAJECTORY_RETENTION_S",
                    defaults.trajectory_retention_s,
                ),
                projection_horizon_s: env_parse(
                    "SKYGRID_PROJECTION_HORIZON_S",
                    defaults.projection_horizon_s,
                ),
                dedup_reminder_s: env_parse("SKYGRID_DEDUP_REMINDER_S", defaults.dedup_reminder_s),
                dedup_clear_s: env_parse("SKYGRID_DEDUP_CLEAR_S", defaults.dedup_clear_s),
                deconflict_resolution_s: env_parse(
                    "SKYGRID_DECONFLICT_RESOLUTION_S",
                    defaults.deconflict_resolution_s,
                ),
                max_cruise_speed_mps: env_parse(
                    "SKYGRID_MAX_CRUISE_SPEED_MPS",
                    defaults.max_cruise_speed_mps,
                ),
                altitude_floor_m: env_parse("SKYGRID_ALTITUDE_FLOOR_M", defaults.altitude_floor_m),
                driver_command_timeout_s: env_parse(
                    "SKYGRID_DRIVER_COMMAND_TIMEOUT_S",
                    defaults.driver_command_timeout_s,
                ),
                max_drones: env_parse("SKYGRID_MAX_DRONES", defaults.max_drones),
            },
        }
    }

    /// Validate the full configuration.
    /// Returns a list of validation errors (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.coordination.validate();
        if self.port == 0 {
            errors.push("SKYGRID_PORT must be non-zero".to_string());
        }
        if self.database_max_connections == 0 {
            errors.push("SKYGRID_DB_MAX_CONNECTIONS must be at least 1".to_string());
        }
        if self.database_path.is_empty() {
            errors.push("SKYGRID_DB_PATH must not be empty".to_string());
        }
        errors
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
