//! Fleet driver capability interface.
//!
//! The core consumes vehicles through this narrow trait; the autopilot
//! wire protocol lives entirely behind it. Commands are advisory: the
//! driver owns actuation and the last-known raw telemetry, and the core
//! receives copies through the tap.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skygrid_core::{DriverCommand, TrajectorySample, VehicleState};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod sim;
pub use sim::SimDriver;

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("vehicle {0} not found")]
    UnknownVehicle(String),
    #[error("vehicle {0} offline")]
    Offline(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("driver i/o failure: {0}")]
    Io(String),
}

/// Acknowledgement returned for an accepted command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub vehicle_id: String,
    pub command: String,
    pub detail: String,
}

/// Capability set the core consumes from the vehicle abstraction.
#[async_trait]
pub trait FleetDriver: Send + Sync {
    /// Fleet inventory discovered at startup. Stable for the process
    /// lifetime.
    fn vehicle_ids(&self) -> Vec<String>;

    /// Best-effort, non-blocking status pull for one vehicle.
    async fn status(&self, vehicle_id: &str) -> Result<VehicleState, DriverError>;

    /// Status of every reachable vehicle.
    async fn status_all(&self) -> HashMap<String, VehicleState>;

    /// Push one command; returns the driver's acknowledgement.
    async fn command(
        &self,
        vehicle_id: &str,
        cmd: DriverCommand,
    ) -> Result<CommandAck, DriverError>;

    /// Idempotent: stops every vehicle in place.
    async fn emergency_stop_all(&self) -> Result<(), DriverError>;

    /// Telemetry tap: multiplexed stream of samples for the whole fleet.
    fn telemetry_tap(&self) -> broadcast::Receiver<TrajectorySample>;
}
