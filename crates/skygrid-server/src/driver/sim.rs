//! Deterministic in-memory fleet simulator.
//!
//! Implements [`FleetDriver`] for tests and local development: a simple
//! kinematic model that flies each vehicle toward its current target at a
//! fixed cruise speed and emits telemetry on the tap. No randomness, so
//! scenarios replay identically.

use super::{CommandAck, DriverError, FleetDriver};
use async_trait::async_trait;
use dashmap::DashMap;
use skygrid_core::clock::Clock;
use skygrid_core::geo::{meters_per_deg_lat, meters_per_deg_lon, offset_position};
use skygrid_core::{DriverCommand, TrajectorySample, VehicleState, Waypoint};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Home base for the simulated fleet (a typical SITL origin).
const HOME_LAT: f64 = -35.3632621;
const HOME_LON: f64 = 149.1652264;
/// Spacing between home pads, meters east.
const PAD_SPACING_M: f64 = 20.0;
const SIM_CRUISE_MPS: f64 = 8.0;
const SIM_TICK_MS: u64 = 100;
/// Battery fraction drained per armed second.
const BATTERY_DRAIN_PER_S: f64 = 0.0002;

struct SimVehicle {
    state: VehicleState,
    home: Waypoint,
    target: Option<Waypoint>,
}

pub struct SimDriver {
    vehicles: DashMap<String, SimVehicle>,
    /// Stable iteration order for deterministic telemetry.
    order: Vec<String>,
    tx: broadcast::Sender<TrajectorySample>,
    clock: Arc<dyn Clock>,
}

impl SimDriver {
    pub fn new(fleet_size: usize, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        let vehicles = DashMap::new();
        let mut order = Vec::with_capacity(fleet_size);
        let now = clock.now();

        for index in 0..fleet_size {
            let vehicle_id = format!("drone-{}", index + 1);
            let (lat, lon) =
                offset_position(HOME_LAT, HOME_LON, 0.0, PAD_SPACING_M * index as f64);
            let home = Waypoint {
                lat,
                lon,
                altitude_m: 0.0,
            };
            vehicles.insert(
                vehicle_id.clone(),
                SimVehicle {
                    state: VehicleState {
                        vehicle_id: vehicle_id.clone(),
                        lat,
                        lon,
                        altitude_m: 0.0,
                        velocity_x: 0.0,
                        velocity_y: 0.0,
                        velocity_z: 0.0,
                        battery: 1.0,
                        armed: false,
                        mode: "STANDBY".to_string(),
                        last_update: now,
                    },
                    home,
                    target: None,
                },
            );
            order.push(vehicle_id);
        }

        Arc::new(Self {
            vehicles,
            order,
            tx,
            clock,
        })
    }

    /// Run the kinematic stepper until shutdown.
    pub fn spawn(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(SIM_TICK_MS));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("Simulator shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        driver.step(SIM_TICK_MS as f64 / 1000.0);
                    }
                }
            }
        });
    }

    /// Advance every vehicle by `dt_s` and emit telemetry.
    pub fn step(&self, dt_s: f64) {
        let now = self.clock.now();
        for vehicle_id in &self.order {
            let Some(mut entry) = self.vehicles.get_mut(vehicle_id) else {
                continue;
            };
            advance(&mut entry, dt_s, now);
            let _ = self.tx.send(TrajectorySample::from_state(&entry.state));
        }
    }

    fn with_vehicle<T>(
        &self,
        vehicle_id: &str,
        f: impl FnOnce(&mut SimVehicle) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut entry = self
            .vehicles
            .get_mut(vehicle_id)
            .ok_or_else(|| DriverError::UnknownVehicle(vehicle_id.to_string()))?;
        f(&mut entry)
    }

    fn ack(vehicle_id: &str, cmd: &DriverCommand, detail: impl Into<String>) -> CommandAck {
        CommandAck {
            vehicle_id: vehicle_id.to_string(),
            command: cmd.name().to_string(),
            detail: detail.into(),
        }
    }
}

fn advance(vehicle: &mut SimVehicle, dt_s: f64, now: chrono::DateTime<chrono::Utc>) {
    let landing = matches!(vehicle.state.mode.as_str(), "LAND" | "RTL");

    if vehicle.state.armed {
        vehicle.state.battery = (vehicle.state.battery - BATTERY_DRAIN_PER_S * dt_s).max(0.0);
    }
    vehicle.state.last_update = now;

    let Some(target) = vehicle.target else {
        vehicle.state.velocity_x = 0.0;
        vehicle.state.velocity_y = 0.0;
        vehicle.state.velocity_z = 0.0;
        return;
    };

    let north_m = (target.lat - vehicle.state.lat) * meters_per_deg_lat(vehicle.state.lat);
    let east_m = (target.lon - vehicle.state.lon) * meters_per_deg_lon(vehicle.state.lat);
    let up_m = target.altitude_m - vehicle.state.altitude_m;
    let distance = (north_m * north_m + east_m * east_m + up_m * up_m).sqrt();
    let max_step = SIM_CRUISE_MPS * dt_s;

    if distance <= max_step {
        vehicle.state.lat = target.lat;
        vehicle.state.lon = target.lon;
        vehicle.state.altitude_m = target.altitude_m;
        vehicle.state.velocity_x = 0.0;
        vehicle.state.velocity_y = 0.0;
        vehicle.state.velocity_z = 0.0;
        vehicle.target = None;

        if landing && vehicle.state.altitude_m <= 0.01 {
            vehicle.state.armed = false;
            vehicle.state.mode = "STANDBY".to_string();
        } else if vehicle.state.mode == "TAKEOFF" {
            vehicle.state.mode = "GUIDED".to_string();
        }
        return;
    }

    let f = max_step / distance;
    let (lat, lon) = offset_position(
        vehicle.state.lat,
        vehicle.state.lon,
        north_m * f,
        east_m * f,
    );
    vehicle.state.lat = lat;
    vehicle.state.lon = lon;
    vehicle.state.altitude_m += up_m * f;
    let inv = SIM_CRUISE_MPS / distance;
    vehicle.state.velocity_x = east_m * inv;
    vehicle.state.velocity_y = north_m * inv;
    vehicle.state.velocity_z = up_m * inv;
}

#[async_trait]
impl FleetDriver for SimDriver {
    fn vehicle_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    async fn status(&self, vehicle_id: &str) -> Result<VehicleState, DriverError> {
        self.vehicles
            .get(vehicle_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| DriverError::UnknownVehicle(vehicle_id.to_string()))
    }

    async fn status_all(&self) -> HashMap<String, VehicleState> {
        self.vehicles
            .iter()
            .map(|entry| (entry.key().clone(), entry.state.clone()))
            .collect()
    }

    async fn command(
        &self,
        vehicle_id: &str,
        cmd: DriverCommand,
    ) -> Result<CommandAck, DriverError> {
        self.with_vehicle(vehicle_id, |vehicle| {
            let state = &mut vehicle.state;
            match &cmd {
                DriverCommand::Arm => {
                    state.armed = true;
                    state.mode = "GUIDED".to_string();
                    Ok(Self::ack(vehicle_id, &cmd, "armed"))
                }
                DriverCommand::Disarm => {
                    if state.altitude_m > 0.5 {
                        return Err(DriverError::Rejected(format!(
                            "{vehicle_id} is airborne"
                        )));
                    }
                    state.armed = false;
                    state.mode = "STANDBY".to_string();
                    Ok(Self::ack(vehicle_id, &cmd, "disarmed"))
                }
                DriverCommand::Takeoff { altitude_m } => {
                    if !state.armed {
                        return Err(DriverError::Rejected(format!("{vehicle_id} is not armed")));
                    }
                    vehicle.target = Some(Waypoint {
                        lat: state.lat,
                        lon: state.lon,
                        altitude_m: *altitude_m,
                    });
                    state.mode = "TAKEOFF".to_string();
                    Ok(Self::ack(
                        vehicle_id,
                        &cmd,
                        format!("climbing to {altitude_m:.1} m"),
                    ))
                }
                DriverCommand::Goto {
                    lat,
                    lon,
                    altitude_m,
                } => {
                    if !state.armed {
                        return Err(DriverError::Rejected(format!("{vehicle_id} is not armed")));
                    }
                    vehicle.target = Some(Waypoint {
                        lat: *lat,
                        lon: *lon,
                        altitude_m: *altitude_m,
                    });
                    state.mode = "GUIDED".to_string();
                    Ok(Self::ack(vehicle_id, &cmd, "en route"))
                }
                DriverCommand::Land => {
                    vehicle.target = Some(Waypoint {
                        lat: state.lat,
                        lon: state.lon,
                        altitude_m: 0.0,
                    });
                    state.mode = "LAND".to_string();
                    Ok(Self::ack(vehicle_id, &cmd, "landing"))
                }
                DriverCommand::Rtl => {
                    vehicle.target = Some(vehicle.home);
                    state.mode = "RTL".to_string();
                    Ok(Self::ack(vehicle_id, &cmd, "returning to launch"))
                }
                DriverCommand::Stop => {
                    vehicle.target = None;
                    state.velocity_x = 0.0;
                    state.velocity_y = 0.0;
                    state.velocity_z = 0.0;
                    state.mode = "HOLD".to_string();
                    Ok(Self::ack(vehicle_id, &cmd, "holding"))
                }
            }
        })
    }

    async fn emergency_stop_all(&self) -> Result<(), DriverError> {
        for mut entry in self.vehicles.iter_mut() {
            let vehicle = entry.value_mut();
            vehicle.target = None;
            vehicle.state.velocity_x = 0.0;
            vehicle.state.velocity_y = 0.0;
            vehicle.state.velocity_z = 0.0;
            vehicle.state.mode = "HOLD".to_string();
        }
        Ok(())
    }

    fn telemetry_tap(&self) -> broadcast::Receiver<TrajectorySample> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use skygrid_core::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn takeoff_climbs_to_target_altitude() {
        let driver = SimDriver::new(1, clock());
        driver.command("drone-1", DriverCommand::Arm).await.unwrap();
        driver
            .command("drone-1", DriverCommand::Takeoff { altitude_m: 8.0 })
            .await
            .unwrap();

        // 8 m at 8 m/s cruise: one second of stepping.
        for _ in 0..10 {
            driver.step(0.1);
        }

        let state = driver.status("drone-1").await.unwrap();
        assert!((state.altitude_m - 8.0).abs() < 0.01);
        assert_eq!(state.mode, "GUIDED");
    }

    #[tokio::test]
    async fn goto_requires_arming() {
        let driver = SimDriver::new(1, clock());
        let err = driver
            .command(
                "drone-1",
                DriverCommand::Goto {
                    lat: HOME_LAT,
                    lon: HOME_LON,
                    altitude_m: 10.0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Rejected(_)));
    }

    #[tokio::test]
    async fn emergency_stop_is_idempotent() {
        let driver = SimDriver::new(2, clock());
        driver.command("drone-1", DriverCommand::Arm).await.unwrap();
        driver
            .command("drone-1", DriverCommand::Takeoff { altitude_m: 5.0 })
            .await
            .unwrap();

        driver.emergency_stop_all().await.unwrap();
        let first: Vec<_> = {
            let mut all: Vec<_> = driver.status_all().await.into_values().collect();
            all.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
            all.iter().map(|s| (s.vehicle_id.clone(), s.mode.clone())).collect()
        };

        driver.emergency_stop_all().await.unwrap();
        let second: Vec<_> = {
            let mut all: Vec<_> = driver.status_all().await.into_values().collect();
            all.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
            all.iter().map(|s| (s.vehicle_id.clone(), s.mode.clone())).collect()
        };

        assert_eq!(first, second);
        assert!(second.iter().all(|(_, mode)| mode == "HOLD"));
    }

    #[tokio::test]
    async fn unknown_vehicle_is_an_error() {
        let driver = SimDriver::new(1, clock());
        let err = driver.status("drone-9").await.unwrap_err();
        assert!(matches!(err, DriverError::UnknownVehicle(_)));
    }
}
