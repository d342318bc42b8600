//! Mission dispatch: wakes at the earliest scheduled start time.
//!
//! On wake, every due mission gets a second, live-only deconfliction pass
//! before any driver command is issued; a mission that became unsafe while
//! it waited fails with LATE_CONFLICT. Execution itself (arm, takeoff,
//! goto per waypoint) runs as its own task so one slow vehicle cannot
//! delay another mission's start.

use crate::alerts::{self, Alert};
use crate::state::Core;
use skygrid_core::geo::distance_3d_m;
use skygrid_core::{DriverCommand, Mission, MissionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Timer ceiling while no mission is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);
/// Below this altitude the vehicle is treated as on the ground.
const GROUND_ALTITUDE_M: f64 = 1.0;

pub async fn run_dispatch_loop(core: Arc<Core>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let wait = match core.registry.next_start_time() {
            Some(start) => (start - core.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => IDLE_WAIT,
        };

        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Dispatcher shutting down");
                break;
            }
            // An admission may have introduced an earlier start time.
            _ = core.registry.dispatch_wake.notified() => {}
            _ = tokio::time::sleep(wait) => {
                dispatch_due(&core).await;
            }
        }
    }
}

/// Start every scheduled mission whose start time has arrived.
pub async fn dispatch_due(core: &Arc<Core>) {
    let now = core.clock.now();
    for mission in core.registry.due_missions(now) {
        let evaluation = core.registry.revalidate_live(&mission);
        if !evaluation.safe {
            tracing::warn!(
                "Mission {} unsafe at dispatch: {} conflict(s)",
                mission.mission_id,
                evaluation.conflicts.len()
            );
            core.registry
                .transition(&mission.mission_id, MissionState::Failed, Some("LATE_CONFLICT"))
                .await;
            for conflict in &evaluation.conflicts {
                if let Err(err) = core.persistence.append_conflict_event(conflict).await {
                    core.health.count_persistence_error();
                    tracing::debug!("Conflict event append failed: {}", err);
                }
            }
            alerts::post(
                &core.alerts,
                Alert::mission_failed(&mission.mission_id, "LATE_CONFLICT", now),
            );
            continue;
        }

        if !core
            .registry
            .transition(&mission.mission_id, MissionState::Running, None)
            .await
        {
            // Cancelled between wake and dispatch.
            continue;
        }

        tracing::info!(
            "Mission {}: dispatching to {}",
            mission.mission_id,
            mission.vehicle_id
        );
        let core = core.clone();
        tokio::spawn(async move {
            execute_mission(core, mission).await;
        });
    }
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

async fn execute_mission(core: Arc<Core>, mission: Mission) {
    let mut cancel_rx = core.registry.cancel_events();

    match drive_mission(&core, &mission, &mut cancel_rx).await {
        Outcome::Completed => {
            if core
                .registry
                .transition(&mission.mission_id, MissionState::Completed, None)
                .await
            {
                tracing::info!("Mission {} completed", mission.mission_id);
            }
        }
        Outcome::Cancelled => {
            // The registry already holds CANCELLED; the alert confirms the
            // stop was delivered.
            alerts::post(
                &core.alerts,
                Alert::mission_cancelled(&mission.mission_id, "stop acknowledged", core.clock.now()),
            );
            tracing::info!("Mission {} cancelled in flight", mission.mission_id);
        }
        Outcome::Failed(reason) => {
            core.registry
                .transition(&mission.mission_id, MissionState::Failed, Some(&reason))
                .await;
            alerts::post(
                &core.alerts,
                Alert::mission_failed(&mission.mission_id, &reason, core.clock.now()),
            );
            tracing::warn!("Mission {} failed: {}", mission.mission_id, reason);
        }
    }
}

async fn drive_mission(
    core: &Arc<Core>,
    mission: &Mission,
    cancel_rx: &mut broadcast::Receiver<String>,
) -> Outcome {
    let vehicle = mission.vehicle_id.as_str();
    let watchdog = Duration::from_secs_f64(core.config.coordination.driver_command_timeout_s);

    if let Err(reason) = send_command(core, vehicle, DriverCommand::Arm, watchdog).await {
        return Outcome::Failed(reason);
    }

    // Takeoff only when still on the ground.
    match core.driver.status(vehicle).await {
        Ok(state) if state.altitude_m < GROUND_ALTITUDE_M => {
            if let Some(first) = mission.waypoints.first() {
                if let Err(reason) = send_command(
                    core,
                    vehicle,
                    DriverCommand::Takeoff {
                        altitude_m: first.altitude_m,
                    },
                    watchdog,
                )
                .await
                {
                    return Outcome::Failed(reason);
                }
            }
        }
        Ok(_) => {}
        Err(err) => return Outcome::Failed(format!("status pull failed: {err}")),
    }

    // Equal-speed pacing: each leg gets window time proportional to its
    // share of the path length.
    let total_len = skygrid_core::geo::path_length_m(&mission.waypoints);
    let window_s = (mission.end_time - mission.start_time).num_milliseconds() as f64 / 1000.0;

    for (index, waypoint) in mission.waypoints.iter().enumerate() {
        if cancelled(core, &mission.mission_id) {
            let _ = send_command(core, vehicle, DriverCommand::Stop, watchdog).await;
            return Outcome::Cancelled;
        }

        if let Err(reason) = send_command(
            core,
            vehicle,
            DriverCommand::Goto {
                lat: waypoint.lat,
                lon: waypoint.lon,
                altitude_m: waypoint.altitude_m,
            },
            watchdog,
        )
        .await
        {
            return Outcome::Failed(reason);
        }

        let leg_s = if index == 0 || total_len <= f64::EPSILON {
            0.0
        } else {
            let leg_len = distance_3d_m(&mission.waypoints[index - 1], waypoint);
            window_s * leg_len / total_len
        };

        if leg_s > 0.0
            && wait_leg(&mission.mission_id, cancel_rx, Duration::from_secs_f64(leg_s)).await
        {
            let _ = send_command(core, vehicle, DriverCommand::Stop, watchdog).await;
            return Outcome::Cancelled;
        }

        if core.clock.now() >= mission.end_time {
            break;
        }
    }

    Outcome::Completed
}

fn cancelled(core: &Arc<Core>, mission_id: &str) -> bool {
    core.registry
        .get(mission_id)
        .map(|m| m.state == MissionState::Cancelled)
        .unwrap_or(false)
}

/// Sleep for one leg, returning true if the mission was cancelled first.
async fn wait_leg(
    mission_id: &str,
    cancel_rx: &mut broadcast::Receiver<String>,
    duration: Duration,
) -> bool {
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            received = cancel_rx.recv() => match received {
                Ok(id) if id == mission_id => return true,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }
}

async fn send_command(
    core: &Arc<Core>,
    vehicle: &str,
    cmd: DriverCommand,
    watchdog: Duration,
) -> Result<(), String> {
    match tokio::time::timeout(watchdog, core.driver.command(vehicle, cmd.clone())).await {
        Ok(Ok(ack)) => {
            tracing::debug!("{}: {} acknowledged ({})", vehicle, ack.command, ack.detail);
            Ok(())
        }
        Ok(Err(err)) => Err(format!("driver rejected {}: {}", cmd.name(), err)),
        Err(_) => Err(format!("driver watchdog expired on {}", cmd.name())),
    }
}
