//! REST API routes.

use crate::driver::DriverError;
use crate::registry::{ScheduleError, ScheduleOutcome};
use crate::state::Core;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use skygrid_core::{geo, DriverCommand, MissionCandidate, MissionState, Waypoint};
use std::sync::Arc;
use std::time::Duration;

/// Cruise speed assumed when a schedule request omits its end time.
const DEFAULT_CRUISE_SPEED_MPS: f64 = 10.0;

pub fn create_router() -> Router<Arc<Core>> {
    Router::new()
        .route("/api/drones", get(list_drones))
        .route("/api/missions", get(list_missions))
        .route("/api/missions/:mission_id", delete(cancel_mission))
        .route("/api/schedule", post(schedule_mission))
        .route("/api/control/:drone_id", post(control_drone))
        .route("/api/emergency", post(emergency_stop))
        .route("/api/trajectory/:drone_id", get(recent_trajectory))
        .route("/api/history/trajectory/:drone_id", get(history_trajectory))
        .route("/api/history/statistics", get(history_statistics))
        .route("/api/history/conflicts", get(history_conflicts))
        .route("/api/future/trajectories", get(future_trajectories))
        .route("/api/events", get(super::ws::ws_handler))
        .route("/health", get(health))
}

// === Request/Response types ===

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub drone_id: String,
    pub waypoints: Vec<Waypoint>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct TimeRangeQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    /// Aggregation window in seconds.
    pub window: Option<f64>,
}

fn error_body(error: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "success": false, "error": error.to_string() }))
}

// === Handlers ===

async fn list_drones(State(core): State<Arc<Core>>) -> Json<Value> {
    let mut drones: Vec<_> = core.driver.status_all().await.into_values().collect();
    drones.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
    Json(json!({
        "success": true,
        "drones": drones,
        "timestamp": core.clock.now(),
    }))
}

async fn list_missions(State(core): State<Arc<Core>>) -> Json<Value> {
    Json(json!({
        "success": true,
        "missions": core.registry.list_all(),
    }))
}

async fn schedule_mission(
    State(core): State<Arc<Core>>,
    Json(request): Json<ScheduleRequest>,
) -> (StatusCode, Json<Value>) {
    let now = core.clock.now();
    let start_time = request.start_time.unwrap_or(now);
    let end_time = request.end_time.unwrap_or_else(|| {
        let length = geo::path_length_m(&request.waypoints);
        let duration_s = (length / DEFAULT_CRUISE_SPEED_MPS).max(1.0);
        start_time + ChronoDuration::milliseconds((duration_s * 1000.0) as i64)
    });

    let candidate = MissionCandidate {
        vehicle_id: request.drone_id,
        waypoints: request.waypoints,
        start_time,
        end_time,
    };

    match core.registry.schedule(candidate).await {
        Ok(ScheduleOutcome::Scheduled(mission_id)) => (
            StatusCode::OK,
            Json(json!({ "success": true, "mission_id": mission_id })),
        ),
        Ok(ScheduleOutcome::Rejected(conflicts)) => (
            StatusCode::CONFLICT,
            Json(json!({ "success": false, "conflicts": conflicts })),
        ),
        Err(ScheduleError::Invalid(err)) => (StatusCode::BAD_REQUEST, error_body(err)),
        Err(ScheduleError::ResourceExhausted) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("RESOURCE_EXHAUSTED"),
        ),
        Err(ScheduleError::Persistence(err)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(err))
        }
    }
}

async fn cancel_mission(
    State(core): State<Arc<Core>>,
    Path(mission_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match core.registry.cancel(&mission_id).await {
        Ok(state) => (
            StatusCode::OK,
            Json(json!({ "success": true, "mission_id": mission_id, "state": state })),
        ),
        Err(err) => (StatusCode::NOT_FOUND, error_body(err)),
    }
}

async fn control_drone(
    State(core): State<Arc<Core>>,
    Path(drone_id): Path<String>,
    Json(command): Json<DriverCommand>,
) -> (StatusCode, Json<Value>) {
    let watchdog = Duration::from_secs_f64(core.config.coordination.driver_command_timeout_s);
    match tokio::time::timeout(watchdog, core.driver.command(&drone_id, command)).await {
        Ok(Ok(ack)) => (
            StatusCode::OK,
            Json(json!({ "success": true, "ack": ack })),
        ),
        Ok(Err(DriverError::UnknownVehicle(id))) => (
            StatusCode::NOT_FOUND,
            error_body(DriverError::UnknownVehicle(id)),
        ),
        Ok(Err(err)) => (StatusCode::OK, error_body(err)),
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, error_body("driver watchdog expired")),
    }
}

async fn emergency_stop(State(core): State<Arc<Core>>) -> (StatusCode, Json<Value>) {
    match core.emergency_stop().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(err) => (StatusCode::BAD_GATEWAY, error_body(err)),
    }
}

async fn recent_trajectory(
    State(core): State<Arc<Core>>,
    Path(drone_id): Path<String>,
) -> Json<Value> {
    let now = core.clock.now();
    let retention =
        ChronoDuration::seconds(core.config.coordination.trajectory_retention_s as i64);
    let samples = core.store.slice(&drone_id, now - retention, now);
    Json(json!({
        "success": true,
        "drone_id": drone_id,
        "trajectory": samples,
    }))
}

async fn history_trajectory(
    State(core): State<Arc<Core>>,
    Path(drone_id): Path<String>,
    Query(range): Query<TimeRangeQuery>,
) -> (StatusCode, Json<Value>) {
    let now = core.clock.now();
    let to = range.end_time.unwrap_or(now);
    let from = range.start_time.unwrap_or(to - ChronoDuration::hours(1));

    match core.persistence.range_trajectory(&drone_id, from, to).await {
        Ok(samples) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "drone_id": drone_id,
                "samples": samples,
            })),
        ),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(err)),
    }
}

async fn history_statistics(
    State(core): State<Arc<Core>>,
    Query(query): Query<WindowQuery>,
) -> (StatusCode, Json<Value>) {
    let now = core.clock.now();
    let window_s = query.window.unwrap_or(3600.0).max(0.0);
    let from = now - ChronoDuration::milliseconds((window_s * 1000.0) as i64);

    let conflict_events = match core.persistence.range_conflicts(from, now).await {
        Ok(events) => events.len(),
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, error_body(err)),
    };

    let missions = core.registry.list_all();
    let by_state = |state: MissionState| missions.iter().filter(|m| m.state == state).count();

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "statistics": {
                "window_s": window_s,
                "conflict_events": conflict_events,
                "missions_total": missions.len(),
                "missions_scheduled": by_state(MissionState::Scheduled),
                "missions_running": by_state(MissionState::Running),
                "missions_completed": by_state(MissionState::Completed),
                "missions_failed": by_state(MissionState::Failed),
                "missions_cancelled": by_state(MissionState::Cancelled),
                "vehicles_tracked": core.store.vehicle_count(),
                "samples_retained": core.store.sample_count(),
            },
        })),
    )
}

async fn history_conflicts(
    State(core): State<Arc<Core>>,
    Query(range): Query<TimeRangeQuery>,
) -> (StatusCode, Json<Value>) {
    let now = core.clock.now();
    let to = range.end_time.unwrap_or(now);
    let from = range.start_time.unwrap_or(to - ChronoDuration::hours(1));

    match core.persistence.range_conflicts(from, to).await {
        Ok(conflicts) => (
            StatusCode::OK,
            Json(json!({ "success": true, "conflicts": conflicts })),
        ),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(err)),
    }
}

async fn future_trajectories(
    State(core): State<Arc<Core>>,
    Query(range): Query<TimeRangeQuery>,
) -> Json<Value> {
    let now = core.clock.now();
    let from = range.start_time.unwrap_or(now);
    let to = range.end_time.unwrap_or(from + ChronoDuration::hours(1));

    let segments: Vec<Value> = core
        .registry
        .list_active()
        .into_iter()
        .filter(|m| m.window_overlaps(from, to))
        .map(|m| {
            json!({
                "mission_id": m.mission_id,
                "drone_id": m.vehicle_id,
                "waypoints": m.waypoints,
                "start_time": m.start_time,
                "end_time": m.end_time,
                "state": m.state,
            })
        })
        .collect();

    Json(json!({ "success": true, "segments": segments }))
}

async fn health(State(core): State<Arc<Core>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "subscribers": core.broadcaster.subscriber_count(),
        "telemetry_dropped": core.health.telemetry_dropped(),
        "persistence_errors": core.health.persistence_errors(),
    }))
}
