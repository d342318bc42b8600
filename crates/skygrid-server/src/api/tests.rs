use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use crate::api;
use crate::config::Config;
use crate::driver::SimDriver;
use crate::persistence::{MemoryStore, Persistence};
use crate::state::Core;
use skygrid_core::{Clock, CoordinationConfig, ManualClock, TrajectorySample};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
}

fn test_config() -> Config {
    Config {
        port: 5000,
        database_path: ":memory:".to_string(),
        database_max_connections: 1,
        coordination: CoordinationConfig::default(),
    }
}

async fn setup_app() -> (axum::Router, Arc<Core>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(base_time()));
    let driver = SimDriver::new(2, clock.clone());
    let core = Arc::new(Core::new(
        test_config(),
        driver,
        Arc::new(MemoryStore::new()),
        clock.clone(),
    ));
    let app = api::routes().with_state(core.clone());
    (app, core, clock)
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("parse json")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn schedule_body(drone_id: &str, lon0: f64, lon1: f64) -> Value {
    json!({
        "drone_id": drone_id,
        "waypoints": [
            { "lat": 0.0, "lon": lon0, "alt": 10.0 },
            { "lat": 0.0, "lon": lon1, "alt": 10.0 }
        ],
        "start_time": (base_time() + Duration::seconds(10)).to_rfc3339(),
        "end_time": (base_time() + Duration::seconds(70)).to_rfc3339(),
    })
}

#[tokio::test]
async fn head_on_second_schedule_returns_conflict() {
    let (app, _core, _clock) = setup_app().await;

    let first = app
        .clone()
        .oneshot(post_json("/api/schedule", schedule_body("drone-1", 0.0, 0.001)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = read_json(first).await;
    assert_eq!(first_body["success"], Value::Bool(true));
    assert!(first_body["mission_id"].as_str().is_some());

    let second = app
        .clone()
        .oneshot(post_json("/api/schedule", schedule_body("drone-2", 0.001, 0.0)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let second_body = read_json(second).await;
    assert_eq!(second_body["success"], Value::Bool(false));
    assert!(!second_body["conflicts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn empty_plan_is_a_bad_request() {
    let (app, _core, _clock) = setup_app().await;

    let response = app
        .oneshot(post_json(
            "/api/schedule",
            json!({ "drone_id": "drone-1", "waypoints": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["success"], Value::Bool(false));
}

#[tokio::test]
async fn control_reaches_the_driver() {
    let (app, _core, _clock) = setup_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/api/control/drone-1", json!({ "command": "arm" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["success"], Value::Bool(true));
    assert_eq!(body["ack"]["command"], "arm");

    let unknown = app
        .oneshot(post_json("/api/control/drone-9", json!({ "command": "arm" })))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn emergency_stop_is_idempotent_over_missions() {
    let (app, _core, _clock) = setup_app().await;

    let scheduled = app
        .clone()
        .oneshot(post_json("/api/schedule", schedule_body("drone-1", 0.0, 0.001)))
        .await
        .unwrap();
    assert_eq!(scheduled.status(), StatusCode::OK);

    let first = app.clone().oneshot(post_json("/api/emergency", json!({}))).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let states_after = |body: Value| -> Vec<String> {
        body["missions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["state"].as_str().unwrap().to_string())
            .collect()
    };

    let missions = read_json(app.clone().oneshot(get("/api/missions")).await.unwrap()).await;
    let first_states = states_after(missions);
    assert!(first_states.iter().all(|s| s == "cancelled"));

    let second = app.clone().oneshot(post_json("/api/emergency", json!({}))).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let missions = read_json(app.oneshot(get("/api/missions")).await.unwrap()).await;
    assert_eq!(states_after(missions), first_states);
}

#[tokio::test]
async fn drones_endpoint_lists_the_fleet() {
    let (app, _core, _clock) = setup_app().await;

    let body = read_json(app.oneshot(get("/api/drones")).await.unwrap()).await;
    assert_eq!(body["success"], Value::Bool(true));
    let drones = body["drones"].as_array().unwrap();
    assert_eq!(drones.len(), 2);
    assert_eq!(drones[0]["vehicle_id"], "drone-1");
}

#[tokio::test]
async fn recent_trajectory_reads_the_store() {
    let (app, core, clock) = setup_app().await;

    core.store.append(TrajectorySample {
        vehicle_id: "drone-1".to_string(),
        timestamp: clock.now(),
        lat: 0.0,
        lon: 0.0,
        altitude_m: 10.0,
        velocity_x: 0.0,
        velocity_y: 0.0,
        velocity_z: 0.0,
    });

    let body = read_json(app.oneshot(get("/api/trajectory/drone-1")).await.unwrap()).await;
    assert_eq!(body["trajectory"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn history_endpoints_read_persistence() {
    let (app, core, clock) = setup_app().await;

    core.persistence
        .append_trajectory(&TrajectorySample {
            vehicle_id: "drone-1".to_string(),
            timestamp: clock.now() - Duration::seconds(30),
            lat: 0.0,
            lon: 0.0,
            altitude_m: 10.0,
            velocity_x: 0.0,
            velocity_y: 0.0,
            velocity_z: 0.0,
        })
        .await
        .unwrap();

    let body = read_json(
        app.clone()
            .oneshot(get("/api/history/trajectory/drone-1"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["samples"].as_array().unwrap().len(), 1);

    let stats = read_json(
        app.oneshot(get("/api/history/statistics?window=600"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(stats["success"], Value::Bool(true));
    assert_eq!(stats["statistics"]["window_s"], json!(600.0));
}

#[tokio::test]
async fn future_trajectories_expose_planned_segments() {
    let (app, _core, _clock) = setup_app().await;

    let scheduled = app
        .clone()
        .oneshot(post_json("/api/schedule", schedule_body("drone-1", 0.0, 0.001)))
        .await
        .unwrap();
    assert_eq!(scheduled.status(), StatusCode::OK);

    let body = read_json(
        app.oneshot(get("/api/future/trajectories")).await.unwrap(),
    )
    .await;
    let segments = body["segments"].as_array().unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0]["drone_id"], "drone-1");
}

#[tokio::test]
async fn cancel_endpoint_cancels_and_then_noops() {
    let (app, _core, _clock) = setup_app().await;

    let scheduled = read_json(
        app.clone()
            .oneshot(post_json("/api/schedule", schedule_body("drone-1", 0.0, 0.001)))
            .await
            .unwrap(),
    )
    .await;
    let mission_id = scheduled["mission_id"].as_str().unwrap().to_string();

    let cancelled = read_json(
        app.clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/missions/{mission_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(cancelled["state"], "cancelled");

    let again = read_json(
        app.oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/missions/{mission_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap(),
    )
    .await;
    assert_eq!(again["state"], "cancelled");
}
