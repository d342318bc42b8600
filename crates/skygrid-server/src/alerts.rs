//! Alert channel shared by the monitor, the scheduler, and the event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skygrid_core::Conflict;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Conflict,
    MissionFailed,
    MissionCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Conflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn conflict(conflict: Conflict, now: DateTime<Utc>) -> Self {
        let detail = format!(
            "{:?} conflict {} <-> {} at {:.1} m",
            conflict.kind,
            conflict.vehicle_a,
            conflict.vehicle_b.as_deref().unwrap_or("-"),
            conflict.min_distance_m
        );
        Self {
            kind: AlertKind::Conflict,
            conflict: Some(conflict),
            mission_id: None,
            detail,
            timestamp: now,
        }
    }

    pub fn mission_failed(mission_id: &str, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind: AlertKind::MissionFailed,
            conflict: None,
            mission_id: Some(mission_id.to_string()),
            detail: reason.to_string(),
            timestamp: now,
        }
    }

    pub fn mission_cancelled(mission_id: &str, detail: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind: AlertKind::MissionCancelled,
            conflict: None,
            mission_id: Some(mission_id.to_string()),
            detail: detail.to_string(),
            timestamp: now,
        }
    }
}

pub type AlertBus = broadcast::Sender<Alert>;

pub fn alert_bus() -> AlertBus {
    broadcast::channel(256).0
}

/// Post an alert; a bus with no subscribers is not an error.
pub fn post(bus: &AlertBus, alert: Alert) {
    let _ = bus.send(alert);
}
