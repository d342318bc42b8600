//! WebSocket event channel.
//!
//! Each subscriber gets the `connected` greeting, coalesced `drone_update`
//! snapshots, and edge-triggered `conflict_alert`s, and may send
//! `request_update`, `request_historical_playback`, and `control_drone`
//! requests back over the same socket.

use crate::alerts::AlertKind;
use crate::broadcaster::Snapshot;
use crate::state::Core;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use skygrid_core::{Conflict, DriverCommand, TrajectorySample, VehicleState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        server_time: DateTime<Utc>,
        version: String,
    },
    DroneUpdate {
        timestamp: DateTime<Utc>,
        drones: Vec<VehicleState>,
        conflicts: Vec<Conflict>,
        update_id: u64,
    },
    ConflictAlert {
        conflict: Conflict,
    },
    ControlResponse {
        request_id: Option<String>,
        success: bool,
        detail: String,
    },
    HistoricalTrajectory {
        drone_id: String,
        samples: Vec<TrajectorySample>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RequestUpdate,
    RequestHistoricalPlayback {
        drone_id: String,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    },
    ControlDrone {
        request_id: Option<String>,
        drone_id: String,
        #[serde(flatten)]
        command: DriverCommand,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(core): State<Arc<Core>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, core))
}

async fn handle_socket(socket: WebSocket, core: Arc<Core>) {
    let (mut sender, mut receiver) = socket.split();

    let hello = ServerMessage::Connected {
        server_time: core.clock.now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if send_message(&mut sender, &hello).await.is_err() {
        return;
    }

    let mut subscription = core.broadcaster.subscribe();
    let mut alert_rx = core.alerts.subscribe();

    loop {
        tokio::select! {
            changed = subscription.rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = subscription.rx.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    if send_message(&mut sender, &drone_update(snapshot)).await.is_err() {
                        break;
                    }
                }
            }
            alert = alert_rx.recv() => match alert {
                Ok(alert) => {
                    if alert.kind == AlertKind::Conflict {
                        if let Some(conflict) = alert.conflict {
                            let msg = ServerMessage::ConflictAlert { conflict };
                            if send_message(&mut sender, &msg).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if handle_client_message(&core, &text, &mut sender).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    }

    core.broadcaster.unsubscribe(subscription.id);
}

fn drone_update(snapshot: Snapshot) -> ServerMessage {
    ServerMessage::DroneUpdate {
        timestamp: snapshot.timestamp,
        drones: snapshot.drones,
        conflicts: snapshot.conflicts,
        update_id: snapshot.update_id,
    }
}

async fn handle_client_message(
    core: &Arc<Core>,
    text: &str,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::RequestUpdate) => {
            if let Some(snapshot) = core.broadcaster.latest() {
                send_message(sender, &drone_update(snapshot)).await?;
            }
        }
        Ok(ClientMessage::RequestHistoricalPlayback {
            drone_id,
            start_time,
            end_time,
        }) => {
            let now = core.clock.now();
            let to = end_time.unwrap_or(now);
            let from = start_time.unwrap_or(to - chrono::Duration::hours(1));
            let samples = match core.persistence.range_trajectory(&drone_id, from, to).await {
                Ok(samples) => samples,
                Err(err) => {
                    tracing::warn!("Historical playback query failed: {}", err);
                    Vec::new()
                }
            };
            send_message(
                sender,
                &ServerMessage::HistoricalTrajectory { drone_id, samples },
            )
            .await?;
        }
        Ok(ClientMessage::ControlDrone {
            request_id,
            drone_id,
            command,
        }) => {
            let watchdog =
                Duration::from_secs_f64(core.config.coordination.driver_command_timeout_s);
            let (success, detail) =
                match tokio::time::timeout(watchdog, core.driver.command(&drone_id, command))
                    .await
                {
                    Ok(Ok(ack)) => (true, ack.detail),
                    Ok(Err(err)) => (false, err.to_string()),
                    Err(_) => (false, "driver watchdog expired".to_string()),
                };
            send_message(
                sender,
                &ServerMessage::ControlResponse {
                    request_id,
                    success,
                    detail,
                },
            )
            .await?;
        }
        Err(err) => {
            send_message(
                sender,
                &ServerMessage::ControlResponse {
                    request_id: None,
                    success: false,
                    detail: format!("unrecognized message: {err}"),
                },
            )
            .await?;
        }
    }
    Ok(())
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let Ok(text) = serde_json::to_string(message) else {
        return Ok(());
    };
    sender.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_control_message_flattens_command() {
        let parsed: ClientMessage = serde_json::from_str(
            r#"{"type":"control_drone","request_id":"r1","drone_id":"drone-1","command":"goto","lat":0.5,"lon":0.25,"altitude_m":12.0}"#,
        )
        .unwrap();
        let ClientMessage::ControlDrone {
            request_id,
            drone_id,
            command,
        } = parsed
        else {
            panic!("wrong variant");
        };
        assert_eq!(request_id.as_deref(), Some("r1"));
        assert_eq!(drone_id, "drone-1");
        assert_eq!(
            command,
            DriverCommand::Goto {
                lat: 0.5,
                lon: 0.25,
                altitude_m: 12.0
            }
        );
    }

    #[test]
    fn server_update_message_is_tagged() {
        let message = ServerMessage::Connected {
            server_time: chrono::Utc::now(),
            version: "1.0.0".to_string(),
        };
        let text = serde_json::to_string(&message).unwrap();
        assert!(text.contains(r#""type":"connected""#));
    }
}
