//! Snapshot composition and fan-out with per-subscriber coalescing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skygrid_core::clock::UpdateSequence;
use skygrid_core::{Conflict, VehicleState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::watch;

/// A point-in-time state + conflicts record fanned out to subscribers.
///
/// Vehicle states and conflicts in one snapshot come from the same tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub drones: Vec<VehicleState>,
    pub conflicts: Vec<Conflict>,
    pub update_id: u64,
}

struct Subscriber {
    id: u64,
    tx: watch::Sender<Option<Snapshot>>,
}

/// Handle returned to a subscriber; the watch receiver holds only the
/// newest pending snapshot, so a slow consumer sees coalesced updates and
/// never blocks the tick.
pub struct SubscriberHandle {
    pub id: u64,
    pub rx: watch::Receiver<Option<Snapshot>>,
}

#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    latest: RwLock<Option<Snapshot>>,
    sequence: UpdateSequence,
    next_subscriber_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> SubscriberHandle {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .push(Subscriber { id, tx });
        SubscriberHandle { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .retain(|s| s.id != id);
    }

    /// Compose the next snapshot and push it to every subscriber.
    /// update_ids are strictly increasing; a subscriber that has not
    /// drained the previous snapshot simply has it overwritten.
    pub fn publish(
        &self,
        timestamp: DateTime<Utc>,
        drones: Vec<VehicleState>,
        conflicts: Vec<Conflict>,
    ) -> Snapshot {
        let snapshot = Snapshot {
            timestamp,
            drones,
            conflicts,
            update_id: self.sequence.next(),
        };

        *self.latest.write().expect("latest lock") = Some(snapshot.clone());

        // Clone the sender list so the channel sends happen outside the
        // subscriber lock; disconnected receivers are swept afterwards.
        let senders: Vec<(u64, watch::Sender<Option<Snapshot>>)> = self
            .subscribers
            .lock()
            .expect("subscriber lock")
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in senders {
            if tx.send(Some(snapshot.clone())).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .expect("subscriber lock")
                .retain(|s| !dead.contains(&s.id));
        }

        snapshot
    }

    /// Most recent composed snapshot, for on-demand requests.
    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.read().expect("latest lock").clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock").len()
    }
}
