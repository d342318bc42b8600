//! Per-vehicle trajectory ring buffers.

use crate::models::TrajectorySample;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};

/// Append-only time-indexed store of live telemetry.
///
/// One ring buffer per vehicle, sized by wall-clock retention. Samples are
/// kept in non-decreasing timestamp order; `prune` is the only removal
/// path. DashMap sharding gives the single-writer-per-vehicle /
/// multi-reader discipline without a global lock.
pub struct TrajectoryStore {
    buffers: DashMap<String, VecDeque<TrajectorySample>>,
    retention: Duration,
    append_slack: Duration,
}

impl TrajectoryStore {
    pub fn new(retention_s: u64) -> Self {
        Self::with_slack(retention_s, 100)
    }

    pub fn with_slack(retention_s: u64, append_slack_ms: i64) -> Self {
        Self {
            buffers: DashMap::new(),
            retention: Duration::seconds(retention_s as i64),
            append_slack: Duration::milliseconds(append_slack_ms),
        }
    }

    /// Record one sample. Returns false when the sample is dropped for
    /// arriving more than the slack behind the buffer head. Jitter within
    /// the slack is clamped onto the head timestamp so per-vehicle
    /// ordering always holds.
    pub fn append(&self, mut sample: TrajectorySample) -> bool {
        let mut buffer = self.buffers.entry(sample.vehicle_id.clone()).or_default();
        if let Some(newest) = buffer.back() {
            if sample.timestamp < newest.timestamp {
                if newest.timestamp - sample.timestamp > self.append_slack {
                    return false;
                }
                sample.timestamp = newest.timestamp;
            }
        }
        buffer.push_back(sample);
        true
    }

    /// Most recent sample for a vehicle.
    pub fn latest(&self, vehicle_id: &str) -> Option<TrajectorySample> {
        self.buffers
            .get(vehicle_id)
            .and_then(|buffer| buffer.back().cloned())
    }

    /// Ordered samples within `[from, to]`.
    pub fn slice(
        &self,
        vehicle_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<TrajectorySample> {
        let Some(buffer) = self.buffers.get(vehicle_id) else {
            return Vec::new();
        };
        let start = lower_bound(&buffer, from);
        buffer
            .iter()
            .skip(start)
            .take_while(|s| s.timestamp <= to)
            .cloned()
            .collect()
    }

    /// Newest sample per vehicle, consistent within one call.
    pub fn latest_all(&self) -> HashMap<String, TrajectorySample> {
        self.buffers
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .back()
                    .map(|s| (entry.key().clone(), s.clone()))
            })
            .collect()
    }

    /// Drop samples older than the retention window. Returns the number
    /// removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut removed = 0;
        for mut entry in self.buffers.iter_mut() {
            let buffer = entry.value_mut();
            while buffer.front().is_some_and(|s| s.timestamp < cutoff) {
                buffer.pop_front();
                removed += 1;
            }
        }
        removed
    }

    /// Total retained samples across the fleet.
    pub fn sample_count(&self) -> usize {
        self.buffers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of vehicles with at least one retained sample.
    pub fn vehicle_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .count()
    }
}

/// Index of the first sample at or after `t` (binary search by ring index).
fn lower_bound(buffer: &VecDeque<TrajectorySample>, t: DateTime<Utc>) -> usize {
    let mut lo = 0;
    let mut hi = buffer.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if buffer[mid].timestamp < t {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(vehicle: &str, at: DateTime<Utc>, lon: f64) -> TrajectorySample {
        TrajectorySample {
            vehicle_id: vehicle.to_string(),
            timestamp: at,
            lat: 0.0,
            lon,
            altitude_m: 10.0,
            velocity_x: 0.0,
            velocity_y: 0.0,
            velocity_z: 0.0,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn appends_stay_ordered() {
        let store = TrajectoryStore::new(3600);
        let t0 = base_time();
        store.append(sample("d1", t0, 0.0));
        store.append(sample("d1", t0 + Duration::seconds(1), 0.001));
        store.append(sample("d1", t0 + Duration::seconds(2), 0.002));

        let all = store.slice("d1", t0, t0 + Duration::seconds(10));
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn stale_out_of_order_sample_is_dropped() {
        let store = TrajectoryStore::new(3600);
        let t0 = base_time();
        store.append(sample("d1", t0 + Duration::seconds(5), 0.0));
        assert!(!store.append(sample("d1", t0, 0.001)));
        assert_eq!(store.sample_count(), 1);
    }

    #[test]
    fn jitter_within_slack_is_clamped() {
        let store = TrajectoryStore::new(3600);
        let t0 = base_time();
        store.append(sample("d1", t0, 0.0));
        assert!(store.append(sample("d1", t0 - Duration::milliseconds(50), 0.001)));

        let all = store.slice("d1", t0 - Duration::seconds(1), t0 + Duration::seconds(1));
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].timestamp, t0);
    }

    #[test]
    fn slice_respects_bounds() {
        let store = TrajectoryStore::new(3600);
        let t0 = base_time();
        for i in 0..10 {
            store.append(sample("d1", t0 + Duration::seconds(i), i as f64 * 0.001));
        }
        let mid = store.slice("d1", t0 + Duration::seconds(3), t0 + Duration::seconds(6));
        assert_eq!(mid.len(), 4);
        assert_eq!(mid[0].timestamp, t0 + Duration::seconds(3));
        assert_eq!(mid.last().unwrap().timestamp, t0 + Duration::seconds(6));
    }

    #[test]
    fn prune_removes_only_expired_samples() {
        let store = TrajectoryStore::new(60);
        let t0 = base_time();
        store.append(sample("d1", t0, 0.0));
        store.append(sample("d1", t0 + Duration::seconds(120), 0.001));

        let removed = store.prune(t0 + Duration::seconds(130));
        assert_eq!(removed, 1);
        assert_eq!(store.latest("d1").unwrap().timestamp, t0 + Duration::seconds(120));
    }

    #[test]
    fn latest_all_returns_one_sample_per_vehicle() {
        let store = TrajectoryStore::new(3600);
        let t0 = base_time();
        store.append(sample("d1", t0, 0.0));
        store.append(sample("d1", t0 + Duration::seconds(1), 0.001));
        store.append(sample("d2", t0, 0.0));

        let latest = store.latest_all();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["d1"].timestamp, t0 + Duration::seconds(1));
    }
}
