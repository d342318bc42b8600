//! Realtime pairwise proximity monitor with alert de-duplication.

use crate::config::CoordinationConfig;
use crate::geo;
use crate::models::{Conflict, ConflictKind, ConflictSeverity, TrajectorySample, Waypoint};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Samples older than this are excluded from the scan and from forward
/// projection of unplanned traffic.
pub const LIVE_STALENESS_SECS: f64 = 2.0;

/// Result of one monitor tick.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Every pair currently below the buffer; consumed by the broadcaster.
    pub conflicts: Vec<Conflict>,
    /// Edge-triggered subset: initial sightings and periodic reminders.
    pub alerts: Vec<Conflict>,
}

#[derive(Debug)]
struct PairTrack {
    last_in_conflict: DateTime<Utc>,
    last_alert: DateTime<Utc>,
}

/// Periodic scanner over current telemetry.
///
/// The de-dup table is owned by the monitor and has no external access: a
/// pair that stays in conflict gets one initial alert plus reminders at
/// `dedup_reminder_s`; a conflict-free gap of `dedup_clear_s` clears it.
pub struct LiveMonitor {
    safety_buffer_m: f64,
    staleness: Duration,
    reminder_interval: Duration,
    clear_after: Duration,
    pairs: HashMap<(String, String), PairTrack>,
}

impl LiveMonitor {
    pub fn new(config: &CoordinationConfig) -> Self {
        Self {
            safety_buffer_m: config.safety_buffer_m,
            staleness: Duration::milliseconds((LIVE_STALENESS_SECS * 1000.0) as i64),
            reminder_interval: Duration::milliseconds((config.dedup_reminder_s * 1000.0) as i64),
            clear_after: Duration::milliseconds((config.dedup_clear_s * 1000.0) as i64),
            pairs: HashMap::new(),
        }
    }

    /// Scan one `latest_all` snapshot.
    pub fn scan(
        &mut self,
        latest: &HashMap<String, TrajectorySample>,
        now: DateTime<Utc>,
    ) -> ScanOutcome {
        let mut fresh: Vec<&TrajectorySample> = latest
            .values()
            .filter(|s| now - s.timestamp <= self.staleness)
            .collect();
        fresh.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));

        let mut outcome = ScanOutcome::default();

        for i in 0..fresh.len() {
            for j in (i + 1)..fresh.len() {
                let a = fresh[i];
                let b = fresh[j];
                let distance = geo::distance_3d_m(&position_of(a), &position_of(b));
                if distance > self.safety_buffer_m {
                    continue;
                }

                let conflict = Conflict {
                    kind: ConflictKind::Live,
                    vehicle_a: a.vehicle_id.clone(),
                    vehicle_b: Some(b.vehicle_id.clone()),
                    time_from: now,
                    time_to: now,
                    min_distance_m: distance,
                    severity: ConflictSeverity::from_distance(distance, self.safety_buffer_m),
                };

                let key = (a.vehicle_id.clone(), b.vehicle_id.clone());
                match self.pairs.get_mut(&key) {
                    None => {
                        self.pairs.insert(
                            key,
                            PairTrack {
                                last_in_conflict: now,
                                last_alert: now,
                            },
                        );
                        outcome.alerts.push(conflict.clone());
                    }
                    Some(track) => {
                        track.last_in_conflict = now;
                        if now - track.last_alert >= self.reminder_interval {
                            track.last_alert = now;
                            outcome.alerts.push(conflict.clone());
                        }
                    }
                }

                outcome.conflicts.push(conflict);
            }
        }

        let clear_after = self.clear_after;
        self.pairs
            .retain(|_, track| now - track.last_in_conflict < clear_after);

        outcome
    }

    /// Pairs currently tracked by the de-dup table.
    pub fn tracked_pairs(&self) -> usize {
        self.pairs.len()
    }
}

fn position_of(sample: &TrajectorySample) -> Waypoint {
    Waypoint {
        lat: sample.lat,
        lon: sample.lon,
        altitude_m: sample.altitude_m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn sample_at(vehicle: &str, at: DateTime<Utc>, east_m: f64) -> TrajectorySample {
        let (lat, lon) = geo::offset_position(0.0, 0.0, 0.0, east_m);
        TrajectorySample {
            vehicle_id: vehicle.to_string(),
            timestamp: at,
            lat,
            lon,
            altitude_m: 10.0,
            velocity_x: 0.0,
            velocity_y: 0.0,
            velocity_z: 0.0,
        }
    }

    fn snapshot(at: DateTime<Utc>, separation_m: f64) -> HashMap<String, TrajectorySample> {
        let mut map = HashMap::new();
        map.insert("d1".to_string(), sample_at("d1", at, 0.0));
        map.insert("d2".to_string(), sample_at("d2", at, separation_m));
        map
    }

    #[test]
    fn close_pair_emits_initial_alert_and_reminder_then_clears() {
        let mut monitor = LiveMonitor::new(&CoordinationConfig::default());
        let t0 = base_time();
        let tick = Duration::milliseconds(500);

        // 8 m apart for 7 seconds, then 30 m apart: expect exactly two
        // alerts (initial + one reminder at t=5) and the pair cleared
        // three seconds after the last sighting.
        let mut alerts = 0;
        let mut now = t0;
        while now <= t0 + Duration::seconds(7) {
            let outcome = monitor.scan(&snapshot(now, 8.0), now);
            alerts += outcome.alerts.len();
            assert_eq!(outcome.conflicts.len(), 1);
            now = now + tick;
        }
        assert_eq!(alerts, 2);

        while now <= t0 + Duration::seconds(12) {
            let outcome = monitor.scan(&snapshot(now, 30.0), now);
            assert!(outcome.conflicts.is_empty());
            assert!(outcome.alerts.is_empty());
            if now >= t0 + Duration::seconds(10) + tick {
                assert_eq!(monitor.tracked_pairs(), 0);
            }
            now = now + tick;
        }
    }

    #[test]
    fn stale_samples_are_excluded() {
        let mut monitor = LiveMonitor::new(&CoordinationConfig::default());
        let t0 = base_time();

        let mut map = HashMap::new();
        map.insert("d1".to_string(), sample_at("d1", t0, 0.0));
        map.insert(
            "d2".to_string(),
            sample_at("d2", t0 - Duration::seconds(5), 4.0),
        );

        let outcome = monitor.scan(&map, t0);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn cleared_pair_realerts_on_next_conflict() {
        let mut monitor = LiveMonitor::new(&CoordinationConfig::default());
        let t0 = base_time();

        let first = monitor.scan(&snapshot(t0, 5.0), t0);
        assert_eq!(first.alerts.len(), 1);

        // Gap longer than the clear interval.
        let t1 = t0 + Duration::seconds(4);
        let gap = monitor.scan(&snapshot(t1, 50.0), t1);
        assert!(gap.alerts.is_empty());
        assert_eq!(monitor.tracked_pairs(), 0);

        let t2 = t1 + Duration::seconds(1);
        let again = monitor.scan(&snapshot(t2, 5.0), t2);
        assert_eq!(again.alerts.len(), 1);
    }

    #[test]
    fn severity_reflects_distance() {
        let mut monitor = LiveMonitor::new(&CoordinationConfig::default());
        let t0 = base_time();

        let close = monitor.scan(&snapshot(t0, 3.0), t0);
        assert_eq!(close.conflicts[0].severity, ConflictSeverity::Critical);

        let t1 = t0 + Duration::seconds(10);
        let near = monitor.scan(&snapshot(t1, 8.0), t1);
        assert_eq!(near.conflicts[0].severity, ConflictSeverity::Warning);
    }
}
