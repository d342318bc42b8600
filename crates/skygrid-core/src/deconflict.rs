//! Spatio-temporal deconfliction of candidate missions.
//!
//! The engine is pure over a registry snapshot plus a live-telemetry
//! snapshot: callers take the admission lock, collect both, and evaluate.
//! Sampling with bisection refinement is used instead of closed-form
//! segment minimum distance because plans are piecewise-linear with
//! independent time parameterizations per vehicle.

use crate::config::CoordinationConfig;
use crate::error::CoreError;
use crate::geo::{self, PlannedSegment};
use crate::models::{
    Conflict, ConflictKind, ConflictSeverity, Mission, TrajectorySample, Waypoint,
};
use crate::monitor::LIVE_STALENESS_SECS;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// A mission request before admission.
#[derive(Debug, Clone)]
pub struct MissionCandidate {
    pub vehicle_id: String,
    pub waypoints: Vec<Waypoint>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl MissionCandidate {
    pub fn from_mission(mission: &Mission) -> Self {
        Self {
            vehicle_id: mission.vehicle_id.clone(),
            waypoints: mission.waypoints.clone(),
            start_time: mission.start_time,
            end_time: mission.end_time,
        }
    }

    fn segment(&self) -> PlannedSegment {
        PlannedSegment::new(
            self.vehicle_id.clone(),
            self.waypoints.clone(),
            self.start_time,
            self.end_time,
        )
    }
}

/// Outcome of one deconfliction evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub safe: bool,
    pub conflicts: Vec<Conflict>,
}

impl Evaluation {
    fn from_conflicts(conflicts: Vec<Conflict>) -> Self {
        Self {
            safe: conflicts.is_empty(),
            conflicts,
        }
    }
}

pub struct DeconflictionEngine {
    safety_buffer_m: f64,
    resolution_s: f64,
    projection_horizon_s: f64,
    max_cruise_speed_mps: f64,
    altitude_floor_m: f64,
}

impl DeconflictionEngine {
    pub fn new(config: &CoordinationConfig) -> Self {
        Self {
            safety_buffer_m: config.safety_buffer_m,
            resolution_s: config.deconflict_resolution_s,
            projection_horizon_s: config.projection_horizon_s,
            max_cruise_speed_mps: config.max_cruise_speed_mps,
            altitude_floor_m: config.altitude_floor_m,
        }
    }

    /// Full admission evaluation of a candidate against the registry
    /// snapshot and live state.
    pub fn evaluate(
        &self,
        candidate: &MissionCandidate,
        missions: &[Mission],
        live: &HashMap<String, TrajectorySample>,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, CoreError> {
        self.validate(candidate)?;

        let mut conflicts = Vec::new();
        conflicts.extend(self.altitude_advisory(candidate));
        conflicts.extend(self.exclusivity_conflicts(candidate, missions));
        conflicts.extend(self.planned_conflicts(candidate, missions));
        conflicts.extend(self.projected_live_conflicts(candidate, missions, live, now));

        Ok(Evaluation::from_conflicts(conflicts))
    }

    /// Second pass run at dispatch time. Only conflicts involving live
    /// traffic can have appeared since admission, so planned and
    /// exclusivity checks are skipped.
    pub fn evaluate_live(
        &self,
        candidate: &MissionCandidate,
        missions: &[Mission],
        live: &HashMap<String, TrajectorySample>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        Evaluation::from_conflicts(self.projected_live_conflicts(candidate, missions, live, now))
    }

    fn validate(&self, candidate: &MissionCandidate) -> Result<(), CoreError> {
        if candidate.waypoints.is_empty() {
            return Err(CoreError::InvalidPlan("plan has no waypoints".to_string()));
        }
        if candidate.end_time <= candidate.start_time {
            return Err(CoreError::InvalidWindow(format!(
                "end {} is not after start {}",
                candidate.end_time, candidate.start_time
            )));
        }
        let speed = candidate.segment().cruise_speed_mps();
        if speed > self.max_cruise_speed_mps {
            return Err(CoreError::InvalidSpeed {
                speed_mps: speed,
                limit_mps: self.max_cruise_speed_mps,
            });
        }
        Ok(())
    }

    /// Non-spatial advisory for waypoints below the altitude floor.
    fn altitude_advisory(&self, candidate: &MissionCandidate) -> Option<Conflict> {
        let lowest = candidate
            .waypoints
            .iter()
            .map(|w| w.altitude_m)
            .fold(f64::INFINITY, f64::min);
        (lowest < self.altitude_floor_m).then(|| Conflict {
            kind: ConflictKind::Altitude,
            vehicle_a: candidate.vehicle_id.clone(),
            vehicle_b: None,
            time_from: candidate.start_time,
            time_to: candidate.end_time,
            min_distance_m: lowest,
            severity: ConflictSeverity::Warning,
        })
    }

    /// At most one mission may occupy a vehicle's time window.
    fn exclusivity_conflicts(
        &self,
        candidate: &MissionCandidate,
        missions: &[Mission],
    ) -> Vec<Conflict> {
        missions
            .iter()
            .filter(|m| {
                m.is_active()
                    && m.vehicle_id == candidate.vehicle_id
                    && m.window_overlaps(candidate.start_time, candidate.end_time)
            })
            .map(|m| Conflict {
                kind: ConflictKind::Exclusivity,
                vehicle_a: candidate.vehicle_id.clone(),
                vehicle_b: Some(candidate.vehicle_id.clone()),
                time_from: candidate.start_time.max(m.start_time),
                time_to: candidate.end_time.min(m.end_time),
                min_distance_m: 0.0,
                severity: ConflictSeverity::Critical,
            })
            .collect()
    }

    fn planned_conflicts(&self, candidate: &MissionCandidate, missions: &[Mission]) -> Vec<Conflict> {
        let candidate_seg = candidate.segment();
        let mut conflicts = Vec::new();

        for mission in missions {
            if !mission.is_active()
                || mission.vehicle_id == candidate.vehicle_id
                || !mission.window_overlaps(candidate.start_time, candidate.end_time)
            {
                continue;
            }

            let other = PlannedSegment::from_mission(mission);
            let hi = candidate.end_time.min(other.end_time);
            let boundaries = [candidate.start_time.max(other.start_time), hi];
            if let Some((from, to, min_d)) = self.closest_approach(
                candidate.start_time,
                hi,
                &boundaries,
                |t| candidate_seg.position_at(t),
                |t| other.position_at(t),
            ) {
                conflicts.push(Conflict {
                    kind: ConflictKind::Planned,
                    vehicle_a: candidate.vehicle_id.clone(),
                    vehicle_b: Some(mission.vehicle_id.clone()),
                    time_from: from,
                    time_to: to,
                    min_distance_m: min_d,
                    severity: ConflictSeverity::from_distance(min_d, self.safety_buffer_m),
                });
            }
        }

        conflicts
    }

    /// Vehicles with no active mission but fresh telemetry are projected
    /// forward at constant velocity for the configured horizon.
    fn projected_live_conflicts(
        &self,
        candidate: &MissionCandidate,
        missions: &[Mission],
        live: &HashMap<String, TrajectorySample>,
        now: DateTime<Utc>,
    ) -> Vec<Conflict> {
        let candidate_seg = candidate.segment();
        let mut conflicts = Vec::new();

        let mut vehicles: Vec<&String> = live.keys().collect();
        vehicles.sort();

        for vehicle_id in vehicles {
            if *vehicle_id == candidate.vehicle_id {
                continue;
            }
            if missions
                .iter()
                .any(|m| m.is_active() && m.vehicle_id == *vehicle_id)
            {
                continue;
            }

            let sample = &live[vehicle_id];
            let age_s = seconds_between(sample.timestamp, now);
            if age_s > LIVE_STALENESS_SECS {
                continue;
            }

            let horizon_end = sample.timestamp + secs_to_duration(self.projection_horizon_s);
            let lo = candidate.start_time.max(sample.timestamp);
            let hi = candidate.end_time.min(horizon_end);
            if hi <= lo {
                continue;
            }

            let origin = sample.clone();
            let origin_ts = origin.timestamp;
            if let Some((from, to, min_d)) = self.closest_approach(
                lo,
                hi,
                &[lo, hi],
                |t| candidate_seg.position_at(t),
                move |t| Some(geo::project_forward(&origin, seconds_between(origin_ts, t))),
            ) {
                conflicts.push(Conflict {
                    kind: ConflictKind::Mixed,
                    vehicle_a: candidate.vehicle_id.clone(),
                    vehicle_b: Some(vehicle_id.clone()),
                    time_from: from,
                    time_to: to,
                    min_distance_m: min_d,
                    severity: ConflictSeverity::from_distance(min_d, self.safety_buffer_m),
                });
            }
        }

        conflicts
    }

    /// Sample the pairwise distance over `[lo, hi]` at the configured
    /// resolution plus the given boundary instants. When the minimum dips
    /// below the buffer, the violation interval endpoints are refined by
    /// bisection to a tenth of the resolution.
    fn closest_approach(
        &self,
        lo: DateTime<Utc>,
        hi: DateTime<Utc>,
        boundaries: &[DateTime<Utc>],
        pos_a: impl Fn(DateTime<Utc>) -> Option<Waypoint>,
        pos_b: impl Fn(DateTime<Utc>) -> Option<Waypoint>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>, f64)> {
        if hi < lo {
            return None;
        }

        let step = secs_to_duration(self.resolution_s);
        let mut times: Vec<DateTime<Utc>> = Vec::new();
        let mut t = lo;
        while t < hi {
            times.push(t);
            t = t + step;
        }
        times.push(hi);
        for boundary in boundaries {
            if *boundary >= lo && *boundary <= hi {
                times.push(*boundary);
            }
        }
        times.sort();
        times.dedup();

        let distance_at =
            |t: DateTime<Utc>| -> Option<f64> { Some(geo::distance_3d_m(&pos_a(t)?, &pos_b(t)?)) };

        let mut min_d = f64::INFINITY;
        let mut first_violation = None;
        let mut last_violation = None;
        for (i, t) in times.iter().enumerate() {
            let d = distance_at(*t)?;
            if d < min_d {
                min_d = d;
            }
            if d < self.safety_buffer_m {
                if first_violation.is_none() {
                    first_violation = Some(i);
                }
                last_violation = Some(i);
            }
        }

        let first = first_violation?;
        let last = last_violation.expect("violation set is non-empty");

        let entry = if first == 0 {
            times[first]
        } else {
            self.bisect_crossing(times[first - 1], times[first], &distance_at)
        };
        let exit = if last == times.len() - 1 {
            times[last]
        } else {
            self.bisect_crossing(times[last + 1], times[last], &distance_at)
        };

        Some((entry, exit, min_d))
    }

    /// Bisect between a safe instant and a violating one until their gap is
    /// below a tenth of the resolution; returns the violating-side bound.
    fn bisect_crossing(
        &self,
        mut safe: DateTime<Utc>,
        mut violating: DateTime<Utc>,
        distance_at: &impl Fn(DateTime<Utc>) -> Option<f64>,
    ) -> DateTime<Utc> {
        let precision =
            secs_to_duration(self.resolution_s * 0.1).max(Duration::milliseconds(1));
        loop {
            let gap = if safe > violating {
                safe - violating
            } else {
                violating - safe
            };
            if gap <= precision {
                return violating;
            }
            let mid = safe + (violating - safe) / 2;
            match distance_at(mid) {
                Some(d) if d < self.safety_buffer_m => violating = mid,
                Some(_) => safe = mid,
                None => return violating,
            }
        }
    }
}

fn secs_to_duration(s: f64) -> Duration {
    Duration::milliseconds((s * 1000.0).round() as i64)
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MissionState;
    use chrono::TimeZone;

    fn wp(lat: f64, lon: f64, alt: f64) -> Waypoint {
        Waypoint {
            lat,
            lon,
            altitude_m: alt,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn engine() -> DeconflictionEngine {
        DeconflictionEngine::new(&CoordinationConfig::default())
    }

    fn candidate(
        vehicle: &str,
        waypoints: Vec<Waypoint>,
        start_s: i64,
        end_s: i64,
    ) -> MissionCandidate {
        MissionCandidate {
            vehicle_id: vehicle.to_string(),
            waypoints,
            start_time: base_time() + Duration::seconds(start_s),
            end_time: base_time() + Duration::seconds(end_s),
        }
    }

    fn mission(vehicle: &str, waypoints: Vec<Waypoint>, start_s: i64, end_s: i64) -> Mission {
        Mission {
            mission_id: format!("m-{vehicle}-{start_s}"),
            vehicle_id: vehicle.to_string(),
            waypoints,
            start_time: base_time() + Duration::seconds(start_s),
            end_time: base_time() + Duration::seconds(end_s),
            state: MissionState::Scheduled,
            fail_reason: None,
            created_at: base_time(),
        }
    }

    fn sample(vehicle: &str, at: DateTime<Utc>, pos: Waypoint, vel: (f64, f64, f64)) -> TrajectorySample {
        TrajectorySample {
            vehicle_id: vehicle.to_string(),
            timestamp: at,
            lat: pos.lat,
            lon: pos.lon,
            altitude_m: pos.altitude_m,
            velocity_x: vel.0,
            velocity_y: vel.1,
            velocity_z: vel.2,
        }
    }

    #[test]
    fn head_on_plans_are_rejected() {
        let eng = engine();
        let existing = mission("d1", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 10.0)], 10, 70);
        let incoming = candidate("d2", vec![wp(0.0, 0.001, 10.0), wp(0.0, 0.0, 10.0)], 10, 70);

        let eval = eng
            .evaluate(&incoming, &[existing], &HashMap::new(), base_time())
            .unwrap();

        assert!(!eval.safe);
        assert_eq!(eval.conflicts.len(), 1);
        let conflict = &eval.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::Planned);
        assert!(conflict.min_distance_m < 1.0);
        assert_eq!(conflict.severity, ConflictSeverity::Critical);
        assert!(conflict.time_from >= base_time() + Duration::seconds(10));
        assert!(conflict.time_to <= base_time() + Duration::seconds(70));
    }

    #[test]
    fn laterally_separated_plans_are_safe() {
        let eng = engine();
        // ~111 m of lateral separation against a 10 m buffer.
        let existing = mission("d1", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.005, 10.0)], 0, 60);
        let incoming = candidate("d2", vec![wp(0.001, 0.0, 10.0), wp(0.001, 0.005, 10.0)], 0, 60);

        let eval = eng
            .evaluate(&incoming, &[existing], &HashMap::new(), base_time())
            .unwrap();

        assert!(eval.safe, "unexpected conflicts: {:?}", eval.conflicts);
    }

    #[test]
    fn same_vehicle_overlap_is_exclusivity_only() {
        let eng = engine();
        let existing = mission("d1", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 10.0)], 0, 60);
        let incoming = candidate("d1", vec![wp(0.0, 0.002, 10.0), wp(0.0, 0.003, 10.0)], 30, 90);

        let eval = eng
            .evaluate(&incoming, &[existing], &HashMap::new(), base_time())
            .unwrap();

        assert!(!eval.safe);
        assert_eq!(eval.conflicts.len(), 1);
        assert_eq!(eval.conflicts[0].kind, ConflictKind::Exclusivity);
    }

    #[test]
    fn tangential_contact_at_exactly_buffer_is_safe() {
        let eng = engine();
        // Identical horizontal path, altitudes exactly one buffer apart.
        let existing = mission("d1", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 10.0)], 0, 60);
        let incoming = candidate("d2", vec![wp(0.0, 0.0, 20.0), wp(0.0, 0.001, 20.0)], 0, 60);

        let eval = eng
            .evaluate(&incoming, &[existing], &HashMap::new(), base_time())
            .unwrap();

        assert!(eval.safe, "unexpected conflicts: {:?}", eval.conflicts);
    }

    #[test]
    fn sub_resolution_window_still_samples_endpoints() {
        let eng = engine();
        let existing = mission("d1", vec![wp(0.0, 0.0, 10.0)], 0, 1);
        let mut incoming = candidate("d2", vec![wp(0.0, 0.0, 10.0)], 0, 1);
        // 200 ms window, below the 500 ms resolution.
        incoming.end_time = incoming.start_time + Duration::milliseconds(200);

        let eval = eng
            .evaluate(&incoming, &[existing], &HashMap::new(), base_time())
            .unwrap();

        assert!(!eval.safe);
        assert_eq!(eval.conflicts[0].kind, ConflictKind::Planned);
    }

    #[test]
    fn empty_plan_is_invalid() {
        let eng = engine();
        let incoming = candidate("d2", vec![], 0, 60);
        let err = eng
            .evaluate(&incoming, &[], &HashMap::new(), base_time())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPlan(_)));
    }

    #[test]
    fn reversed_window_is_invalid() {
        let eng = engine();
        let incoming = candidate("d2", vec![wp(0.0, 0.0, 10.0)], 60, 0);
        let err = eng
            .evaluate(&incoming, &[], &HashMap::new(), base_time())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidWindow(_)));
    }

    #[test]
    fn excessive_cruise_speed_is_invalid() {
        let eng = engine();
        // ~1.1 km in 10 seconds.
        let incoming = candidate("d2", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.01, 10.0)], 0, 10);
        let err = eng
            .evaluate(&incoming, &[], &HashMap::new(), base_time())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSpeed { .. }));
    }

    #[test]
    fn low_altitude_waypoint_raises_advisory() {
        let eng = engine();
        let incoming = candidate("d2", vec![wp(0.0, 0.0, 1.0), wp(0.0, 0.001, 10.0)], 0, 60);
        let eval = eng
            .evaluate(&incoming, &[], &HashMap::new(), base_time())
            .unwrap();
        assert!(!eval.safe);
        assert_eq!(eval.conflicts[0].kind, ConflictKind::Altitude);
        assert_eq!(eval.conflicts[0].severity, ConflictSeverity::Warning);
    }

    #[test]
    fn unplanned_live_vehicle_in_path_raises_mixed_conflict() {
        let eng = engine();
        let incoming = candidate("d1", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 10.0)], 2, 62);

        // d2 hovers 5 m above the candidate's first waypoint, no mission.
        let mut live = HashMap::new();
        live.insert(
            "d2".to_string(),
            sample("d2", base_time(), wp(0.0, 0.0, 15.0), (0.0, 0.0, 0.0)),
        );

        let eval = eng.evaluate(&incoming, &[], &live, base_time()).unwrap();
        assert!(!eval.safe);
        assert_eq!(eval.conflicts[0].kind, ConflictKind::Mixed);
    }

    #[test]
    fn stale_live_sample_is_ignored() {
        let eng = engine();
        let incoming = candidate("d1", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 10.0)], 2, 62);

        let mut live = HashMap::new();
        live.insert(
            "d2".to_string(),
            sample(
                "d2",
                base_time() - Duration::seconds(10),
                wp(0.0, 0.0, 15.0),
                (0.0, 0.0, 0.0),
            ),
        );

        let eval = eng.evaluate(&incoming, &[], &live, base_time()).unwrap();
        assert!(eval.safe);
    }

    #[test]
    fn vehicle_with_active_mission_is_not_projected() {
        let eng = engine();
        let existing = mission("d2", vec![wp(0.01, 0.01, 50.0), wp(0.01, 0.02, 50.0)], 0, 60);
        let incoming = candidate("d1", vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 10.0)], 2, 62);

        // d2 has live telemetry in the candidate's path but is covered by
        // the planned check against its (distant) mission instead.
        let mut live = HashMap::new();
        live.insert(
            "d2".to_string(),
            sample("d2", base_time(), wp(0.0, 0.0, 15.0), (0.0, 0.0, 0.0)),
        );

        let eval = eng
            .evaluate(&incoming, &[existing], &live, base_time())
            .unwrap();
        assert!(eval.safe, "unexpected conflicts: {:?}", eval.conflicts);
    }
}
