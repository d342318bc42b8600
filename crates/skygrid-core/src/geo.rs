//! Geo math: distances, local offsets, and time-parameterized paths.

use crate::models::{TrajectorySample, Waypoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Horizontal range above which the equirectangular approximation is
/// abandoned for the Haversine form. Shared by every caller so that
/// distance results are deterministic across components.
pub const EQUIRECT_MAX_RANGE_M: f64 = 10_000.0;

/// Meters per degree of latitude at a given latitude (WGS84 approximation).
pub fn meters_per_deg_lat(lat_deg: f64) -> f64 {
    let lat_rad = lat_deg.to_radians();
    111_132.954 - 559.822 * (2.0 * lat_rad).cos() + 1.175 * (4.0 * lat_rad).cos()
        - 0.0023 * (6.0 * lat_rad).cos()
}

/// Meters per degree of longitude at a given latitude (WGS84 approximation).
pub fn meters_per_deg_lon(lat_deg: f64) -> f64 {
    let lat_rad = lat_deg.to_radians();
    111_412.84 * lat_rad.cos() - 93.5 * (3.0 * lat_rad).cos() + 0.118 * (5.0 * lat_rad).cos()
}

/// Great-circle distance between two points in meters (Haversine formula).
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Flat-plane distance projected to local meters; accurate at fleet scale.
fn equirectangular_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let x = (lon2 - lon1).to_radians() * mean_lat.cos();
    let y = (lat2 - lat1).to_radians();
    EARTH_RADIUS_M * (x * x + y * y).sqrt()
}

/// Horizontal distance in meters.
///
/// Uses the equirectangular projection within [`EQUIRECT_MAX_RANGE_M`] and
/// falls back to Haversine beyond it.
pub fn horizontal_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let flat = equirectangular_distance(lat1, lon1, lat2, lon2);
    if flat > EQUIRECT_MAX_RANGE_M {
        haversine_distance(lat1, lon1, lat2, lon2)
    } else {
        flat
    }
}

/// 3-D separation between two points: horizontal range combined with the
/// pure vertical component.
pub fn distance_3d_m(a: &Waypoint, b: &Waypoint) -> f64 {
    let horizontal = horizontal_distance_m(a.lat, a.lon, b.lat, b.lon);
    let vertical = a.altitude_m - b.altitude_m;
    (horizontal * horizontal + vertical * vertical).sqrt()
}

/// Offset a position by meters in the north and east directions.
pub fn offset_position(lat: f64, lon: f64, north_m: f64, east_m: f64) -> (f64, f64) {
    let lat_out = lat + north_m / meters_per_deg_lat(lat).max(1e-9);
    let lon_out = lon + east_m / meters_per_deg_lon(lat).max(1e-9);
    (lat_out, lon_out)
}

/// Total 3-D polyline length in meters.
pub fn path_length_m(waypoints: &[Waypoint]) -> f64 {
    waypoints
        .windows(2)
        .map(|pair| distance_3d_m(&pair[0], &pair[1]))
        .sum()
}

/// Project a live sample forward assuming constant velocity.
pub fn project_forward(sample: &TrajectorySample, dt_s: f64) -> Waypoint {
    let (lat, lon) = offset_position(
        sample.lat,
        sample.lon,
        sample.velocity_y * dt_s,
        sample.velocity_x * dt_s,
    );
    Waypoint {
        lat,
        lon,
        altitude_m: sample.altitude_m + sample.velocity_z * dt_s,
    }
}

/// A plan bound to a time window, parameterized equal-speed-per-leg.
///
/// At time `t` within the window, position is found by walking legs until
/// the consumed length equals `cruise_speed * (t - start)`, then linearly
/// interpolating within the current leg (altitude along the same
/// parameter). Outside the window, the nearest endpoint is returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedSegment {
    pub vehicle_id: String,
    pub waypoints: Vec<Waypoint>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl PlannedSegment {
    pub fn new(
        vehicle_id: impl Into<String>,
        waypoints: Vec<Waypoint>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            waypoints,
            start_time,
            end_time,
        }
    }

    pub fn from_mission(mission: &crate::models::Mission) -> Self {
        Self::new(
            mission.vehicle_id.clone(),
            mission.waypoints.clone(),
            mission.start_time,
            mission.end_time,
        )
    }

    pub fn path_length_m(&self) -> f64 {
        path_length_m(&self.waypoints)
    }

    pub fn duration_s(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Cruise speed derived from path length over the window.
    pub fn cruise_speed_mps(&self) -> f64 {
        let duration = self.duration_s();
        if duration <= 0.0 {
            return 0.0;
        }
        self.path_length_m() / duration
    }

    /// Position at time `t`, clamped to the nearest endpoint outside the
    /// window. Returns `None` only for an empty plan.
    pub fn position_at(&self, t: DateTime<Utc>) -> Option<Waypoint> {
        let first = *self.waypoints.first()?;
        let last = *self.waypoints.last()?;

        if t <= self.start_time {
            return Some(first);
        }
        if t >= self.end_time {
            return Some(last);
        }

        let total = self.path_length_m();
        if total <= f64::EPSILON {
            return Some(first);
        }

        let elapsed = (t - self.start_time).num_milliseconds() as f64 / 1000.0;
        let mut remaining = self.cruise_speed_mps() * elapsed;

        for pair in self.waypoints.windows(2) {
            let leg = distance_3d_m(&pair[0], &pair[1]);
            if leg <= f64::EPSILON {
                continue;
            }
            if remaining <= leg {
                let f = remaining / leg;
                return Some(Waypoint {
                    lat: pair[0].lat + (pair[1].lat - pair[0].lat) * f,
                    lon: pair[0].lon + (pair[1].lon - pair[0].lon) * f,
                    altitude_m: pair[0].altitude_m + (pair[1].altitude_m - pair[0].altitude_m) * f,
                });
            }
            remaining -= leg;
        }

        Some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

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

    #[test]
    fn haversine_known_distance() {
        // ~111km between these points (1 degree latitude)
        let dist = haversine_distance(0.0, 0.0, 1.0, 0.0);
        assert!((dist - 111_194.0).abs() < 100.0);
    }

    #[test]
    fn equirectangular_agrees_with_haversine_at_fleet_scale() {
        let flat = horizontal_distance_m(0.0, 0.0, 0.0, 0.001);
        let exact = haversine_distance(0.0, 0.0, 0.0, 0.001);
        assert!((flat - exact).abs() < 0.1, "{flat} vs {exact}");
    }

    #[test]
    fn long_range_falls_back_to_haversine() {
        // 1 degree of longitude at the equator is well past the threshold.
        let dist = horizontal_distance_m(0.0, 0.0, 0.0, 1.0);
        let exact = haversine_distance(0.0, 0.0, 0.0, 1.0);
        assert!((dist - exact).abs() < 1.0);
    }

    #[test]
    fn vertical_separation_contributes_to_distance() {
        let a = wp(0.0, 0.0, 10.0);
        let b = wp(0.0, 0.0, 40.0);
        assert!((distance_3d_m(&a, &b) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn position_clamps_outside_window() {
        let seg = PlannedSegment::new(
            "d1",
            vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 10.0)],
            base_time(),
            base_time() + Duration::seconds(60),
        );
        let before = seg.position_at(base_time() - Duration::seconds(5)).unwrap();
        let after = seg.position_at(base_time() + Duration::seconds(65)).unwrap();
        assert_eq!(before, wp(0.0, 0.0, 10.0));
        assert_eq!(after, wp(0.0, 0.001, 10.0));
    }

    #[test]
    fn midpoint_of_single_leg() {
        let seg = PlannedSegment::new(
            "d1",
            vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.001, 20.0)],
            base_time(),
            base_time() + Duration::seconds(60),
        );
        let mid = seg.position_at(base_time() + Duration::seconds(30)).unwrap();
        assert!((mid.lon - 0.0005).abs() < 1e-7);
        assert!((mid.altitude_m - 15.0).abs() < 0.01);
    }

    #[test]
    fn unequal_legs_split_time_by_length() {
        // First leg is twice as long as the second: the vehicle reaches the
        // middle waypoint at 2/3 of the window under equal-speed pacing.
        let seg = PlannedSegment::new(
            "d1",
            vec![wp(0.0, 0.0, 10.0), wp(0.0, 0.002, 10.0), wp(0.0, 0.003, 10.0)],
            base_time(),
            base_time() + Duration::seconds(90),
        );
        let at_knee = seg.position_at(base_time() + Duration::seconds(60)).unwrap();
        assert!((at_knee.lon - 0.002).abs() < 1e-6);
    }

    #[test]
    fn projection_moves_with_velocity() {
        let sample = TrajectorySample {
            vehicle_id: "d1".to_string(),
            timestamp: base_time(),
            lat: 0.0,
            lon: 0.0,
            altitude_m: 10.0,
            velocity_x: 0.0,
            velocity_y: 5.0,
            velocity_z: 0.0,
        };
        let ahead = project_forward(&sample, 10.0);
        let moved = horizontal_distance_m(0.0, 0.0, ahead.lat, ahead.lon);
        assert!((moved - 50.0).abs() < 0.5);
    }
}
