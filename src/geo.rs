//! Great-circle math on WGS84 coordinates.

use chrono::{DateTime, Utc};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default dedup threshold in meters
pub const DEFAULT_SAME_LOCATION_M: f64 = 50.0;

/// Haversine distance in meters between two points given in degrees.
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if lat1 == lat2 && lon1 == lon2 {
        return 0.0;
    }

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    // Rounding can push `a` just past 1 for antipodal points
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// True iff the two points are strictly closer than `threshold_m`.
pub fn is_same_location(lat1: f64, lon1: f64, lat2: f64, lon2: f64, threshold_m: f64) -> bool {
    distance(lat1, lon1, lat2, lon2) < threshold_m
}

/// Average speed in km/h between two timestamped points.
///
/// Returns 0 when `t2` is not after `t1`, so duplicate or out-of-order
/// timestamps never produce an error or an infinite speed.
pub fn speed_kmh(
    lat1: f64,
    lon1: f64,
    t1: DateTime<Utc>,
    lat2: f64,
    lon2: f64,
    t2: DateTime<Utc>,
) -> f64 {
    let elapsed = (t2 - t1).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return 0.0;
    }
    distance(lat1, lon1, lat2, lon2) / elapsed * 3.6
}
