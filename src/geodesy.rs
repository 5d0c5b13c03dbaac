// Geodesy module - great-circle distances and coordinate normalization
//
// Spherical Earth model only. Field positions come from phone-grade or
// consumer GPS receivers, so the ~0.5% error of the sphere is far below
// the sensor noise we filter for.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::constants::{COORD_DECIMALS, EARTH_RADIUS_M};

/// Degrees to radians conversion factor
const DTOR: f64 = PI / 180.0;

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Coordinate { lat, lng }
    }

    /// Same point with both axes rounded to `COORD_DECIMALS` places.
    pub fn rounded(self) -> Self {
        Coordinate {
            lat: round_coord(self.lat),
            lng: round_coord(self.lng),
        }
    }

    /// True when the pair is finite, non-zero and inside the WGS84 ranges.
    ///
    /// (0, 0) is treated as "no position": backends store it as the default
    /// for actors that never reported.
    pub fn is_plausible(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && !(self.lat == 0.0 && self.lng == 0.0)
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Rounds a coordinate to 6 decimal places
///
/// Applied to every value before it is compared or transmitted so that
/// floating-point noise never shows up as movement.
#[inline]
pub fn round_coord(value: f64) -> f64 {
    let scale = 10f64.powi(COORD_DECIMALS);
    (value * scale).round() / scale
}

/// Returns great-circle distance in meters between two lat/lon points (haversine)
///
/// # Arguments
/// * `lat1`, `lon1` - First point in degrees
/// * `lat2`, `lon2` - Second point in degrees
///
/// # Example
/// ```
/// use fieldtrack::geodesy::haversine;
/// let d = haversine(51.5074, -0.1278, 48.8566, 2.3522); // London to Paris
/// assert!((d - 343_500.0).abs() < 5_000.0);
/// ```
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1) * DTOR;
    let dlon = (lon2 - lon1) * DTOR;

    let a = (dlat / 2.0).sin().powi(2)
        + (lat1 * DTOR).cos() * (lat2 * DTOR).cos() * (dlon / 2.0).sin().powi(2);

    // Clamp guards asin against a > 1.0 from rounding on antipodal points
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Distance in meters between two possibly-unknown points
///
/// Any missing or non-finite coordinate yields `f64::INFINITY`, which callers
/// treat as "definitely moved".
///
/// # Example
/// ```
/// use fieldtrack::geodesy::distance;
/// assert_eq!(distance(None, None, Some(31.5), Some(74.3)), f64::INFINITY);
/// ```
pub fn distance(lat1: Option<f64>, lon1: Option<f64>, lat2: Option<f64>, lon2: Option<f64>) -> f64 {
    match (lat1, lon1, lat2, lon2) {
        (Some(a), Some(b), Some(c), Some(d))
            if a.is_finite() && b.is_finite() && c.is_finite() && d.is_finite() =>
        {
            haversine(a, b, c, d)
        }
        _ => f64::INFINITY,
    }
}
