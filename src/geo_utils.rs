//! # Geographic Utilities
//!
//! Distance computations used by the trajectory simplifier.
//!
//! ## Algorithm Notes
//!
//! ### Haversine Formula
//!
//! The haversine formula calculates the great-circle distance between two points on a sphere.
//! It's the standard method for GPS distance calculation, accurate to within 0.3% for most
//! practical applications. Distances are taken on a sphere of radius [`EARTH_RADIUS_M`]
//! (6,371,000 m), so the 50 m stop radius is measured on the conventional 6,371 km
//! sphere. `geo::Haversine` uses 6,371,008.8 m, which moves a 50 m boundary by ~70 µm.
//!
//! Reference: [Haversine formula (Wikipedia)](https://en.wikipedia.org/wiki/Haversine_formula)
//!
//! ### Coordinate System
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees), which is the
//! standard used by GPS receivers and mapping services.

use geo::Point;

use crate::Coordinate;

/// Earth radius in meters used for all distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

impl From<Coordinate> for Point<f64> {
    fn from(c: Coordinate) -> Self {
        Point::new(c.lon, c.lat)
    }
}

/// Calculate the great-circle distance between two coordinates using the Haversine formula.
///
/// Returns the distance in meters along the Earth's surface.
///
/// # Example
///
/// ```rust
/// use fleet_gateway::{Coordinate, geo_utils};
///
/// let london = Coordinate::new(51.5074, -0.1278);
/// let paris = Coordinate::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &Coordinate, p2: &Coordinate) -> f64 {
    haversine_points(Point::from(*p1), Point::from(*p2))
}

/// Haversine distance in meters between two `(lon, lat)` points in degrees.
pub fn haversine_points(p1: Point<f64>, p2: Point<f64>) -> f64 {
    let lat1 = p1.y().to_radians();
    let lat2 = p2.y().to_radians();
    let dlat = lat2 - lat1;
    let dlon = (p2.x() - p1.x()).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Total length of a sequence of coordinates in meters.
///
/// Reported in the trajectory summary log.
pub fn path_length(points: &[Coordinate]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Unit Tests
// =============================================================================
