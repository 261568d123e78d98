//! Coordinate quantization.
//!
//! Coordinates are rounded to 5 decimal digits (~1.1 m at the equator) so that
//! GPS fixes of the same spot share one cache/deduplication key.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::Coordinate;

/// Number of decimal digits kept per component.
pub const QUANTIZE_DECIMALS: usize = 5;
const SCALE: f64 = 100_000.0;

/// Stable key for a coordinate, formatted as `"{lat},{lon}"` with 5 decimals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QuantizedKey(String);

impl QuantizedKey {
    pub fn from_coordinate(coordinate: &Coordinate) -> Self {
        let q = quantize(coordinate);
        QuantizedKey(format!(
            "{:.prec$},{:.prec$}",
            q.lat,
            q.lon,
            prec = QUANTIZE_DECIMALS
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuantizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Coordinate> for QuantizedKey {
    fn from(coordinate: &Coordinate) -> Self {
        QuantizedKey::from_coordinate(coordinate)
    }
}

#[inline]
fn round_component(value: f64) -> f64 {
    // Adding 0.0 turns -0.0 into 0.0 so both format the same
    (value * SCALE).round() / SCALE + 0.0
}

/// Round both components to the quantization precision. Idempotent.
pub fn quantize(coordinate: &Coordinate) -> Coordinate {
    Coordinate::new(round_component(coordinate.lat), round_component(coordinate.lon))
}

/// Collapse coordinates to their distinct keys, keeping the first raw
/// coordinate seen for each key. Order follows first occurrence.
pub fn dedup_coordinates(coordinates: &[Coordinate]) -> Vec<(QuantizedKey, Coordinate)> {
    let mut seen = HashSet::with_capacity(coordinates.len());
    coordinates
        .iter()
        .filter_map(|c| {
            let key = QuantizedKey::from_coordinate(c);
            seen.insert(key.clone()).then_some((key, *c))
        })
        .collect()
}
