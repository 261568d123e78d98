//! # Fleet Gateway
//!
//! A caching, rate-limited gateway between client applications, a
//! vehicle-telemetry backend and a public reverse-geocoding service.
//!
//! This library provides:
//! - Coordinate quantization into stable deduplication/cache keys
//! - A time-bounded cache shared by the single and batch geocode lookups
//! - Per-client admission control over a fixed window
//! - Concurrent, retrying batch reverse geocoding with per-key failure
//! - Trajectory simplification that collapses stationary GPS noise
//!
//! ## Features
//!
//! - **`http`** (default) - Upstream HTTP clients, the geocode batcher and the axum server
//! - **`parallel`** - Simplify many vehicle trajectories in parallel with rayon
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use fleet_gateway::{Coordinate, GeoReport, QuantizedKey, SimplifierConfig, simplify};
//!
//! // Two fixes a few centimetres apart share a key
//! let a = QuantizedKey::from_coordinate(&Coordinate::new(4.80000, -75.70000));
//! let b = QuantizedKey::from_coordinate(&Coordinate::new(4.800001, -75.700002));
//! assert_eq!(a, b);
//!
//! // A parked vehicle collapses to its first fix and the stop transition
//! let reports = vec![
//!     GeoReport::new(4.8, -75.7, 0.0),
//!     GeoReport::new(4.8, -75.7, 0.0),
//!     GeoReport::new(4.8, -75.7, 0.0),
//! ];
//! let kept = simplify(reports, &SimplifierConfig::default());
//! assert_eq!(kept.len(), 2);
//! ```

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

pub mod cache;
pub mod error;
pub mod geo_utils;
pub mod quantize;
pub mod rate_limit;
pub mod trajectory;

pub use cache::TtlCache;
pub use error::GatewayError;
pub use quantize::{dedup_coordinates, quantize, QuantizedKey};
pub use rate_limit::{Admission, RateLimitConfig, RateLimiter};
pub use trajectory::{simplify, GeoReport, SimplifierConfig, SimplifierState};

#[cfg(feature = "parallel")]
pub use trajectory::simplify_many;

// Upstream clients, batcher and server
#[cfg(feature = "http")]
pub mod batcher;
#[cfg(feature = "http")]
pub mod config;
#[cfg(feature = "http")]
pub mod server;
#[cfg(feature = "http")]
pub mod upstream;

#[cfg(feature = "http")]
pub use batcher::{GeocodeBatcher, RetryPolicy};
#[cfg(feature = "http")]
pub use config::{AddressFormat, GatewayConfig};
#[cfg(feature = "http")]
pub use upstream::{NominatimClient, ReverseGeocoder, TelemetryClient, TelemetrySource};

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate in degrees.
///
/// # Example
/// ```
/// use fleet_gateway::Coordinate;
/// let pereira = Coordinate::new(4.8133, -75.6961);
/// assert!(pereira.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Create a new coordinate.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Check the coordinate is finite and within lat [-90, 90], lon [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Return the coordinate itself, or a validation error naming it.
    pub fn validated(self) -> Result<Self, GatewayError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(GatewayError::Validation(format!(
                "Invalid latitude or longitude: ({}, {})",
                self.lat, self.lon
            )))
        }
    }
}

pub const UNKNOWN_ROAD: &str = "Unknown Road";
pub const UNKNOWN_CITY: &str = "Unknown City";
pub const UNKNOWN_STATE: &str = "Unknown State";
pub const UNKNOWN_COUNTRY: &str = "Unknown Country";
pub const UNKNOWN_ADDRESS: &str = "Unknown address";

/// Message carried by the per-key failure marker on the wire.
pub const FETCH_FAILURE_MESSAGE: &str = "Error fetching address";

/// Structured address. Fields missing upstream hold an `Unknown ...` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub road: String,
    pub city: String,
    pub state: String,
    pub country: String,
}

impl Default for Address {
    fn default() -> Self {
        Self {
            road: UNKNOWN_ROAD.to_string(),
            city: UNKNOWN_CITY.to_string(),
            state: UNKNOWN_STATE.to_string(),
            country: UNKNOWN_COUNTRY.to_string(),
        }
    }
}

/// Outcome of resolving one coordinate.
///
/// Serializes as the bare address object, the display string, or
/// `{"error": "Error fetching address"}` for [`AddressResult::FetchFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressResult {
    Structured(Address),
    Display(String),
    /// Every attempt for this key failed. Never cached.
    FetchFailure,
}

impl AddressResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, AddressResult::FetchFailure)
    }
}

impl Serialize for AddressResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AddressResult::Structured(address) => address.serialize(serializer),
            AddressResult::Display(name) => serializer.serialize_str(name),
            AddressResult::FetchFailure => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", FETCH_FAILURE_MESSAGE)?;
                map.end()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
