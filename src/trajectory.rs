//! Trajectory simplification.
//!
//! Reduces a vehicle's ordered GPS reports to the subset that carries
//! movement/stop meaning: every moving report is kept, and each run of
//! stationary reports collapses to its first (the stop-transition point).
//!
//! The filter is a fold over the input with [`SimplifierState`] as the
//! explicit accumulator, so one run never shares state with another.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::geo_utils::haversine_distance;
use crate::{Coordinate, GatewayError};

/// One position report from the telemetry backend.
///
/// `lat`, `lon` and `speed` are parsed for the simplifier; the full original
/// object is kept and serialized back untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct GeoReport {
    pub position: Coordinate,
    /// Speed in km/h. `None` when the backend omitted it.
    pub speed: Option<f64>,
    raw: Map<String, Value>,
}

impl GeoReport {
    /// Build a report from numeric fields (timestamp-less).
    pub fn new(lat: f64, lon: f64, speed: f64) -> Self {
        let mut raw = Map::new();
        raw.insert("lat".to_string(), Value::from(lat));
        raw.insert("lon".to_string(), Value::from(lon));
        raw.insert("speed".to_string(), Value::from(speed));
        Self {
            position: Coordinate::new(lat, lon),
            speed: Some(speed),
            raw,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<Value>) -> Self {
        self.raw.insert("timestamp".to_string(), timestamp.into());
        self
    }

    /// The report's timestamp as sent upstream, if any.
    pub fn timestamp(&self) -> Option<&Value> {
        self.raw.get("timestamp")
    }

    /// The original JSON object.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// Parse a report out of one element of the backend's array.
    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        match value {
            Value::Object(map) => Self::try_from(map),
            other => Err(GatewayError::UpstreamFormat(format!(
                "report is not an object: {}",
                other
            ))),
        }
    }
}

/// Accepts JSON numbers and numeric strings (`"4.81"`).
pub(crate) fn lenient_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn required_number(map: &Map<String, Value>, field: &str) -> Result<f64, GatewayError> {
    map.get(field)
        .and_then(lenient_number)
        .ok_or_else(|| {
            GatewayError::UpstreamFormat(format!("report field `{}` missing or not numeric", field))
        })
}

impl TryFrom<Map<String, Value>> for GeoReport {
    type Error = GatewayError;

    fn try_from(raw: Map<String, Value>) -> Result<Self, Self::Error> {
        let lat = required_number(&raw, "lat")?;
        let lon = required_number(&raw, "lon")?;
        let speed = raw.get("speed").and_then(lenient_number);
        Ok(Self {
            position: Coordinate::new(lat, lon),
            speed,
            raw,
        })
    }
}

impl Serialize for GeoReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

// ============================================================================
// Simplifier
// ============================================================================

/// Thresholds for classifying a report as stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimplifierConfig {
    /// Reports at or below this speed (km/h) may be stopped. Default: 1.0
    pub stop_speed_kmh: f64,
    /// ...and must be closer than this (meters) to the previous report. Default: 50.0
    pub stop_radius_m: f64,
}

impl Default for SimplifierConfig {
    fn default() -> Self {
        Self {
            stop_speed_kmh: 1.0,
            stop_radius_m: 50.0,
        }
    }
}

/// Accumulator threaded through one simplification run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimplifierState {
    /// Position of the most recently processed report, emitted or not.
    pub last_position: Option<Coordinate>,
    pub is_stopped: bool,
}

impl SimplifierState {
    /// Advance by one report. Returns the next state and whether to emit it.
    pub fn step(self, report: &GeoReport, config: &SimplifierConfig) -> (SimplifierState, bool) {
        let Some(last) = self.last_position else {
            let next = SimplifierState {
                last_position: Some(report.position),
                ..self
            };
            return (next, true);
        };

        let distance = haversine_distance(&last, &report.position);
        let slow = report.speed.is_some_and(|s| s <= config.stop_speed_kmh);
        let stopped = slow && distance < config.stop_radius_m;

        // A stop is emitted once, on entry
        let emit = !(stopped && self.is_stopped);
        let next = SimplifierState {
            last_position: Some(report.position),
            is_stopped: stopped,
        };
        (next, emit)
    }
}

/// Keep every moving report and the first report of each stop.
///
/// The first report is always kept and order is never changed. Distance is
/// measured from the previous processed report, so slow drift during a long
/// stop is compared hop by hop rather than against the stop-transition point.
///
/// # Example
/// ```
/// use fleet_gateway::{GeoReport, SimplifierConfig, simplify};
///
/// let reports = vec![
///     GeoReport::new(4.8, -75.7, 0.0),
///     GeoReport::new(4.8, -75.7, 0.0),
///     GeoReport::new(4.8, -75.7, 0.0),
///     GeoReport::new(4.9, -75.6, 40.0),
/// ];
/// let kept = simplify(reports, &SimplifierConfig::default());
/// assert_eq!(kept.len(), 3);
/// ```
pub fn simplify(reports: Vec<GeoReport>, config: &SimplifierConfig) -> Vec<GeoReport> {
    let (_, kept) = reports.into_iter().fold(
        (SimplifierState::default(), Vec::new()),
        |(state, mut kept), report| {
            let (next, emit) = state.step(&report, config);
            if emit {
                kept.push(report);
            }
            (next, kept)
        },
    );
    kept
}

/// Simplify several independent trajectories (one per vehicle) in parallel.
#[cfg(feature = "parallel")]
pub fn simplify_many(
    trajectories: Vec<Vec<GeoReport>>,
    config: &SimplifierConfig,
) -> Vec<Vec<GeoReport>> {
    use rayon::prelude::*;

    trajectories
        .into_par_iter()
        .map(|reports| simplify(reports, config))
        .collect()
}
