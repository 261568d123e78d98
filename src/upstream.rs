//! HTTP clients for the two upstream services.
//!
//! The batcher and server only see the [`ReverseGeocoder`] and
//! [`TelemetrySource`] traits, so tests substitute in-process fakes.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::AddressFormat;
use crate::trajectory::GeoReport;
use crate::{
    Address, AddressResult, Coordinate, GatewayError, UNKNOWN_ADDRESS, UNKNOWN_CITY,
    UNKNOWN_COUNTRY, UNKNOWN_ROAD, UNKNOWN_STATE,
};

/// One reverse-geocoding request to the upstream service. No retries.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse(&self, coordinate: Coordinate) -> Result<AddressResult, GatewayError>;
}

/// Parameters of `/vehiculo_recorrido`, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryQuery {
    pub vehi_id: String,
    pub fecha_i: String,
    pub fecha_f: String,
}

/// Credentials relayed to the backend's `/login` as a form body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginForm {
    pub usuario: String,
    pub passwd: String,
}

/// The vehicle-telemetry backend.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Ordered position reports for one vehicle over a date range.
    async fn trajectory(&self, query: &TrajectoryQuery) -> Result<Vec<GeoReport>, GatewayError>;

    /// GET `path` with `params` and return the JSON body untouched.
    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, GatewayError>;

    async fn login(&self, form: &LoginForm) -> Result<Value, GatewayError>;
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout
    } else {
        GatewayError::Upstream(e.to_string())
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        return Err(GatewayError::Upstream(format!("HTTP {}", status)));
    }
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::UpstreamFormat(format!("JSON parse error: {}", e)))
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

// ============================================================================
// Geocoding
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct NominatimResponse {
    #[serde(default)]
    address: Option<NominatimAddress>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    road: Option<String>,
    city: Option<String>,
    town: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl NominatimResponse {
    fn into_result(self, format: AddressFormat) -> AddressResult {
        match format {
            AddressFormat::Display => AddressResult::Display(
                non_empty(self.display_name).unwrap_or_else(|| UNKNOWN_ADDRESS.to_string()),
            ),
            AddressFormat::Structured => {
                let a = self.address.unwrap_or_default();
                AddressResult::Structured(Address {
                    road: non_empty(a.road).unwrap_or_else(|| UNKNOWN_ROAD.to_string()),
                    city: non_empty(a.city)
                        .or_else(|| non_empty(a.town))
                        .unwrap_or_else(|| UNKNOWN_CITY.to_string()),
                    state: non_empty(a.state).unwrap_or_else(|| UNKNOWN_STATE.to_string()),
                    country: non_empty(a.country).unwrap_or_else(|| UNKNOWN_COUNTRY.to_string()),
                })
            }
        }
    }
}

/// Client for a Nominatim-compatible `/reverse` endpoint.
pub struct NominatimClient {
    client: Client,
    base_url: String,
    format: AddressFormat,
}

impl NominatimClient {
    pub fn new(base_url: &str, user_agent: &str, format: AddressFormat) -> Result<Self, GatewayError> {
        // Per-attempt timeouts are applied by the batcher
        let client = Client::builder()
            .user_agent(user_agent)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Upstream(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: trim_base(base_url),
            format,
        })
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimClient {
    async fn reverse(&self, coordinate: Coordinate) -> Result<AddressResult, GatewayError> {
        let url = format!("{}/reverse", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("format", "json".to_string()),
                ("lat", coordinate.lat.to_string()),
                ("lon", coordinate.lon.to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let body = read_json(response).await?;
        let parsed: NominatimResponse = serde_json::from_value(body)
            .map_err(|e| GatewayError::UpstreamFormat(format!("geocoder response: {}", e)))?;
        Ok(parsed.into_result(self.format))
    }
}

// ============================================================================
// Telemetry backend
// ============================================================================

/// Turn the backend's trajectory payload into reports. Anything but an array
/// of report objects is a format error.
pub fn parse_trajectory(body: Value) -> Result<Vec<GeoReport>, GatewayError> {
    let Value::Array(items) = body else {
        return Err(GatewayError::UpstreamFormat(
            "trajectory payload is not an array".to_string(),
        ));
    };
    items.into_iter().map(GeoReport::from_value).collect()
}

/// Client for the telemetry backend.
pub struct TelemetryClient {
    client: Client,
    base_url: String,
}

impl TelemetryClient {
    pub fn new(base_url: &str, accept_invalid_certs: bool) -> Result<Self, GatewayError> {
        if accept_invalid_certs {
            warn!("[TelemetryClient] TLS certificate verification disabled for {}", base_url);
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Upstream(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl TelemetrySource for TelemetryClient {
    async fn trajectory(&self, query: &TrajectoryQuery) -> Result<Vec<GeoReport>, GatewayError> {
        let body = self
            .get_json(
                "/vehiculo_recorrido",
                &[
                    ("vehi_id", query.vehi_id.clone()),
                    ("fecha_i", query.fecha_i.clone()),
                    ("fecha_f", query.fecha_f.clone()),
                ],
            )
            .await?;
        parse_trajectory(body)
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("[TelemetryClient] GET {} {:?}", url, params);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn login(&self, form: &LoginForm) -> Result<Value, GatewayError> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }
}
