//! HTTP surface of the gateway.
//!
//! - `GET /reverse-geocode?lat&lon` and `POST /batch-geocode` pass admission control first
//! - `GET /vehiculo_recorrido` fetches a trajectory and simplifies it
//! - `POST /login`, `GET /vehiculos_user`, `/eventos_placa`, `/geocerca_placa` and
//!   `/consumo_vehiculo` relay to the telemetry backend unchanged

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequest, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::batcher::GeocodeBatcher;
use crate::cache::TtlCache;
use crate::config::GatewayConfig;
use crate::geo_utils::path_length;
use crate::quantize::QuantizedKey;
use crate::rate_limit::{Admission, RateLimiter};
use crate::trajectory::{lenient_number, simplify, GeoReport, SimplifierConfig};
use crate::upstream::{
    LoginForm, NominatimClient, TelemetryClient, TelemetrySource, TrajectoryQuery,
};
use crate::{AddressResult, Coordinate, GatewayError};

const LOGIN_FAILED_MESSAGE: &str = "Error al conectarse con el backend";

/// Shared, explicitly owned state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub batcher: Arc<GeocodeBatcher>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub limiter: Arc<RateLimiter>,
    pub simplifier: SimplifierConfig,
    pub trust_forwarded_for: bool,
}

impl AppState {
    /// Wire the real upstream clients from configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let geocoder = NominatimClient::new(&config.nominatim_api, &config.user_agent, config.address_format)?;
        let telemetry = TelemetryClient::new(&config.api_base_url, config.insecure_upstream_tls)?;

        let batcher = GeocodeBatcher::new(Arc::new(geocoder), Arc::new(TtlCache::new(config.cache_ttl())))
            .with_policy(config.retry_policy())
            .with_max_concurrency(config.max_concurrency)
            .with_max_batch_size(config.max_batch_size);

        Ok(Self {
            batcher: Arc::new(batcher),
            telemetry: Arc::new(telemetry),
            limiter: Arc::new(RateLimiter::new(config.rate_limit())),
            simplifier: config.simplifier(),
            trust_forwarded_for: config.trust_forwarded_for,
        })
    }
}

/// Build the axum router.
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/reverse-geocode", get(reverse_geocode))
        .route("/batch-geocode", post(batch_geocode))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission));

    Router::new()
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/vehiculos_user", get(vehiculos_user))
        .route("/vehiculo_recorrido", get(vehiculo_recorrido))
        .route("/eventos_placa", get(eventos_placa))
        .route("/geocerca_placa", get(geocerca_placa))
        .route("/consumo_vehiculo", get(consumo_vehiculo))
        .merge(limited)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind, spawn the janitor and serve until Ctrl-C.
pub async fn serve(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(&config)?;
    let janitor = spawn_janitor(state.clone(), config.janitor_interval());

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "Gateway listening on {} (backend: {}, geocoder: {}, cache ttl: {}s, limit: {}/{}ms)",
        addr,
        config.api_base_url,
        config.nominatim_api,
        config.cache_ttl_secs,
        config.rate_limit_max,
        config.rate_limit_window_ms
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    janitor.abort();
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Periodically reclaim expired cache entries and idle limiter counters.
pub fn spawn_janitor(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let expired = state.batcher.cache().purge_expired();
            let idle = state.limiter.purge_idle();
            if expired > 0 || idle > 0 {
                debug!("[Janitor] purged {} cache entries, {} idle clients", expired, idle);
            }
        }
    })
}

// ============================================================================
// Admission control
// ============================================================================

/// Client identity: the first `X-Forwarded-For` hop when trusted, else the peer IP.
fn client_identity(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Whole seconds, rounded up, never below 1.
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

fn set_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_after: Duration) {
    headers.insert(HeaderName::from_static("ratelimit-limit"), HeaderValue::from(limit));
    headers.insert(HeaderName::from_static("ratelimit-remaining"), HeaderValue::from(remaining));
    headers.insert(
        HeaderName::from_static("ratelimit-reset"),
        HeaderValue::from(ceil_secs(reset_after)),
    );
}

async fn admission(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let client = client_identity(&req, state.trust_forwarded_for);

    match state.limiter.admit(&client) {
        Admission::Allowed {
            limit,
            remaining,
            reset_after,
        } => {
            let mut response = next.run(req).await;
            set_rate_limit_headers(response.headers_mut(), limit, remaining, reset_after);
            response
        }
        Admission::Rejected { limit, retry_after } => {
            warn!(
                "[Admission] {} rejected on {} (retry in {:?})",
                client,
                req.uri().path(),
                retry_after
            );
            let mut response = GatewayError::RateLimited {
                retry_after_secs: ceil_secs(retry_after),
            }
            .into_response();
            set_rate_limit_headers(response.headers_mut(), limit, 0, retry_after);
            response
        }
    }
}

// ============================================================================
// Geocoding
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReverseGeocodeParams {
    lat: Option<String>,
    lon: Option<String>,
}

impl ReverseGeocodeParams {
    fn coordinate(&self) -> Result<Coordinate, GatewayError> {
        let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.trim().parse::<f64>().ok());
        match (parse(&self.lat), parse(&self.lon)) {
            (Some(lat), Some(lon)) => Coordinate::new(lat, lon).validated(),
            _ => Err(GatewayError::Validation("Invalid latitude or longitude".to_string())),
        }
    }
}

async fn reverse_geocode(
    State(state): State<AppState>,
    Query(params): Query<ReverseGeocodeParams>,
) -> Result<Json<AddressResult>, GatewayError> {
    let coordinate = params.coordinate()?;
    let result = state.batcher.resolve_one(coordinate).await?;
    Ok(Json(result))
}

/// Parse a `[{lat, lon}, ...]` body. Numbers and numeric strings are accepted.
fn parse_coordinate_list(body: &Value) -> Result<Vec<Coordinate>, GatewayError> {
    let items = body.as_array().ok_or_else(|| {
        GatewayError::Validation("Expected a JSON array of {lat, lon} objects".to_string())
    })?;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let field = |name: &str| {
                item.get(name).and_then(lenient_number).ok_or_else(|| {
                    GatewayError::Validation(format!(
                        "Coordinate at index {} has a missing or non-numeric `{}`",
                        i, name
                    ))
                })
            };
            Ok(Coordinate::new(field("lat")?, field("lon")?))
        })
        .collect()
}

async fn batch_geocode(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<HashMap<QuantizedKey, AddressResult>>, GatewayError> {
    let Json(body) =
        body.map_err(|e| GatewayError::Validation(format!("Invalid JSON body: {}", e.body_text())))?;
    let coordinates = parse_coordinate_list(&body)?;
    let resolved = state.batcher.resolve_batch(&coordinates).await?;
    Ok(Json(resolved))
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TrajectoryParams {
    vehi_id: Option<String>,
    fecha_i: Option<String>,
    fecha_f: Option<String>,
    simplify: Option<String>,
}

impl TrajectoryParams {
    fn query(&self) -> Result<TrajectoryQuery, GatewayError> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| GatewayError::Validation(format!("Missing query parameter `{}`", name)))
        };
        Ok(TrajectoryQuery {
            vehi_id: required(&self.vehi_id, "vehi_id")?,
            fecha_i: required(&self.fecha_i, "fecha_i")?,
            fecha_f: required(&self.fecha_f, "fecha_f")?,
        })
    }

    fn wants_simplified(&self) -> bool {
        !matches!(self.simplify.as_deref(), Some("false") | Some("0") | Some("no"))
    }
}

async fn vehiculo_recorrido(
    State(state): State<AppState>,
    Query(params): Query<TrajectoryParams>,
) -> Result<Json<Vec<GeoReport>>, GatewayError> {
    let query = params.query()?;
    let reports = state.telemetry.trajectory(&query).await?;
    let total = reports.len();

    if !params.wants_simplified() {
        return Ok(Json(reports));
    }

    let kept = simplify(reports, &state.simplifier);
    let positions: Vec<Coordinate> = kept.iter().map(|r| r.position).collect();
    info!(
        "[Trajectory {}] {} reports -> {} after simplification ({:.0} m)",
        query.vehi_id,
        total,
        kept.len(),
        path_length(&positions)
    );
    Ok(Json(kept))
}

/// Relay a GET to the backend, forwarding only the named parameters.
async fn forward(
    state: &AppState,
    path: &str,
    params: &HashMap<String, String>,
    names: &[&'static str],
) -> Result<Json<Value>, GatewayError> {
    let forwarded: Vec<(&str, String)> = names
        .iter()
        .map(|&name| (name, params.get(name).cloned().unwrap_or_default()))
        .collect();
    state.telemetry.get_json(path, &forwarded).await.map(Json)
}

async fn vehiculos_user(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, GatewayError> {
    forward(&state, "/vehiculos_user", &params, &["usuario_id"]).await
}

async fn eventos_placa(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, GatewayError> {
    forward(&state, "/eventos_placa", &params, &["vehi_id", "fecha_i", "fecha_f"]).await
}

async fn geocerca_placa(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, GatewayError> {
    forward(&state, "/geocerca_placa", &params, &["vehi_id"]).await
}

async fn consumo_vehiculo(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, GatewayError> {
    forward(&state, "/consumo_placa", &params, &["vehi_id", "fecha_i", "fecha_f"]).await
}

fn login_failed() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": LOGIN_FAILED_MESSAGE })),
    )
        .into_response()
}

/// Credentials from a urlencoded form or a JSON body.
async fn read_login_form(request: Request) -> Option<LoginForm> {
    let is_form = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        Form::<LoginForm>::from_request(request, &()).await.ok().map(|Form(f)| f)
    } else {
        Json::<LoginForm>::from_request(request, &()).await.ok().map(|Json(f)| f)
    }
}

async fn login(State(state): State<AppState>, request: Request) -> Response {
    let Some(form) = read_login_form(request).await else {
        warn!("[Login] unreadable credentials body");
        return login_failed();
    };

    match state.telemetry.login(&form).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            warn!("[Login] backend request failed for {}: {}", form.usuario, e);
            login_failed()
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "cache_entries": state.batcher.cache().len(),
        "tracked_clients": state.limiter.len(),
    }))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::tests::{road_for, FakeGeocoder};
    use crate::batcher::RetryPolicy;
    use crate::rate_limit::RateLimitConfig;
    use crate::upstream::parse_trajectory;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Method;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct FakeTelemetry {
        trajectory: Value,
        fail_login: bool,
        requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FakeTelemetry {
        fn new(trajectory: Value) -> Self {
            Self {
                trajectory,
                fail_login: false,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TelemetrySource for FakeTelemetry {
        async fn trajectory(&self, _query: &TrajectoryQuery) -> Result<Vec<GeoReport>, GatewayError> {
            parse_trajectory(self.trajectory.clone())
        }

        async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, GatewayError> {
            let params: Vec<(String, String)> =
                params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
            self.requests.lock().unwrap().push((path.to_string(), params));
            Ok(json!({ "path": path }))
        }

        async fn login(&self, form: &LoginForm) -> Result<Value, GatewayError> {
            if self.fail_login {
                return Err(GatewayError::Upstream("connection refused".to_string()));
            }
            Ok(json!({ "usuario": form.usuario, "ok": true }))
        }
    }

    struct Harness {
        app: Router,
        geocoder: Arc<FakeGeocoder>,
        telemetry: Arc<FakeTelemetry>,
    }

    fn harness_with(geocoder: FakeGeocoder, telemetry: FakeTelemetry, limit: RateLimitConfig, trust: bool) -> Harness {
        let geocoder = Arc::new(geocoder);
        let telemetry = Arc::new(telemetry);
        let batcher = GeocodeBatcher::new(geocoder.clone(), Arc::new(TtlCache::new(Duration::from_secs(60))))
            .with_policy(RetryPolicy {
                max_attempts: 3,
                attempt_timeout: Duration::from_millis(200),
                backoff_base: Duration::from_millis(1),
            });
        let state = AppState {
            batcher: Arc::new(batcher),
            telemetry: telemetry.clone(),
            limiter: Arc::new(RateLimiter::new(limit)),
            simplifier: SimplifierConfig::default(),
            trust_forwarded_for: trust,
        };
        Harness {
            app: router(state),
            geocoder,
            telemetry,
        }
    }

    fn harness() -> Harness {
        harness_with(
            FakeGeocoder::new(),
            FakeTelemetry::new(json!([])),
            RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 100,
            },
            false,
        )
    }

    fn request(method: Method, uri: &str, body: Option<Value>, peer: [u8; 4]) -> Request {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
        req
    }

    async fn send(app: &Router, req: Request) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    const PEER: [u8; 4] = [10, 0, 0, 1];

    #[tokio::test]
    async fn test_reverse_geocode_ok() {
        let h = harness();
        let (status, headers, body) = send(
            &h.app,
            request(Method::GET, "/reverse-geocode?lat=4.8133&lon=-75.6961", None, PEER),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::to_value(road_for(&Coordinate::new(4.8133, -75.6961))).unwrap());
        assert_eq!(headers["ratelimit-limit"], "100");
        assert_eq!(headers["ratelimit-remaining"], "99");
    }

    #[tokio::test]
    async fn test_reverse_geocode_validation() {
        let h = harness();
        for uri in [
            "/reverse-geocode?lat=abc&lon=-75.7",
            "/reverse-geocode?lat=91&lon=-75.7",
            "/reverse-geocode?lat=4.8&lon=-181",
            "/reverse-geocode?lat=4.8",
            "/reverse-geocode",
        ] {
            let (status, _, body) = send(&h.app, request(Method::GET, uri, None, PEER)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["error"].is_string());
        }
        assert_eq!(h.geocoder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reverse_geocode_upstream_failure_is_call_level() {
        let h = harness_with(
            FakeGeocoder::new().always_failing(),
            FakeTelemetry::new(json!([])),
            RateLimitConfig::default(),
            false,
        );
        let (status, _, body) = send(
            &h.app,
            request(Method::GET, "/reverse-geocode?lat=4.8&lon=-75.7", None, PEER),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_batch_geocode_dedups_and_marks_failures() {
        let h = harness_with(
            FakeGeocoder::new().failing("6.24420,-75.58120", 3),
            FakeTelemetry::new(json!([])),
            RateLimitConfig::default(),
            false,
        );
        let body = json!([
            { "lat": 4.80000, "lon": -75.70000 },
            { "lat": "4.800001", "lon": -75.700002 },
            { "lat": 6.2442, "lon": -75.5812 }
        ]);
        let (status, _, body) = send(&h.app, request(Method::POST, "/batch-geocode", Some(body), PEER)).await;

        assert_eq!(status, StatusCode::OK);
        let map = body.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map["4.80000,-75.70000"],
            serde_json::to_value(road_for(&Coordinate::new(4.8, -75.7))).unwrap()
        );
        assert_eq!(map["6.24420,-75.58120"], json!({ "error": "Error fetching address" }));
        // 1 fetch for the deduplicated key, 3 attempts for the failing one
        assert_eq!(h.geocoder.call_count(), 4);
    }

    #[tokio::test]
    async fn test_batch_geocode_rejects_bad_input() {
        let h = harness();
        let bad_bodies = [
            json!({ "lat": 4.8, "lon": -75.7 }),
            json!([{ "lat": 4.8, "lon": "west" }]),
            json!([{ "lat": 4.8 }]),
            json!([{ "lat": 4.8, "lon": -75.7 }, { "lat": -95.0, "lon": 0.0 }]),
        ];
        for body in bad_bodies {
            let (status, _, response) =
                send(&h.app, request(Method::POST, "/batch-geocode", Some(body.clone()), PEER)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
            assert!(response["error"].is_string());
        }

        let mut malformed = request(Method::POST, "/batch-geocode", None, PEER);
        *malformed.body_mut() = Body::from("[{\"lat\": 4.8,");
        malformed
            .headers_mut()
            .insert("content-type", HeaderValue::from_static("application/json"));
        let (status, _, _) = send(&h.app, malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(h.geocoder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_admission_control() {
        let h = harness_with(
            FakeGeocoder::new(),
            FakeTelemetry::new(json!([])),
            RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 5,
            },
            false,
        );
        let uri = "/reverse-geocode?lat=4.8&lon=-75.7";

        for _ in 0..5 {
            let (status, _, _) = send(&h.app, request(Method::GET, uri, None, PEER)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, headers, body) = send(&h.app, request(Method::GET, uri, None, PEER)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, json!({ "error": "Too many requests, please try again later." }));
        let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry_after));
        assert_eq!(headers["ratelimit-remaining"], "0");

        // Batch shares the budget; other clients and ungated routes are unaffected
        let (status, _, _) = send(
            &h.app,
            request(Method::POST, "/batch-geocode", Some(json!([])), PEER),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, _, _) = send(&h.app, request(Method::GET, uri, None, [10, 0, 0, 2])).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(&h.app, request(Method::GET, "/health", None, PEER)).await;
        assert_eq!(status, StatusCode::OK);

        // Rejected requests never reach the geocoder; the first lookup was cached
        assert_eq!(h.geocoder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_forwarded_for_identity() {
        let h = harness_with(
            FakeGeocoder::new(),
            FakeTelemetry::new(json!([])),
            RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 1,
            },
            true,
        );
        let uri = "/reverse-geocode?lat=4.8&lon=-75.7";
        let with_xff = |xff: &'static str| {
            let mut req = request(Method::GET, uri, None, PEER);
            req.headers_mut().insert("x-forwarded-for", HeaderValue::from_static(xff));
            req
        };

        let (status, _, _) = send(&h.app, with_xff("203.0.113.7, 10.0.0.1")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(&h.app, with_xff("203.0.113.8")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(&h.app, with_xff("203.0.113.7")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    fn parked_trajectory() -> Value {
        json!([
            { "lat": 4.80000, "lon": -75.70000, "speed": 0, "timestamp": "08:00:00" },
            { "lat": 4.80000, "lon": -75.70000, "speed": 0, "timestamp": "08:00:30" },
            { "lat": 4.80000, "lon": -75.70000, "speed": 0, "timestamp": "08:01:00" },
            { "lat": 4.80000, "lon": -75.70000, "speed": 0, "timestamp": "08:01:30" },
            { "lat": 4.90000, "lon": -75.60000, "speed": 40, "timestamp": "08:02:00" }
        ])
    }

    #[tokio::test]
    async fn test_trajectory_simplified() {
        let h = harness_with(
            FakeGeocoder::new(),
            FakeTelemetry::new(parked_trajectory()),
            RateLimitConfig::default(),
            false,
        );
        let (status, _, body) = send(
            &h.app,
            request(
                Method::GET,
                "/vehiculo_recorrido?vehi_id=17&fecha_i=2024-05-01&fecha_f=2024-05-02",
                None,
                PEER,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let input = parked_trajectory();
        assert_eq!(body, json!([input[0], input[1], input[4]]));
    }

    #[tokio::test]
    async fn test_trajectory_raw_and_errors() {
        let h = harness_with(
            FakeGeocoder::new(),
            FakeTelemetry::new(parked_trajectory()),
            RateLimitConfig::default(),
            false,
        );
        let (status, _, body) = send(
            &h.app,
            request(
                Method::GET,
                "/vehiculo_recorrido?vehi_id=17&fecha_i=a&fecha_f=b&simplify=false",
                None,
                PEER,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, parked_trajectory());

        let (status, _, _) = send(
            &h.app,
            request(Method::GET, "/vehiculo_recorrido?fecha_i=a&fecha_f=b", None, PEER),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let h = harness_with(
            FakeGeocoder::new(),
            FakeTelemetry::new(json!({ "mensaje": "sin datos" })),
            RateLimitConfig::default(),
            false,
        );
        let (status, _, body) = send(
            &h.app,
            request(Method::GET, "/vehiculo_recorrido?vehi_id=17&fecha_i=a&fecha_f=b", None, PEER),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("not an array"));
    }

    #[tokio::test]
    async fn test_pass_through_routes() {
        let h = harness();
        let cases = [
            ("/vehiculos_user?usuario_id=42", "/vehiculos_user"),
            ("/eventos_placa?vehi_id=7&fecha_i=a&fecha_f=b", "/eventos_placa"),
            ("/geocerca_placa?vehi_id=7", "/geocerca_placa"),
            ("/consumo_vehiculo?vehi_id=7&fecha_i=a&fecha_f=b", "/consumo_placa"),
        ];
        for (uri, upstream) in cases {
            let (status, _, body) = send(&h.app, request(Method::GET, uri, None, PEER)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({ "path": upstream }));
        }

        let requests = h.telemetry.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(
            requests[3].1,
            vec![
                ("vehi_id".to_string(), "7".to_string()),
                ("fecha_i".to_string(), "a".to_string()),
                ("fecha_f".to_string(), "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_login() {
        let h = harness();
        let creds = json!({ "usuario": "demo", "passwd": "secret" });
        let (status, _, body) = send(&h.app, request(Method::POST, "/login", Some(creds.clone()), PEER)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "usuario": "demo", "ok": true }));

        let mut telemetry = FakeTelemetry::new(json!([]));
        telemetry.fail_login = true;
        let h = harness_with(FakeGeocoder::new(), telemetry, RateLimitConfig::default(), false);
        let (status, _, body) = send(&h.app, request(Method::POST, "/login", Some(creds), PEER)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Error al conectarse con el backend" }));
    }

    #[tokio::test]
    async fn test_login_accepts_urlencoded_form() {
        let h = harness();
        let mut req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("usuario=demo&passwd=secret"))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((PEER, 40000))));

        let (status, _, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "usuario": "demo", "ok": true }));
    }

    #[tokio::test]
    async fn test_login_bad_body_is_backend_error() {
        let h = harness();
        let (status, _, body) = send(
            &h.app,
            request(Method::POST, "/login", Some(json!({ "usuario": "demo" })), PEER),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Error al conectarse con el backend" }));

        let (status, _, _) = send(&h.app, request(Method::POST, "/login", None, PEER)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 1);
        assert_eq!(ceil_secs(Duration::from_millis(200)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1200)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(50)), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_purges_expired_state() {
        let geocoder: Arc<FakeGeocoder> = Arc::new(FakeGeocoder::new());
        let cache = Arc::new(TtlCache::new(Duration::from_secs(5)));
        let state = AppState {
            batcher: Arc::new(GeocodeBatcher::new(geocoder, cache.clone())),
            telemetry: Arc::new(FakeTelemetry::new(json!([]))),
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            simplifier: SimplifierConfig::default(),
            trust_forwarded_for: false,
        };
        // Entry inserted 10 s in the past by std clock
        let past = std::time::Instant::now() - Duration::from_secs(10);
        cache.set_at(QuantizedKey::from_coordinate(&Coordinate::new(1.0, 1.0)), AddressResult::FetchFailure, past);
        assert_eq!(cache.len(), 1);

        let janitor = spawn_janitor(state, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.is_empty());
        janitor.abort();
    }
}
