//! Process configuration.
//!
//! Every option can be given as a flag or an environment variable; a `.env`
//! file is loaded by the binary before parsing.

use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::batcher::RetryPolicy;
use crate::rate_limit::RateLimitConfig;
use crate::trajectory::SimplifierConfig;

/// Which shape the geocoder extracts from the upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AddressFormat {
    /// `{road, city, state, country}` with `Unknown ...` sentinels
    #[default]
    Structured,
    /// The upstream `display_name` string
    Display,
}

/// Caching, rate-limited gateway for vehicle telemetry and reverse geocoding
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct GatewayConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Base URL of the telemetry backend
    #[arg(long, env = "API_BASE_URL", default_value = "https://ws.gmys.com.co")]
    pub api_base_url: String,

    /// Base URL of the Nominatim-compatible geocoding service
    #[arg(long, env = "NOMINATIM_API", default_value = "https://nominatim.openstreetmap.org")]
    pub nominatim_api: String,

    /// Lifetime of cached addresses, in seconds
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 3600)]
    pub cache_ttl_secs: u64,

    /// Admission-control window, in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 1000)]
    pub rate_limit_window_ms: u64,

    /// Requests admitted per client per window
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 5)]
    pub rate_limit_max: u32,

    /// Attempts per coordinate in a batch lookup
    #[arg(long, env = "GEOCODE_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Timeout for a single upstream geocoding attempt, in milliseconds
    #[arg(long, env = "GEOCODE_ATTEMPT_TIMEOUT_MS", default_value_t = 5000)]
    pub attempt_timeout_ms: u64,

    /// Delay before the first retry, doubled on every further retry, in milliseconds
    #[arg(long, env = "GEOCODE_BACKOFF_BASE_MS", default_value_t = 1000)]
    pub backoff_base_ms: u64,

    /// Maximum simultaneous upstream lookups per batch
    #[arg(long, env = "GEOCODE_MAX_CONCURRENCY", default_value_t = 8)]
    pub max_concurrency: usize,

    /// Maximum coordinates accepted in one batch request
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 1000)]
    pub max_batch_size: usize,

    /// Address shape returned by both geocode endpoints
    #[arg(long, env = "ADDRESS_FORMAT", value_enum, default_value_t = AddressFormat::Structured)]
    pub address_format: AddressFormat,

    /// Use the first X-Forwarded-For entry as the client identity
    #[arg(long, env = "TRUST_FORWARDED_FOR", default_value_t = false)]
    pub trust_forwarded_for: bool,

    /// Accept invalid TLS certificates from the telemetry backend
    #[arg(long, env = "INSECURE_UPSTREAM_TLS", default_value_t = false)]
    pub insecure_upstream_tls: bool,

    /// User-Agent sent to the geocoding service
    #[arg(long, env = "GEOCODER_USER_AGENT", default_value = concat!("fleet-gateway/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,

    /// Reports at or below this speed (km/h) may be classified as stopped
    #[arg(long, env = "STOP_SPEED_KMH", default_value_t = 1.0)]
    pub stop_speed_kmh: f64,

    /// Maximum displacement (meters) from the previous report for a stop
    #[arg(long, env = "STOP_RADIUS_M", default_value_t = 50.0)]
    pub stop_radius_m: f64,

    /// How often expired cache entries and idle limiter counters are reclaimed, in seconds
    #[arg(long, env = "JANITOR_INTERVAL_SECS", default_value_t = 60)]
    pub janitor_interval_secs: u64,
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_millis(self.rate_limit_window_ms),
            max_requests: self.rate_limit_max,
        }
    }

    pub fn simplifier(&self) -> SimplifierConfig {
        SimplifierConfig {
            stop_speed_kmh: self.stop_speed_kmh,
            stop_radius_m: self.stop_radius_m,
        }
    }
}
