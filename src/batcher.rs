//! Cache-aware reverse geocoding, single and batched.
//!
//! A batch lookup:
//! - Rejects the whole call if any coordinate is invalid
//! - Deduplicates coordinates by [`QuantizedKey`]
//! - Serves fresh cache entries without touching the network
//! - Fetches the misses concurrently (bounded), each with retry and exponential backoff
//! - Resolves a key to [`AddressResult::FetchFailure`] when its attempts run out
//!
//! A single lookup shares the cache but makes one attempt and surfaces failure
//! as an error.

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::TtlCache;
use crate::quantize::{dedup_coordinates, QuantizedKey};
use crate::upstream::ReverseGeocoder;
use crate::{AddressResult, Coordinate, GatewayError};

pub type AddressCache = TtlCache<QuantizedKey, AddressResult>;

/// Attempts, per-attempt timeout and backoff for batch fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Delay after the first failed attempt; doubled after each further failure
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << exponent)
    }
}

/// Resolves coordinates to addresses through the shared cache.
pub struct GeocodeBatcher {
    geocoder: Arc<dyn ReverseGeocoder>,
    cache: Arc<AddressCache>,
    policy: RetryPolicy,
    max_concurrency: usize,
    max_batch_size: usize,
}

impl GeocodeBatcher {
    pub fn new(geocoder: Arc<dyn ReverseGeocoder>, cache: Arc<AddressCache>) -> Self {
        Self {
            geocoder,
            cache,
            policy: RetryPolicy::default(),
            max_concurrency: 8,
            max_batch_size: 1000,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn cache(&self) -> &Arc<AddressCache> {
        &self.cache
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Resolve one coordinate: cached value, or a single upstream attempt.
    pub async fn resolve_one(&self, coordinate: Coordinate) -> Result<AddressResult, GatewayError> {
        let coordinate = coordinate.validated()?;
        let key = QuantizedKey::from_coordinate(&coordinate);

        if let Some(hit) = self.cache.get(&key) {
            debug!("[Geocode {}] cache hit", key);
            return Ok(hit);
        }

        match self.attempt(coordinate).await {
            Ok(result) => {
                self.cache.set(key, result.clone());
                Ok(result)
            }
            Err(e) => {
                warn!("[Geocode {}] lookup failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Resolve every distinct key among `coordinates`.
    ///
    /// Fails only on invalid input; upstream failures are reported per key.
    pub async fn resolve_batch(
        &self,
        coordinates: &[Coordinate],
    ) -> Result<HashMap<QuantizedKey, AddressResult>, GatewayError> {
        if coordinates.len() > self.max_batch_size {
            return Err(GatewayError::Validation(format!(
                "Batch of {} coordinates exceeds the limit of {}",
                coordinates.len(),
                self.max_batch_size
            )));
        }
        if let Some((i, bad)) = coordinates.iter().enumerate().find(|(_, c)| !c.is_valid()) {
            return Err(GatewayError::Validation(format!(
                "Invalid latitude or longitude at index {}: ({}, {})",
                i, bad.lat, bad.lon
            )));
        }

        let start = Instant::now();
        let distinct = dedup_coordinates(coordinates);
        let mut resolved = HashMap::with_capacity(distinct.len());
        let mut misses = Vec::new();

        for (key, coordinate) in distinct {
            match self.cache.get(&key) {
                Some(hit) => {
                    resolved.insert(key, hit);
                }
                None => misses.push((key, coordinate)),
            }
        }

        let hits = resolved.len();
        let miss_count = misses.len();

        let fetched: Vec<(QuantizedKey, AddressResult)> = stream::iter(misses)
            .map(|(key, coordinate)| async move {
                let result = self.fetch_with_retry(&key, coordinate).await;
                (key, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut failures = 0;
        for (key, result) in fetched {
            if result.is_failure() {
                failures += 1;
            }
            resolved.insert(key, result);
        }

        info!(
            "[GeocodeBatcher] {} coordinates -> {} keys ({} cached, {} fetched, {} failed) in {:.2}s",
            coordinates.len(),
            resolved.len(),
            hits,
            miss_count,
            failures,
            start.elapsed().as_secs_f64()
        );

        Ok(resolved)
    }

    /// One attempt bounded by the per-attempt timeout.
    async fn attempt(&self, coordinate: Coordinate) -> Result<AddressResult, GatewayError> {
        match tokio::time::timeout(self.policy.attempt_timeout, self.geocoder.reverse(coordinate)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::UpstreamTimeout),
        }
    }

    /// Attempts are sequential for one key. Successes are cached.
    async fn fetch_with_retry(&self, key: &QuantizedKey, coordinate: Coordinate) -> AddressResult {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(coordinate).await {
                Ok(result) => {
                    debug!("[Geocode {}] resolved on attempt {}", key, attempts);
                    self.cache.set(key.clone(), result.clone());
                    return result;
                }
                Err(e) if e.is_transient() && attempts < self.policy.max_attempts => {
                    let wait = self.policy.backoff_after(attempts);
                    warn!(
                        "[Geocode {}] attempt {}/{} failed: {}, retry after {:?}",
                        key, attempts, self.policy.max_attempts, e, wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(
                        "[Geocode {}] giving up after {} attempt(s): {}",
                        key, attempts, e
                    );
                    return AddressResult::FetchFailure;
                }
            }
        }
    }
}
