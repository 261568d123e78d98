//! Admission control.
//!
//! Each client identity gets a fixed window that opens on its first request.
//! Up to `max_requests` are admitted per window; the counter resets once the
//! window has elapsed. Counters of clients whose window closed are reclaimed by
//! [`RateLimiter::purge_idle`].

use dashmap::DashMap;
use log::debug;
use std::time::{Duration, Instant};

/// Window length and budget for admission control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    /// 5 requests per second per client.
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            max_requests: 5,
        }
    }
}

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Rejected {
        limit: u32,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Per-client fixed-window request counter. Safe to share across handlers.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    /// Limiter with no tracked clients.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count one request from `client` and decide whether it may proceed.
    pub fn admit(&self, client: &str) -> Admission {
        self.admit_at(client, Instant::now())
    }

    /// [`RateLimiter::admit`] at an explicit instant.
    pub fn admit_at(&self, client: &str, now: Instant) -> Admission {
        let RateLimitConfig {
            window,
            max_requests,
        } = self.config;

        // The entry guard holds the shard lock, so check-and-increment is atomic
        let mut entry = self.windows.entry(client.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(entry.started_at);
        if elapsed >= window {
            entry.started_at = now;
            entry.count = 0;
        }
        let reset_after = window.saturating_sub(now.saturating_duration_since(entry.started_at));

        if entry.count >= max_requests {
            debug!(
                "[RateLimiter] Rejected {} ({} requests in window, resets in {:?})",
                client, entry.count, reset_after
            );
            return Admission::Rejected {
                limit: max_requests,
                retry_after: reset_after,
            };
        }

        entry.count += 1;
        Admission::Allowed {
            limit: max_requests,
            remaining: max_requests - entry.count,
            reset_after,
        }
    }

    /// Drop counters whose window has closed, returning how many were removed.
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let window = self.config.window;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started_at) < window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
