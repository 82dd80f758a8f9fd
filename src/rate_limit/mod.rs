// Rate limiting for OAuth flow initiation.
//
// Fixed window per caller identity. Starting a handshake costs a call against the
// platform's own (tight) request-token limit, so callers get a hard cap per window.
// State is in-memory only and resets on restart.

use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Default window length (5 minutes).
pub const DEFAULT_WINDOW_SECONDS: i64 = 300;

/// Default attempts allowed per window.
pub const DEFAULT_MAX_REQUESTS: u32 = 10;

/// Admission check for flow initiation.
///
/// Async so a shared-store implementation can replace the in-memory one without
/// touching callers.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Records an attempt for `identity`. Returns false if the attempt is over the limit.
    async fn try_acquire(&self, identity: &str) -> bool;

    /// How long a rejected caller should wait before retrying.
    fn retry_after(&self) -> Duration;
}

/// Counter for a single identity.
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Per-identity fixed-window limiter.
///
/// Windows are created lazily on first attempt. No smoothing: the count resets all at
/// once when the window elapses.
pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
    window: Duration,
    max_requests: u32,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
            clock,
        }
    }

    /// Check and consume one attempt for `identity`.
    pub fn check_and_consume(&self, identity: &str) -> bool {
        let now = self.clock.now();
        let mut window = self
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| Window {
                started_at: now,
                count: 0,
            });

        if now - window.started_at >= self.window {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.max_requests {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drops windows that have fully elapsed. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now - window.started_at < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn try_acquire(&self, identity: &str) -> bool {
        self.check_and_consume(identity)
    }

    fn retry_after(&self) -> Duration {
        self.window
    }
}

/// Background task that periodically drops elapsed windows.
pub async fn run_limiter_sweep(limiter: Arc<FixedWindowLimiter>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let evicted = limiter.evict_expired();
        tracing::debug!(
            evicted,
            remaining = limiter.tracked_identities(),
            "Rate limiter sweep complete"
        );
    }
}
