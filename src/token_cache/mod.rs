//! In-process cache of request-token secrets for in-flight handshakes.
//!
//! Saves a database round trip between `initiate` and `callback`. Entries are a copy of
//! what the credential store already persisted (encrypted); losing the cache never loses
//! data, it only forces a fallback read.

use crate::clock::Clock;
use crate::credentials::AgentId;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Default entry lifetime (10 minutes).
pub const DEFAULT_TTL_SECONDS: i64 = 600;

#[derive(Clone)]
struct CacheEntry {
    agent_id: AgentId,
    secret: String,
    inserted_at: DateTime<Utc>,
}

/// Cached request-token secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingHandshake {
    pub agent_id: AgentId,
    pub request_secret: String,
}

/// Time-bounded map from request token to its secret.
///
/// Shared across request handlers; `DashMap` provides the synchronization.
pub struct TemporaryTokenCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TemporaryTokenCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Inserts or overwrites the entry for `request_token` and restarts its TTL.
    pub fn put(&self, request_token: &str, agent_id: AgentId, secret: &str) {
        self.entries.insert(
            request_token.to_string(),
            CacheEntry {
                agent_id,
                secret: secret.to_string(),
                inserted_at: self.clock.now(),
            },
        );
    }

    /// Returns the entry unless it is missing or older than the TTL.
    pub fn get(&self, request_token: &str) -> Option<PendingHandshake> {
        let entry = self.entries.get(request_token)?;
        if self.is_expired(&entry, self.clock.now()) {
            return None;
        }
        Some(PendingHandshake {
            agent_id: entry.agent_id,
            request_secret: entry.secret.clone(),
        })
    }

    pub fn remove(&self, request_token: &str) {
        self.entries.remove(request_token);
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !self.is_expired(entry, now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.inserted_at > self.ttl
    }
}

/// Background task that periodically sweeps expired cache entries.
pub async fn run_cache_sweep(cache: Arc<TemporaryTokenCache>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let evicted = cache.evict_expired();
        tracing::debug!(
            evicted,
            remaining = cache.len(),
            "Request-token cache sweep complete"
        );
    }
}
