//! TLD routing cache
//!
//! A best-effort, expiring map from a metric path's first segment to the
//! backends known to serve it, populated by the root group's periodic
//! probe. Lookups during fetch/find narrowing must never block or fail a
//! query: a miss simply means "ask every child" (fail open), because the
//! cache is an optimization, never a source of truth.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::BackendServer;

struct CacheEntry {
    backends: Vec<Arc<dyn BackendServer>>,
    expires_at: Instant,
}

/// Expiring TLD → backends map, written by the root probe path only
pub struct RoutingCache {
    entries: DashMap<String, CacheEntry>,
    expiry: Duration,
}

impl RoutingCache {
    /// Cache whose entries live for `expiry` after each store
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            expiry,
        }
    }

    /// Backends known to serve `tld`; `None` on a miss or an expired entry
    #[must_use]
    pub fn lookup(&self, tld: &str) -> Option<Vec<Arc<dyn BackendServer>>> {
        let entry = self.entries.get(tld)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.backends.clone())
    }

    /// Replace the entry for `tld`
    pub fn store(&self, tld: &str, backends: Vec<Arc<dyn BackendServer>>) {
        self.entries.insert(
            tld.to_string(),
            CacheEntry {
                backends,
                expires_at: Instant::now() + self.expiry,
            },
        );
    }

    /// Drop entries that expired; called opportunistically from the probe
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Unexpired TLDs currently cached, sorted (for logs and tests)
    #[must_use]
    pub fn tlds(&self) -> Vec<String> {
        let now = Instant::now();
        let mut tlds: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.key().clone())
            .collect();
        tlds.sort();
        tlds
    }

    /// Number of entries, including expired ones not yet evicted
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
