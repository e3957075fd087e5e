//! Monotonic operation counters
//!
//! Every backend call produces a `Stats` delta; parents fold deltas into
//! their own accumulator with [`Stats::merge`]. Counters only ever grow,
//! so merging is pure addition and safe to apply in any order.

use serde::{Deserialize, Serialize};

/// Counters accumulated over one scatter-gather operation (or the whole
/// process lifetime, at the router level)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Backend calls abandoned because a deadline fired
    pub timeouts: u64,
    /// Failed find calls
    pub find_errors: u64,
    /// Failed fetch calls
    pub render_errors: u64,
    /// Failed info calls
    pub info_errors: u64,
    /// Wire-level failures that were retried against another server
    pub retries: u64,
    /// Routing-cache lookups that narrowed the fan-out
    pub cache_hits: u64,
    /// Routing-cache lookups that fell back to all children
    pub cache_misses: u64,
    /// Completed find requests
    pub find_requests: u64,
    /// Completed fetch requests
    pub render_requests: u64,
    /// Completed info requests
    pub info_requests: u64,
    /// Response payload bytes read from backends
    pub response_bytes: u64,
}

impl Stats {
    /// Fold another delta into this accumulator. Purely additive; never
    /// decrements a counter.
    pub fn merge(&mut self, other: &Stats) {
        self.timeouts += other.timeouts;
        self.find_errors += other.find_errors;
        self.render_errors += other.render_errors;
        self.info_errors += other.info_errors;
        self.retries += other.retries;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.find_requests += other.find_requests;
        self.render_requests += other.render_requests;
        self.info_requests += other.info_requests;
        self.response_bytes += other.response_bytes;
    }
}

/// Where the router publishes merged stats after each call.
///
/// The actual metrics pipeline lives outside this crate; [`LogSink`] is the
/// built-in implementation that just logs snapshots.
pub trait StatsSink: Send + Sync {
    fn publish(&self, stats: &Stats);
}

/// Sink that logs snapshots at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatsSink for LogSink {
    fn publish(&self, stats: &Stats) {
        tracing::debug!(?stats, "stats snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_additive() {
        let mut a = Stats {
            timeouts: 1,
            render_errors: 2,
            ..Stats::default()
        };
        let b = Stats {
            timeouts: 3,
            cache_hits: 5,
            ..Stats::default()
        };

        a.merge(&b);
        assert_eq!(a.timeouts, 4);
        assert_eq!(a.render_errors, 2);
        assert_eq!(a.cache_hits, 5);
    }

    #[test]
    fn test_merge_default_is_identity() {
        let mut a = Stats {
            find_requests: 7,
            response_bytes: 1024,
            ..Stats::default()
        };
        let before = a;

        a.merge(&Stats::default());
        assert_eq!(a, before);
    }

    #[test]
    fn test_merge_commutes() {
        let a = Stats {
            timeouts: 1,
            retries: 2,
            ..Stats::default()
        };
        let b = Stats {
            timeouts: 10,
            info_errors: 4,
            ..Stats::default()
        };

        let mut ab = a;
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);
        assert_eq!(ab, ba);
    }
}
