//! Uniform request/response shapes shared by every backend protocol
//!
//! Protocol adapters translate their wire formats into these types; the
//! broadcast/merge layer and the query router only ever see these shapes.
//!
//! Absent datapoints are represented as `f64::NAN` inside `values` rather
//! than a separate presence bitmap.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Extract the top-level path segment ("TLD") of a metric path or glob.
///
/// The TLD is the routing key for the routing cache: `"carbon.agents.a1"`
/// and `"carbon.*"` both route by `"carbon"`. Unrelated to DNS.
///
/// # Examples
/// ```
/// use tsrouter::types::metric_tld;
///
/// assert_eq!(metric_tld("carbon.agents.a1.cpu"), "carbon");
/// assert_eq!(metric_tld("servers"), "servers");
/// assert_eq!(metric_tld(""), "");
/// ```
#[must_use]
pub fn metric_tld(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// One requested metric within a fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchTarget {
    /// Metric name or glob to fetch
    pub name: String,
    /// The path expression the caller originally wrote (kept verbatim so
    /// responses can be keyed back to the request)
    pub path_expression: String,
    /// Inclusive start timestamp (seconds since epoch)
    pub start_time: i64,
    /// Inclusive stop timestamp (seconds since epoch)
    pub stop_time: i64,
    /// Cap on returned datapoints; 0 means no cap
    #[serde(default)]
    pub max_data_points: i64,
}

/// A fetch of one or more metrics over a common time window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiFetchRequest {
    pub metrics: Vec<FetchTarget>,
}

impl MultiFetchRequest {
    /// Build a single-target request; the path expression defaults to the name.
    #[must_use]
    pub fn single(name: &str, start_time: i64, stop_time: i64) -> Self {
        Self {
            metrics: vec![FetchTarget {
                name: name.to_string(),
                path_expression: name.to_string(),
                start_time,
                stop_time,
                max_data_points: 0,
            }],
        }
    }

    /// Unique TLDs over all requested metric names, in first-seen order
    #[must_use]
    pub fn tlds(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for target in &self.metrics {
            let tld = metric_tld(&target.name);
            if !seen.iter().any(|s| s == tld) {
                seen.push(tld.to_string());
            }
        }
        seen
    }
}

/// How a series was consolidated at the storage layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationFunc {
    #[default]
    Average,
    Sum,
    Min,
    Max,
    Last,
}

/// One series of datapoints for one metric
///
/// Invariant: `(stop_time - start_time) / step_time + 1 == values.len()`.
/// Missing datapoints are `f64::NAN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMetric {
    pub name: String,
    pub path_expression: String,
    pub start_time: i64,
    pub stop_time: i64,
    /// Sampling interval in seconds; always positive
    pub step_time: i64,
    pub consolidation_func: ConsolidationFunc,
    pub values: Vec<f64>,
}

impl FetchedMetric {
    /// Number of values the time window implies
    #[must_use]
    pub fn expected_len(&self) -> usize {
        if self.step_time <= 0 {
            return 0;
        }
        usize::try_from((self.stop_time - self.start_time) / self.step_time + 1).unwrap_or(0)
    }

    /// Count of present (non-NaN) datapoints
    #[must_use]
    pub fn present_values(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }
}

impl PartialEq for FetchedMetric {
    /// Equality treats NaN values at the same index as equal, so merged
    /// results can be compared directly in tests.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.start_time == other.start_time
            && self.stop_time == other.stop_time
            && self.step_time == other.step_time
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
    }
}

/// Merged fetch result across all backends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiFetchResponse {
    pub metrics: Vec<FetchedMetric>,
}

/// A find over one or more glob queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiGlobRequest {
    pub metrics: Vec<String>,
}

impl MultiGlobRequest {
    #[must_use]
    pub fn single(query: &str) -> Self {
        Self {
            metrics: vec![query.to_string()],
        }
    }
}

/// One glob match: a concrete path and whether it is a leaf metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobMatch {
    pub path: String,
    pub is_leaf: bool,
}

/// All matches for one glob query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobResponse {
    /// The query string this response answers
    pub name: String,
    pub matches: Vec<GlobMatch>,
}

/// Merged find result across all backends
///
/// Invariant: for each inner response, matches are unique by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiGlobResponse {
    pub metrics: Vec<GlobResponse>,
}

/// One retention archive of a stored metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub seconds_per_point: i64,
    pub number_of_points: i64,
}

/// Storage metadata for one metric, as one server reports it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub name: String,
    pub aggregation_method: String,
    pub max_retention: i64,
    pub x_files_factor: f64,
    pub retentions: Vec<Retention>,
}

/// Info responses keyed by the reporting server's identity
pub type InfoResponse = HashMap<String, MetricInfo>;

/// Per-metric file details from the `Details` metadata query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDetails {
    pub size_bytes: i64,
    pub mod_time: i64,
}

/// Details for all metrics one server holds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDetailsResponse {
    pub metrics: HashMap<String, MetricDetails>,
    pub free_space: u64,
    pub total_space: u64,
}

/// Deadlines one backend group applies per operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP/TLS connect budget
    pub connect: Duration,
    /// Find, info, probe and other metadata operations
    pub find: Duration,
    /// Datapoint fetches
    pub render: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(200),
            find: Duration::from_secs(2),
            render: Duration::from_secs(10),
        }
    }
}

/// How a group spreads one logical request over its servers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalanceMethod {
    /// One server per attempt, rotating; failures retry the next server
    #[default]
    RoundRobin,
    /// Every server gets the request; answers are merged
    Broadcast,
}
