//! Response merge algorithms
//!
//! Workers report in any order, so every merge here is commutative and
//! idempotent by construction: merging the same partial result twice never
//! changes the merged state or duplicates entries.
//!
//! Fetch merging for the same metric name:
//! - differing request start times are a hard mismatch, recorded and the
//!   incoming series skipped;
//! - equal steps: the series with fewer present (non-NaN) values acts as a
//!   patch source, filling NaN gaps in the authoritative series index by
//!   index;
//! - differing steps: the coarser (larger) step wins outright and the
//!   finer series is discarded with a warning. No interpolation is
//!   attempted; downstream consumers rely on "coarser wins" as a
//!   deterministic tie-break.

use std::collections::HashMap;
use tracing::warn;

use crate::errors::{Errors, RouterError};
use crate::types::{
    FetchedMetric, InfoResponse, MetricDetailsResponse, MultiFetchResponse, MultiGlobResponse,
};

/// Fold `incoming` fetch results into `dest`, recording mismatches
pub fn merge_fetch(dest: &mut MultiFetchResponse, incoming: MultiFetchResponse, errors: &mut Errors) {
    for metric in incoming.metrics {
        match dest.metrics.iter_mut().find(|m| m.name == metric.name) {
            Some(existing) => merge_series(existing, metric, errors),
            None => dest.metrics.push(metric),
        }
    }
}

/// Merge two series for the same metric name
fn merge_series(primary: &mut FetchedMetric, other: FetchedMetric, errors: &mut Errors) {
    if primary.start_time != other.start_time {
        errors.add(RouterError::StartTimeMismatch {
            metric: primary.name.clone(),
            ours: primary.start_time,
            theirs: other.start_time,
        });
        return;
    }

    if primary.step_time == other.step_time {
        patch_values(primary, other);
        return;
    }

    // Lossy corner case: keep the coarser series, drop the finer one
    warn!(
        metric = %primary.name,
        kept_step = primary.step_time.max(other.step_time),
        dropped_step = primary.step_time.min(other.step_time),
        "step mismatch while merging, keeping coarser series"
    );
    if other.step_time > primary.step_time {
        *primary = other;
    }
}

/// Equal-step merge: the series with more present values stays
/// authoritative, its NaN holes filled from the other at the same index
fn patch_values(primary: &mut FetchedMetric, mut other: FetchedMetric) {
    if other.present_values() > primary.present_values() {
        std::mem::swap(primary, &mut other);
    }
    for (index, value) in primary.values.iter_mut().enumerate() {
        if value.is_nan() {
            if let Some(patch) = other.values.get(index) {
                *value = *patch;
            }
        }
    }
}

/// Fold `incoming` find results into `dest`, deduplicating matches by
/// (query name, match path)
pub fn merge_find(dest: &mut MultiGlobResponse, incoming: MultiGlobResponse) {
    for glob in incoming.metrics {
        match dest.metrics.iter_mut().find(|g| g.name == glob.name) {
            Some(existing) => {
                for candidate in glob.matches {
                    if !existing.matches.iter().any(|m| m.path == candidate.path) {
                        existing.matches.push(candidate);
                    }
                }
            }
            None => {
                // Dedupe even a single backend's answer so the uniqueness
                // invariant holds regardless of what the wire carried
                let mut deduped = glob;
                let mut seen = Vec::with_capacity(deduped.matches.len());
                deduped.matches.retain(|m| {
                    if seen.contains(&m.path) {
                        false
                    } else {
                        seen.push(m.path.clone());
                        true
                    }
                });
                dest.metrics.push(deduped);
            }
        }
    }
}

/// Fold `incoming` info results into `dest`. Entries are keyed by server
/// identity; each server reports its own metadata, so a repeat of the same
/// key is simply replaced.
pub fn merge_info(dest: &mut InfoResponse, incoming: InfoResponse) {
    dest.extend(incoming);
}

/// Fold per-server metric details, keyed by server identity
pub fn merge_details(
    dest: &mut HashMap<String, MetricDetailsResponse>,
    incoming: HashMap<String, MetricDetailsResponse>,
) {
    dest.extend(incoming);
}

/// Union of metric name lists, deduplicated, order-independent
pub fn merge_list(dest: &mut Vec<String>, incoming: Vec<String>) {
    for name in incoming {
        if !dest.contains(&name) {
            dest.push(name);
        }
    }
    dest.sort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConsolidationFunc, GlobMatch, GlobResponse, MetricInfo};

    fn series(name: &str, start: i64, step: i64, values: Vec<f64>) -> FetchedMetric {
        let stop = start + step * (values.len() as i64 - 1);
        FetchedMetric {
            name: name.to_string(),
            path_expression: name.to_string(),
            start_time: start,
            stop_time: stop,
            step_time: step,
            consolidation_func: ConsolidationFunc::Average,
            values,
        }
    }

    fn response(metrics: Vec<FetchedMetric>) -> MultiFetchResponse {
        MultiFetchResponse { metrics }
    }

    #[test]
    fn test_fetch_merge_patches_nan_holes() {
        // Two children report "foo.bar", step 60, start 60:
        // [1,2,3] and [1,NaN,3] must merge to [1,2,3]
        let mut dest = response(vec![series("foo.bar", 60, 60, vec![1.0, 2.0, 3.0])]);
        let incoming = response(vec![series("foo.bar", 60, 60, vec![1.0, f64::NAN, 3.0])]);
        let mut errors = Errors::default();

        merge_fetch(&mut dest, incoming, &mut errors);
        assert!(errors.is_empty());
        assert_eq!(dest.metrics.len(), 1);
        assert_eq!(dest.metrics[0].values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_fetch_merge_commutes() {
        let a = response(vec![series("foo.bar", 60, 60, vec![1.0, f64::NAN, 3.0])]);
        let b = response(vec![series("foo.bar", 60, 60, vec![f64::NAN, 2.0, f64::NAN])]);

        let mut ab = a.clone();
        let mut errors = Errors::default();
        merge_fetch(&mut ab, b.clone(), &mut errors);

        let mut ba = b;
        merge_fetch(&mut ba, a, &mut errors);

        assert!(errors.is_empty());
        assert_eq!(ab, ba);
        assert_eq!(ab.metrics[0].values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_fetch_merge_idempotent() {
        let a = response(vec![series("foo.bar", 60, 60, vec![1.0, f64::NAN, 3.0])]);
        let mut merged = a.clone();
        let mut errors = Errors::default();

        merge_fetch(&mut merged, a.clone(), &mut errors);
        assert!(errors.is_empty());
        assert_eq!(merged, a);
    }

    #[test]
    fn test_fetch_merge_start_mismatch_recorded() {
        let mut dest = response(vec![series("foo.bar", 60, 60, vec![1.0, 2.0])]);
        let incoming = response(vec![series("foo.bar", 120, 60, vec![3.0, 4.0])]);
        let mut errors = Errors::default();

        merge_fetch(&mut dest, incoming, &mut errors);
        assert_eq!(errors.errors.len(), 1);
        assert!(matches!(
            errors.errors[0],
            RouterError::StartTimeMismatch { .. }
        ));
        // Authoritative series untouched
        assert_eq!(dest.metrics[0].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_fetch_merge_coarser_step_wins() {
        let mut dest = response(vec![series("foo.bar", 60, 60, vec![1.0, 2.0, 3.0, 4.0])]);
        let incoming = response(vec![series("foo.bar", 60, 120, vec![10.0, 30.0])]);
        let mut errors = Errors::default();

        merge_fetch(&mut dest, incoming, &mut errors);
        assert!(errors.is_empty());
        assert_eq!(dest.metrics[0].step_time, 120);
        assert_eq!(dest.metrics[0].values, vec![10.0, 30.0]);

        // And the same outcome when the coarser series arrives first
        let mut dest = response(vec![series("foo.bar", 60, 120, vec![10.0, 30.0])]);
        let incoming = response(vec![series("foo.bar", 60, 60, vec![1.0, 2.0, 3.0, 4.0])]);
        merge_fetch(&mut dest, incoming, &mut errors);
        assert_eq!(dest.metrics[0].step_time, 120);
        assert_eq!(dest.metrics[0].values, vec![10.0, 30.0]);
    }

    #[test]
    fn test_fetch_merge_distinct_names_concatenate() {
        let mut dest = response(vec![series("a.one", 60, 60, vec![1.0])]);
        let incoming = response(vec![series("a.two", 60, 60, vec![2.0])]);
        let mut errors = Errors::default();

        merge_fetch(&mut dest, incoming, &mut errors);
        assert_eq!(dest.metrics.len(), 2);
    }

    fn glob(name: &str, paths: &[(&str, bool)]) -> MultiGlobResponse {
        MultiGlobResponse {
            metrics: vec![GlobResponse {
                name: name.to_string(),
                matches: paths
                    .iter()
                    .map(|(path, is_leaf)| GlobMatch {
                        path: (*path).to_string(),
                        is_leaf: *is_leaf,
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn test_find_merge_deduplicates() {
        // Children report {a.b.c} and {a.b.c, a.b.d}: exactly two matches
        let mut dest = glob("a.b.*", &[("a.b.c", true)]);
        let incoming = glob("a.b.*", &[("a.b.c", true), ("a.b.d", true)]);

        merge_find(&mut dest, incoming);
        assert_eq!(dest.metrics.len(), 1);
        let paths: Vec<&str> = dest.metrics[0]
            .matches
            .iter()
            .map(|m| m.path.as_str())
            .collect();
        assert_eq!(paths, vec!["a.b.c", "a.b.d"]);
    }

    #[test]
    fn test_find_merge_idempotent() {
        let a = glob("a.b.*", &[("a.b.c", true), ("a.b.d", false)]);
        let mut merged = a.clone();

        merge_find(&mut merged, a.clone());
        assert_eq!(merged, a);
    }

    #[test]
    fn test_find_merge_dedupes_first_insert() {
        let mut dest = MultiGlobResponse::default();
        let incoming = glob("a.*", &[("a.b", true), ("a.b", true)]);

        merge_find(&mut dest, incoming);
        assert_eq!(dest.metrics[0].matches.len(), 1);
    }

    #[test]
    fn test_find_merge_separate_queries_kept_apart() {
        let mut dest = glob("a.*", &[("a.b", true)]);
        let incoming = glob("c.*", &[("c.d", true)]);

        merge_find(&mut dest, incoming);
        assert_eq!(dest.metrics.len(), 2);
    }

    #[test]
    fn test_info_merge_keyed_by_server() {
        let mut dest = InfoResponse::new();
        dest.insert(
            "server-a".to_string(),
            MetricInfo {
                name: "foo.bar".to_string(),
                ..MetricInfo::default()
            },
        );
        let mut incoming = InfoResponse::new();
        incoming.insert(
            "server-b".to_string(),
            MetricInfo {
                name: "foo.bar".to_string(),
                ..MetricInfo::default()
            },
        );

        merge_info(&mut dest, incoming.clone());
        assert_eq!(dest.len(), 2);

        // Idempotent under repeated application
        merge_info(&mut dest, incoming);
        assert_eq!(dest.len(), 2);
    }

    #[test]
    fn test_details_merge_keyed_by_server() {
        use crate::types::MetricDetails;

        fn server_details(metric: &str) -> MetricDetailsResponse {
            let mut metrics = HashMap::new();
            metrics.insert(
                metric.to_string(),
                MetricDetails {
                    size_bytes: 4096,
                    mod_time: 1_700_000_000,
                },
            );
            MetricDetailsResponse {
                metrics,
                free_space: 1000,
                total_space: 2000,
            }
        }

        let mut dest = HashMap::new();
        dest.insert("server-a".to_string(), server_details("foo.bar"));
        let mut incoming = HashMap::new();
        incoming.insert("server-b".to_string(), server_details("foo.baz"));

        merge_details(&mut dest, incoming.clone());
        assert_eq!(dest.len(), 2);
        assert!(dest["server-a"].metrics.contains_key("foo.bar"));
        assert!(dest["server-b"].metrics.contains_key("foo.baz"));

        // Idempotent under repeated application
        merge_details(&mut dest, incoming);
        assert_eq!(dest.len(), 2);
    }

    #[test]
    fn test_list_merge_unions_and_sorts() {
        let mut dest = vec!["b.one".to_string(), "a.two".to_string()];
        merge_list(&mut dest, vec!["a.two".to_string(), "a.one".to_string()]);
        assert_eq!(dest, vec!["a.one", "a.two", "b.one"]);
    }
}
