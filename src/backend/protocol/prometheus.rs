//! Prometheus-style HTTP protocol adapter
//!
//! Maps the uniform contract onto a Prometheus-compatible HTTP API:
//! `/api/v1/query_range` for datapoints, `/api/v1/label/__name__/values`
//! plus client-side glob filtering for find/list/probe, and
//! `/api/v1/labels` / `/api/v1/label/{tag}/values` for tag passthrough.
//! The info and details metadata queries have no Prometheus equivalent and
//! report "not supported".

use async_trait::async_trait;
use serde::Deserialize;

use super::{bounded, http_client, status_error, transport_error, with_retries, ServerRotation};
use crate::backend::{BackendServer, Reply};
use crate::config::GroupConfig;
use crate::context::RequestContext;
use crate::errors::{Errors, RouterError};
use crate::stats::Stats;
use crate::types::{
    metric_tld, ConsolidationFunc, FetchedMetric, GlobMatch, GlobResponse, MultiFetchRequest,
    MultiFetchResponse, MultiGlobRequest, MultiGlobResponse, Timeouts,
};

/// Default query_range resolution when the group config has no `step`
const DEFAULT_STEP_SECONDS: i64 = 60;

#[derive(Debug, Deserialize)]
struct WireEnvelope<T> {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WireRangeData {
    result: Vec<WireSeries>,
}

#[derive(Debug, Deserialize)]
struct WireSeries {
    metric: std::collections::HashMap<String, String>,
    /// Pairs of (timestamp, stringified value)
    values: Vec<(f64, String)>,
}

/// Does `name` match a graphite-style glob (`*` and `?` wildcards, where
/// `*` never crosses a dot)?
fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // Consume zero or more non-dot bytes
                matches(&p[1..], n)
                    || (!n.is_empty() && n[0] != b'.' && matches(p, &n[1..]))
            }
            (Some(b'?'), Some(c)) if *c != b'.' => matches(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

/// Whether a find query needs glob expansion at all
fn is_glob(query: &str) -> bool {
    query.contains(['*', '?', '[', '{'])
}

/// Place raw samples onto a fixed (start, step) grid, NaN-filling gaps
fn grid_values(samples: &[(f64, String)], start: i64, stop: i64, step: i64) -> Vec<f64> {
    let len = usize::try_from((stop - start) / step + 1).unwrap_or(0);
    let mut values = vec![f64::NAN; len];
    for (timestamp, value) in samples {
        let Ok(parsed) = value.parse::<f64>() else {
            continue;
        };
        let offset = (*timestamp as i64 - start) / step;
        if offset >= 0 {
            if let Some(slot) = values.get_mut(offset as usize) {
                *slot = parsed;
            }
        }
    }
    values
}

/// Adapter for one Prometheus-compatible backend group
pub struct PrometheusClient {
    name: String,
    rotation: ServerRotation,
    client: reqwest::Client,
    timeouts: Timeouts,
    max_tries: usize,
    step: i64,
}

impl PrometheusClient {
    pub fn from_config(config: &GroupConfig) -> anyhow::Result<Self> {
        let timeouts = config.timeouts();
        let step = config
            .options
            .get("step")
            .and_then(toml::Value::as_integer)
            .unwrap_or(DEFAULT_STEP_SECONDS);
        anyhow::ensure!(step > 0, "group '{}': step must be positive", config.name);
        Ok(Self {
            name: config.name.clone(),
            rotation: ServerRotation::new(config.servers.clone())?,
            client: http_client(&timeouts)?,
            timeouts,
            max_tries: config.max_tries,
            step,
        })
    }

    async fn get_api<T: for<'de> Deserialize<'de>>(
        &self,
        ctx: &RequestContext,
        server: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RouterError> {
        let url = format!("{server}{path}");
        let request = self.client.get(&url).query(query);
        bounded(ctx, &self.name, async {
            let response = request
                .send()
                .await
                .map_err(|e| transport_error(&self.name, &e))?;
            if let Some(err) = status_error(&self.name, response.status()) {
                return Err(err);
            }
            let envelope: WireEnvelope<T> = response
                .json()
                .await
                .map_err(|e| transport_error(&self.name, &e))?;
            if envelope.status != "success" {
                return Err(RouterError::BackendFailed {
                    backend: self.name.clone(),
                    reason: envelope
                        .error
                        .unwrap_or_else(|| "non-success api status".to_string()),
                });
            }
            envelope.data.ok_or_else(|| RouterError::BackendFailed {
                backend: self.name.clone(),
                reason: "missing data field".to_string(),
            })
        })
        .await
    }

    /// All metric names the backend knows
    async fn metric_names(
        &self,
        ctx: &RequestContext,
        stats: &mut Stats,
    ) -> Result<Vec<String>, RouterError> {
        with_retries(&self.name, &self.rotation, self.max_tries, stats, |server| async move {
            self.get_api(ctx, &server, "/api/v1/label/__name__/values", &[])
                .await
        })
        .await
    }

    /// Fetch one target's samples as a gridded series
    async fn fetch_one(
        &self,
        ctx: &RequestContext,
        stats: &mut Stats,
        name: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<FetchedMetric>, RouterError> {
        let start = start - start.rem_euclid(self.step);
        let stop = stop - stop.rem_euclid(self.step);
        let data: WireRangeData =
            with_retries(&self.name, &self.rotation, self.max_tries, stats, |server| {
                let query = [
                    ("query", name.to_string()),
                    ("start", start.to_string()),
                    ("end", stop.to_string()),
                    ("step", self.step.to_string()),
                ];
                async move {
                    self.get_api(ctx, &server, "/api/v1/query_range", &query)
                        .await
                }
            })
            .await?;

        Ok(data
            .result
            .into_iter()
            .map(|series| {
                let series_name = series
                    .metric
                    .get("__name__")
                    .cloned()
                    .unwrap_or_else(|| name.to_string());
                FetchedMetric {
                    name: series_name,
                    path_expression: name.to_string(),
                    start_time: start,
                    stop_time: stop,
                    step_time: self.step,
                    consolidation_func: ConsolidationFunc::Average,
                    values: grid_values(&series.values, start, stop, self.step),
                }
            })
            .collect())
    }
}

#[async_trait]
impl BackendServer for PrometheusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn backends(&self) -> Vec<String> {
        self.rotation.all().to_vec()
    }

    async fn fetch(
        &self,
        ctx: &RequestContext,
        request: &MultiFetchRequest,
    ) -> Reply<MultiFetchResponse> {
        let ctx = ctx.child_with_timeout(self.timeouts.render);
        let mut stats = Stats::default();
        let mut errors = Errors::default();
        let mut response = MultiFetchResponse::default();

        for target in &request.metrics {
            match self
                .fetch_one(&ctx, &mut stats, &target.name, target.start_time, target.stop_time)
                .await
            {
                Ok(metrics) => response.metrics.extend(metrics),
                Err(err) => {
                    stats.render_errors += 1;
                    errors.add(err);
                }
            }
        }

        if response.metrics.is_empty() {
            errors.have_fatal_errors = true;
            if errors.is_empty() {
                errors.add(RouterError::NotFound {
                    query: request
                        .metrics
                        .iter()
                        .map(|t| t.name.clone())
                        .collect::<Vec<_>>()
                        .join(","),
                });
            }
        }

        Reply {
            response,
            stats,
            errors,
        }
    }

    async fn find(
        &self,
        ctx: &RequestContext,
        request: &MultiGlobRequest,
    ) -> Reply<MultiGlobResponse> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats::default();

        let names = match self.metric_names(&ctx, &mut stats).await {
            Ok(names) => names,
            Err(err) => {
                stats.find_errors += 1;
                return Reply::fatal_with_stats(err, stats);
            }
        };

        let mut response = MultiGlobResponse::default();
        for query in &request.metrics {
            let matches: Vec<GlobMatch> = if is_glob(query) {
                names
                    .iter()
                    .filter(|name| glob_match(query, name))
                    .map(|name| GlobMatch {
                        path: name.clone(),
                        is_leaf: true,
                    })
                    .collect()
            } else {
                names
                    .iter()
                    .filter(|name| *name == query)
                    .map(|name| GlobMatch {
                        path: name.clone(),
                        is_leaf: true,
                    })
                    .collect()
            };
            response.metrics.push(GlobResponse {
                name: query.clone(),
                matches,
            });
        }

        let total_matches: usize = response.metrics.iter().map(|g| g.matches.len()).sum();
        let mut errors = Errors::default();
        if total_matches == 0 {
            stats.find_errors += 1;
            errors = Errors::fatal(RouterError::NotFound {
                query: request.metrics.join(","),
            });
        }

        Reply {
            response,
            stats,
            errors,
        }
    }

    async fn list(&self, ctx: &RequestContext) -> Reply<Vec<String>> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats::default();
        match self.metric_names(&ctx, &mut stats).await {
            Ok(mut names) => {
                names.sort();
                Reply {
                    response: names,
                    stats,
                    errors: Errors::default(),
                }
            }
            Err(err) => Reply::fatal_with_stats(err, stats),
        }
    }

    async fn probe_tlds(&self, ctx: &RequestContext) -> Result<Vec<String>, RouterError> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats::default();
        let names = self.metric_names(&ctx, &mut stats).await?;

        let mut tlds: Vec<String> = Vec::new();
        for name in &names {
            let tld = metric_tld(name);
            if !tlds.iter().any(|t| t == tld) {
                tlds.push(tld.to_string());
            }
        }
        Ok(tlds)
    }

    async fn tag_names(&self, ctx: &RequestContext, prefix: &str, limit: u64) -> Reply<Vec<String>> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let ctx = &ctx;
        let mut stats = Stats::default();
        let result: Result<Vec<String>, RouterError> =
            with_retries(&self.name, &self.rotation, self.max_tries, &mut stats, |server| {
                async move { self.get_api(ctx, &server, "/api/v1/labels", &[]).await }
            })
            .await;

        let labels = match result {
            Ok(labels) => labels,
            Err(err) => return Reply::fatal_with_stats(err, stats),
        };

        let mut names: Vec<String> = labels
            .into_iter()
            .filter(|label| prefix.is_empty() || label.starts_with(prefix))
            .collect();
        names.sort();
        if limit > 0 && names.len() as u64 > limit {
            names.truncate(limit as usize);
        }
        Reply {
            response: names,
            stats,
            errors: Errors::default(),
        }
    }

    async fn tag_values(
        &self,
        ctx: &RequestContext,
        tag: &str,
        prefix: &str,
        limit: u64,
    ) -> Reply<Vec<String>> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let ctx = &ctx;
        let mut stats = Stats::default();
        let path = format!("/api/v1/label/{tag}/values");
        let result: Result<Vec<String>, RouterError> =
            with_retries(&self.name, &self.rotation, self.max_tries, &mut stats, |server| {
                let path = path.clone();
                async move { self.get_api(ctx, &server, &path, &[]).await }
            })
            .await;

        let values = match result {
            Ok(values) => values,
            Err(err) => return Reply::fatal_with_stats(err, stats),
        };

        let mut filtered: Vec<String> = values
            .into_iter()
            .filter(|value| prefix.is_empty() || value.starts_with(prefix))
            .collect();
        filtered.sort();
        if limit > 0 && filtered.len() as u64 > limit {
            filtered.truncate(limit as usize);
        }
        Reply {
            response: filtered,
            stats,
            errors: Errors::default(),
        }
    }
}
