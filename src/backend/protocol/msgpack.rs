//! graphite-web msgpack protocol adapter
//!
//! Speaks the `format=msgpack` flavor of the graphite-web HTTP API:
//! `/render/` for datapoints, `/metrics/find/` for glob expansion, and the
//! JSON `/tags/autoComplete/*` endpoints for tag passthrough. Info, list
//! and details are not part of this protocol and report "not supported".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{bounded, http_client, status_error, transport_error, with_retries, ServerRotation};
use crate::backend::{BackendServer, Reply};
use crate::config::GroupConfig;
use crate::context::RequestContext;
use crate::errors::{Errors, RouterError};
use crate::stats::Stats;
use crate::types::{
    ConsolidationFunc, FetchTarget, FetchedMetric, GlobMatch, GlobResponse, MultiFetchRequest,
    MultiFetchResponse, MultiGlobRequest, MultiGlobResponse, Timeouts,
};

/// One series as graphite-web encodes it on the wire
#[derive(Debug, Serialize, Deserialize)]
struct WireMetric {
    name: String,
    #[serde(rename = "pathExpression", default)]
    path_expression: Option<String>,
    start: i64,
    end: i64,
    step: i64,
    /// `nil` marks an absent datapoint
    values: Vec<Option<f64>>,
}

/// One find entry as graphite-web encodes it
#[derive(Debug, Serialize, Deserialize)]
struct WireFindEntry {
    path: String,
    #[serde(default)]
    is_leaf: bool,
}

/// Convert one wire series into the uniform shape.
///
/// The stop time is recomputed from the value count so the response always
/// satisfies `(stop - start) / step + 1 == len(values)` even when the
/// backend reports a ragged window.
fn convert_metric(wire: WireMetric) -> FetchedMetric {
    let values: Vec<f64> = wire
        .values
        .iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    let step = wire.step.max(1);
    let stop = wire.start + step * (values.len() as i64 - 1).max(0);
    FetchedMetric {
        path_expression: wire.path_expression.unwrap_or_else(|| wire.name.clone()),
        name: wire.name,
        start_time: wire.start,
        stop_time: stop,
        step_time: step,
        consolidation_func: ConsolidationFunc::Average,
        values,
    }
}

/// Group targets by their (start, stop) window, first-seen order.
///
/// `/render/` carries one `from`/`until` pair per request, so targets with
/// differing windows go out as separate wire requests.
fn group_by_window(targets: &[FetchTarget]) -> Vec<((i64, i64), Vec<&FetchTarget>)> {
    let mut windows: Vec<((i64, i64), Vec<&FetchTarget>)> = Vec::new();
    for target in targets {
        let key = (target.start_time, target.stop_time);
        match windows.iter_mut().find(|(window, _)| *window == key) {
            Some((_, group)) => group.push(target),
            None => windows.push((key, vec![target])),
        }
    }
    windows
}

/// Adapter for one graphite-web-compatible backend group
pub struct MsgpackClient {
    name: String,
    rotation: ServerRotation,
    client: reqwest::Client,
    timeouts: Timeouts,
    max_tries: usize,
}

impl MsgpackClient {
    pub fn from_config(config: &GroupConfig) -> anyhow::Result<Self> {
        let timeouts = config.timeouts();
        Ok(Self {
            name: config.name.clone(),
            rotation: ServerRotation::new(config.servers.clone())?,
            client: http_client(&timeouts)?,
            timeouts,
            max_tries: config.max_tries,
        })
    }

    async fn get_msgpack<T: for<'de> Deserialize<'de>>(
        &self,
        ctx: &RequestContext,
        server: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<(T, u64), RouterError> {
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
            let body = response
                .bytes()
                .await
                .map_err(|e| transport_error(&self.name, &e))?;
            let decoded = rmp_serde::from_slice(&body).map_err(|e| RouterError::BackendFailed {
                backend: self.name.clone(),
                reason: format!("malformed msgpack response: {e}"),
            })?;
            Ok((decoded, body.len() as u64))
        })
        .await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
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
            response
                .json()
                .await
                .map_err(|e| transport_error(&self.name, &e))
        })
        .await
    }

    async fn find_one(
        &self,
        ctx: &RequestContext,
        stats: &mut Stats,
        query: &str,
    ) -> Result<GlobResponse, RouterError> {
        let (entries, bytes): (Vec<WireFindEntry>, u64) =
            with_retries(&self.name, &self.rotation, self.max_tries, stats, |server| {
                let query = [
                    ("format", "msgpack".to_string()),
                    ("query", query.to_string()),
                ];
                async move {
                    self.get_msgpack(ctx, &server, "/metrics/find/", &query)
                        .await
                }
            })
            .await?;
        stats.response_bytes += bytes;

        Ok(GlobResponse {
            name: query.to_string(),
            matches: entries
                .into_iter()
                .map(|entry| GlobMatch {
                    path: entry.path,
                    is_leaf: entry.is_leaf,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl BackendServer for MsgpackClient {
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
        if request.metrics.is_empty() {
            return Reply::fatal(RouterError::BadRequest {
                reason: "empty fetch request".to_string(),
            });
        }
        let ctx = ctx.child_with_timeout(self.timeouts.render);
        let ctx = &ctx;
        let mut stats = Stats::default();
        let mut errors = Errors::default();
        let mut response = MultiFetchResponse::default();

        for ((start, stop), targets) in group_by_window(&request.metrics) {
            let mut query: Vec<(&str, String)> = vec![
                ("format", "msgpack".to_string()),
                ("from", start.to_string()),
                ("until", stop.to_string()),
            ];
            for target in &targets {
                query.push(("target", target.name.clone()));
            }

            let result: Result<(Vec<WireMetric>, u64), RouterError> =
                with_retries(&self.name, &self.rotation, self.max_tries, &mut stats, |server| {
                    let query = query.clone();
                    async move { self.get_msgpack(ctx, &server, "/render/", &query).await }
                })
                .await;

            match result {
                Ok((wire, bytes)) => {
                    stats.response_bytes += bytes;
                    response
                        .metrics
                        .extend(wire.into_iter().map(convert_metric));
                }
                Err(err) => {
                    stats.render_errors += 1;
                    errors.add(err);
                }
            }
        }

        if response.metrics.is_empty() {
            errors.have_fatal_errors = true;
            if errors.is_empty() {
                stats.render_errors += 1;
                errors.add(RouterError::NotFound {
                    query: request
                        .metrics
                        .iter()
                        .map(|t| t.name.clone())
                        .collect::<Vec<_>>()
                        .join(","),
                });
            }
        } else if response.metrics.len() < request.metrics.len() {
            // Partial retrieval: usable data plus a recorded miss
            let returned: Vec<&str> = response.metrics.iter().map(|m| m.name.as_str()).collect();
            let missing: Vec<String> = request
                .metrics
                .iter()
                .filter(|t| !returned.contains(&t.name.as_str()))
                .map(|t| t.name.clone())
                .collect();
            debug!(backend = %self.name, ?missing, "partial fetch");
            errors.add(RouterError::NotFound {
                query: missing.join(","),
            });
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
        let mut errors = Errors::default();
        let mut response = MultiGlobResponse::default();

        for query in &request.metrics {
            match self.find_one(&ctx, &mut stats, query).await {
                Ok(glob) => response.metrics.push(glob),
                Err(err) => {
                    stats.find_errors += 1;
                    errors.add(err);
                }
            }
        }

        let total_matches: usize = response.metrics.iter().map(|g| g.matches.len()).sum();
        if total_matches == 0 {
            errors.have_fatal_errors = true;
            if errors.is_empty() {
                errors.add(RouterError::NotFound {
                    query: request.metrics.join(","),
                });
            }
        }

        Reply {
            response,
            stats,
            errors,
        }
    }

    async fn probe_tlds(&self, ctx: &RequestContext) -> Result<Vec<String>, RouterError> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats::default();
        let glob = self.find_one(&ctx, &mut stats, "*").await?;
        Ok(glob.matches.into_iter().map(|m| m.path).collect())
    }

    async fn tag_names(&self, ctx: &RequestContext, prefix: &str, limit: u64) -> Reply<Vec<String>> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let ctx = &ctx;
        let mut stats = Stats::default();
        let result = with_retries(&self.name, &self.rotation, self.max_tries, &mut stats, |server| {
            let query = [
                ("tagPrefix", prefix.to_string()),
                ("limit", limit.to_string()),
            ];
            async move {
                self.get_json(ctx, &server, "/tags/autoComplete/tags", &query)
                    .await
            }
        })
        .await;

        match result {
            Ok(names) => Reply {
                response: names,
                stats,
                errors: Errors::default(),
            },
            Err(err) => Reply::fatal_with_stats(err, stats),
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
        let result = with_retries(&self.name, &self.rotation, self.max_tries, &mut stats, |server| {
            let query = [
                ("tag", tag.to_string()),
                ("valuePrefix", prefix.to_string()),
                ("limit", limit.to_string()),
            ];
            async move {
                self.get_json(ctx, &server, "/tags/autoComplete/values", &query)
                    .await
            }
        })
        .await;

        match result {
            Ok(values) => Reply {
                response: values,
                stats,
                errors: Errors::default(),
            },
            Err(err) => Reply::fatal_with_stats(err, stats),
        }
    }
}
