//! Scatter-gather composite backend
//!
//! A [`BroadcastGroup`] presents many children as one [`BackendServer`]:
//! it fans one logical request out to all (or a routing-cache-narrowed
//! subset of) its children concurrently, then merges their partial answers
//! under its own deadline.
//!
//! One worker task is spawned per (child, batch) unit. Each worker
//! acquires a limiter slot keyed by the child's name before calling it and
//! releases the slot on drop, no matter how the gather loop exits. Workers
//! report over a bounded queue read by a single gathering loop; when the
//! deadline fires, the loop counts every silent worker as a timeout,
//! cancels the operation context and finalizes with whatever was merged.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::{BackendServer, Reply};
use crate::context::RequestContext;
use crate::errors::{Errors, RouterError};
use crate::limiter::ConcurrencyLimiter;
use crate::merge;
use crate::routing::RoutingCache;
use crate::stats::Stats;
use crate::types::{
    FetchTarget, InfoResponse, MetricDetailsResponse, MultiFetchRequest, MultiFetchResponse,
    MultiGlobRequest, MultiGlobResponse, Timeouts,
};

use async_trait::async_trait;

/// Composite backend fanning requests out to child backends
pub struct BroadcastGroup {
    name: String,
    children: Vec<Arc<dyn BackendServer>>,
    limiter: ConcurrencyLimiter,
    timeouts: Timeouts,
    /// Split fetches into batches of at most this many metrics; 0 disables
    max_batch_size: usize,
    /// Present only on the process root; written by the probe path only
    routing_cache: Option<Arc<RoutingCache>>,
}

impl BroadcastGroup {
    /// Non-root group over the given children
    #[must_use]
    pub fn new(
        name: String,
        children: Vec<Arc<dyn BackendServer>>,
        limiter: ConcurrencyLimiter,
        timeouts: Timeouts,
        max_batch_size: usize,
    ) -> Self {
        Self {
            name,
            children,
            limiter,
            timeouts,
            max_batch_size,
            routing_cache: None,
        }
    }

    /// Promote this group to the process root carrying the shared
    /// routing cache
    #[must_use]
    pub fn into_root(mut self, cache: RoutingCache) -> Self {
        self.routing_cache = Some(Arc::new(cache));
        self
    }

    /// Whether this group is the process root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.routing_cache.is_some()
    }

    /// The shared routing cache, present on the root only
    #[must_use]
    pub fn routing_cache(&self) -> Option<&Arc<RoutingCache>> {
        self.routing_cache.as_ref()
    }

    /// Number of direct children
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Narrow the fan-out using the routing cache.
    ///
    /// Any TLD miss falls back to every child: the cache is a hint, not a
    /// source of truth, and an empty narrowing must never starve a query.
    fn filter_children(&self, tlds: &[String], stats: &mut Stats) -> Vec<Arc<dyn BackendServer>> {
        let Some(cache) = &self.routing_cache else {
            return self.children.clone();
        };

        let mut narrowed: Vec<Arc<dyn BackendServer>> = Vec::new();
        for tld in tlds {
            match cache.lookup(tld) {
                Some(backends) => {
                    stats.cache_hits += 1;
                    for backend in backends {
                        if !narrowed.iter().any(|b| b.name() == backend.name()) {
                            narrowed.push(backend);
                        }
                    }
                }
                None => {
                    stats.cache_misses += 1;
                    return self.children.clone();
                }
            }
        }

        if narrowed.is_empty() {
            // Fail open
            self.children.clone()
        } else {
            narrowed
        }
    }

    /// Single gathering loop shared by all scatter operations.
    ///
    /// Consumes worker reports until everyone answered or the context is
    /// done; on deadline every silent worker is recorded as one timeout
    /// and the context is cancelled so in-flight calls abandon their work.
    async fn gather<T>(
        &self,
        ctx: &RequestContext,
        mut rx: mpsc::Receiver<(usize, Reply<T>)>,
        mut pending: HashMap<usize, String>,
        stats: &mut Stats,
        errors: &mut Errors,
        mut on_response: impl FnMut(T, &mut Errors),
    ) {
        while !pending.is_empty() {
            tokio::select! {
                report = rx.recv() => {
                    let Some((index, reply)) = report else { break };
                    pending.remove(&index);
                    stats.merge(&reply.stats);
                    for err in reply.errors.errors {
                        errors.add(err);
                    }
                    on_response(reply.response, errors);
                }
                () = ctx.done() => {
                    debug!(
                        group = %self.name,
                        outstanding = pending.len(),
                        "deadline elapsed, finalizing with partial results"
                    );
                    for (_, child) in pending.drain() {
                        stats.timeouts += 1;
                        errors.add(RouterError::TimeoutExceeded { backend: child });
                    }
                    ctx.cancel();
                }
            }
        }
    }

    /// Resolve each requested name through a find sub-call and split the
    /// expanded target list into batches no larger than `max_batch_size`.
    ///
    /// Targets whose find fails keep their original name (fail open).
    async fn split_batches(
        &self,
        ctx: &RequestContext,
        request: &MultiFetchRequest,
        stats: &mut Stats,
        errors: &mut Errors,
    ) -> Vec<MultiFetchRequest> {
        let glob_request = MultiGlobRequest {
            metrics: request.metrics.iter().map(|t| t.name.clone()).collect(),
        };
        let find_reply = self.find(ctx, &glob_request).await;
        stats.merge(&find_reply.stats);
        for err in find_reply.errors.errors {
            errors.add(err);
        }

        let mut resolved: Vec<FetchTarget> = Vec::new();
        for target in &request.metrics {
            let matches = find_reply
                .response
                .metrics
                .iter()
                .find(|g| g.name == target.name)
                .map(|g| &g.matches[..])
                .unwrap_or(&[]);
            if matches.is_empty() {
                resolved.push(target.clone());
                continue;
            }
            for found in matches {
                if !found.is_leaf {
                    continue;
                }
                resolved.push(FetchTarget {
                    name: found.path.clone(),
                    ..target.clone()
                });
            }
        }

        resolved
            .chunks(self.max_batch_size)
            .map(|chunk| MultiFetchRequest {
                metrics: chunk.to_vec(),
            })
            .collect()
    }

    /// Union every child's probe answer, remembering which children
    /// reported each TLD. Root groups rewrite the routing cache from the
    /// result; everyone else only returns the union.
    async fn probe_children(
        &self,
        ctx: &RequestContext,
    ) -> (Vec<String>, HashMap<String, Vec<Arc<dyn BackendServer>>>, usize) {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let (tx, mut rx) = mpsc::channel(self.children.len().max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();

        for (index, child) in self.children.iter().enumerate() {
            pending.insert(index, child.name().to_string());
            let child = Arc::clone(child);
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match limiter.enter(child.name(), &ctx).await {
                    Ok(_permit) => child.probe_tlds(&ctx).await,
                    Err(err) => Err(err),
                };
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut union: Vec<String> = Vec::new();
        let mut by_tld: HashMap<String, Vec<Arc<dyn BackendServer>>> = HashMap::new();
        let mut failures = 0usize;

        while !pending.is_empty() {
            tokio::select! {
                report = rx.recv() => {
                    let Some((index, result)) = report else { break };
                    pending.remove(&index);
                    match result {
                        Ok(tlds) => {
                            let child = Arc::clone(&self.children[index]);
                            for tld in tlds {
                                if !union.contains(&tld) {
                                    union.push(tld.clone());
                                }
                                by_tld.entry(tld).or_default().push(Arc::clone(&child));
                            }
                        }
                        Err(err) => {
                            failures += 1;
                            debug!(group = %self.name, %err, "child failed TLD probe");
                        }
                    }
                }
                () = ctx.done() => {
                    failures += pending.len();
                    pending.clear();
                    ctx.cancel();
                }
            }
        }

        (union, by_tld, failures)
    }
}

#[async_trait]
impl BackendServer for BroadcastGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn backends(&self) -> Vec<String> {
        self.children
            .iter()
            .flat_map(|child| child.backends())
            .collect()
    }

    async fn fetch(
        &self,
        ctx: &RequestContext,
        request: &MultiFetchRequest,
    ) -> Reply<MultiFetchResponse> {
        let ctx = ctx.child_with_timeout(self.timeouts.render);
        let mut stats = Stats {
            render_requests: 1,
            ..Stats::default()
        };
        let mut errors = Errors::default();

        let children = self.filter_children(&request.tlds(), &mut stats);
        let batches = if self.max_batch_size > 0 {
            self.split_batches(&ctx, request, &mut stats, &mut errors)
                .await
        } else {
            vec![request.clone()]
        };

        let units = children.len() * batches.len();
        let (tx, rx) = mpsc::channel(units.max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();
        let mut index = 0;

        for child in &children {
            for batch in &batches {
                pending.insert(index, child.name().to_string());
                let child = Arc::clone(child);
                let batch = batch.clone();
                let ctx = ctx.clone();
                let limiter = self.limiter.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    // Slot held for the duration of the call, released on
                    // drop even if the gather loop is already gone
                    let reply = match limiter.enter(child.name(), &ctx).await {
                        Ok(_permit) => child.fetch(&ctx, &batch).await,
                        Err(err) => Reply::fatal_with_stats(
                            err,
                            Stats {
                                timeouts: 1,
                                ..Stats::default()
                            },
                        ),
                    };
                    let _ = tx.send((index, reply)).await;
                });
                index += 1;
            }
        }
        drop(tx);

        let mut merged = MultiFetchResponse::default();
        self.gather(&ctx, rx, pending, &mut stats, &mut errors, |response, errors| {
            merge::merge_fetch(&mut merged, response, errors);
        })
        .await;

        if merged.metrics.is_empty() {
            stats.render_errors += 1;
            errors.have_fatal_errors = true;
            if errors.is_empty() {
                errors.add(RouterError::NotFound {
                    query: format!("group '{}'", self.name),
                });
            }
        }

        Reply {
            response: merged,
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
        let mut stats = Stats {
            find_requests: 1,
            ..Stats::default()
        };
        let mut errors = Errors::default();

        // No pre-filtering: TLD knowledge is what find produces
        let (tx, rx) = mpsc::channel(self.children.len().max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();

        for (index, child) in self.children.iter().enumerate() {
            pending.insert(index, child.name().to_string());
            let child = Arc::clone(child);
            let request = request.clone();
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match limiter.enter(child.name(), &ctx).await {
                    Ok(_permit) => child.find(&ctx, &request).await,
                    Err(err) => Reply::fatal_with_stats(
                        err,
                        Stats {
                            timeouts: 1,
                            ..Stats::default()
                        },
                    ),
                };
                let _ = tx.send((index, reply)).await;
            });
        }
        drop(tx);

        let mut merged = MultiGlobResponse::default();
        self.gather(&ctx, rx, pending, &mut stats, &mut errors, |response, _| {
            merge::merge_find(&mut merged, response);
        })
        .await;

        let total_matches: usize = merged.metrics.iter().map(|g| g.matches.len()).sum();
        if total_matches == 0 {
            stats.find_errors += 1;
            errors.have_fatal_errors = true;
            if errors.is_empty() {
                errors.add(RouterError::NotFound {
                    query: request.metrics.join(","),
                });
            }
        }

        Reply {
            response: merged,
            stats,
            errors,
        }
    }

    async fn info(&self, ctx: &RequestContext, names: &[String]) -> Reply<InfoResponse> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats {
            info_requests: 1,
            ..Stats::default()
        };
        let mut errors = Errors::default();

        let (tx, rx) = mpsc::channel(self.children.len().max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();

        for (index, child) in self.children.iter().enumerate() {
            pending.insert(index, child.name().to_string());
            let child = Arc::clone(child);
            let names = names.to_vec();
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match limiter.enter(child.name(), &ctx).await {
                    Ok(_permit) => child.info(&ctx, &names).await,
                    Err(err) => Reply::fatal_with_stats(
                        err,
                        Stats {
                            timeouts: 1,
                            ..Stats::default()
                        },
                    ),
                };
                let _ = tx.send((index, reply)).await;
            });
        }
        drop(tx);

        let mut merged = InfoResponse::new();
        self.gather(&ctx, rx, pending, &mut stats, &mut errors, |response, _| {
            merge::merge_info(&mut merged, response);
        })
        .await;

        if merged.is_empty() {
            stats.info_errors += 1;
            errors.have_fatal_errors = true;
            if errors.is_empty() {
                errors.add(RouterError::NotFound {
                    query: names.join(","),
                });
            }
        }

        Reply {
            response: merged,
            stats,
            errors,
        }
    }

    async fn list(&self, ctx: &RequestContext) -> Reply<Vec<String>> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats::default();
        let mut errors = Errors::default();

        let (tx, rx) = mpsc::channel(self.children.len().max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();

        for (index, child) in self.children.iter().enumerate() {
            pending.insert(index, child.name().to_string());
            let child = Arc::clone(child);
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match limiter.enter(child.name(), &ctx).await {
                    Ok(_permit) => child.list(&ctx).await,
                    Err(err) => Reply::fatal(err),
                };
                let _ = tx.send((index, reply)).await;
            });
        }
        drop(tx);

        let mut merged: Vec<String> = Vec::new();
        self.gather(&ctx, rx, pending, &mut stats, &mut errors, |response, _| {
            merge::merge_list(&mut merged, response);
        })
        .await;

        if merged.is_empty() {
            errors.have_fatal_errors = true;
        }

        Reply {
            response: merged,
            stats,
            errors,
        }
    }

    async fn details(&self, ctx: &RequestContext) -> Reply<HashMap<String, MetricDetailsResponse>> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats::default();
        let mut errors = Errors::default();

        let (tx, rx) = mpsc::channel(self.children.len().max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();

        for (index, child) in self.children.iter().enumerate() {
            pending.insert(index, child.name().to_string());
            let child = Arc::clone(child);
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match limiter.enter(child.name(), &ctx).await {
                    Ok(_permit) => child.details(&ctx).await,
                    Err(err) => Reply::fatal(err),
                };
                let _ = tx.send((index, reply)).await;
            });
        }
        drop(tx);

        let mut merged: HashMap<String, MetricDetailsResponse> = HashMap::new();
        self.gather(&ctx, rx, pending, &mut stats, &mut errors, |response, _| {
            merge::merge_details(&mut merged, response);
        })
        .await;

        if merged.is_empty() {
            errors.have_fatal_errors = true;
        }

        Reply {
            response: merged,
            stats,
            errors,
        }
    }

    async fn probe_tlds(&self, ctx: &RequestContext) -> Result<Vec<String>, RouterError> {
        let (union, by_tld, failures) = self.probe_children(ctx).await;

        if union.is_empty() && failures > 0 {
            return Err(RouterError::BackendFailed {
                backend: self.name.clone(),
                reason: format!("all {failures} children failed TLD probe"),
            });
        }

        match &self.routing_cache {
            Some(cache) => {
                for (tld, backends) in by_tld {
                    cache.store(&tld, backends);
                }
                cache.evict_expired();
                debug!(group = %self.name, tlds = union.len(), "routing cache refreshed");
            }
            None => {
                // Only the root may touch the shared cache; a nested group
                // being asked to is a wiring mistake worth shouting about
                if failures == 0 && !union.is_empty() {
                    debug!(group = %self.name, "non-root probe, cache untouched");
                }
            }
        }

        Ok(union)
    }

    async fn tag_names(&self, ctx: &RequestContext, prefix: &str, limit: u64) -> Reply<Vec<String>> {
        let ctx = ctx.child_with_timeout(self.timeouts.find);
        let mut stats = Stats::default();
        let mut errors = Errors::default();

        let (tx, rx) = mpsc::channel(self.children.len().max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();

        for (index, child) in self.children.iter().enumerate() {
            pending.insert(index, child.name().to_string());
            let child = Arc::clone(child);
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            let prefix = prefix.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match limiter.enter(child.name(), &ctx).await {
                    Ok(_permit) => child.tag_names(&ctx, &prefix, limit).await,
                    Err(err) => Reply::fatal(err),
                };
                let _ = tx.send((index, reply)).await;
            });
        }
        drop(tx);

        let mut merged: Vec<String> = Vec::new();
        self.gather(&ctx, rx, pending, &mut stats, &mut errors, |response, _| {
            merge::merge_list(&mut merged, response);
        })
        .await;

        // An empty union is fatal only when something actually went wrong;
        // a tagless deployment legitimately answers with nothing
        if merged.is_empty() && !errors.is_empty() {
            errors.have_fatal_errors = true;
        }
        truncate_sorted(&mut merged, limit);

        Reply {
            response: merged,
            stats,
            errors,
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
        let mut stats = Stats::default();
        let mut errors = Errors::default();

        let (tx, rx) = mpsc::channel(self.children.len().max(1));
        let mut pending: HashMap<usize, String> = HashMap::new();

        for (index, child) in self.children.iter().enumerate() {
            pending.insert(index, child.name().to_string());
            let child = Arc::clone(child);
            let ctx = ctx.clone();
            let limiter = self.limiter.clone();
            let tag = tag.to_string();
            let prefix = prefix.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match limiter.enter(child.name(), &ctx).await {
                    Ok(_permit) => child.tag_values(&ctx, &tag, &prefix, limit).await,
                    Err(err) => Reply::fatal(err),
                };
                let _ = tx.send((index, reply)).await;
            });
        }
        drop(tx);

        let mut merged: Vec<String> = Vec::new();
        self.gather(&ctx, rx, pending, &mut stats, &mut errors, |response, _| {
            merge::merge_list(&mut merged, response);
        })
        .await;

        if merged.is_empty() && !errors.is_empty() {
            errors.have_fatal_errors = true;
        }
        truncate_sorted(&mut merged, limit);

        Reply {
            response: merged,
            stats,
            errors,
        }
    }
}

/// Keep at most `limit` entries of an already-sorted union; 0 means no cap
fn truncate_sorted(values: &mut Vec<String>, limit: u64) {
    if limit > 0 && values.len() as u64 > limit {
        values.truncate(limit as usize);
    }
}

impl std::fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .field("is_root", &self.is_root())
            .finish_non_exhaustive()
    }
}
