//! Outer query surface over the root broadcast group
//!
//! [`QueryRouter`] is what an embedding server talks to. It owns the
//! top-level deadline for each operation class, publishes merged counters
//! to a [`StatsSink`] after every call, collapses the accumulated failures
//! into one externally-visible status, and runs the periodic TLD probe
//! that keeps the routing cache warm.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::broadcast::BroadcastGroup;
use crate::backend::{BackendServer, Reply};
use crate::config::RouterConfig;
use crate::context::RequestContext;
use crate::errors::{ApiStatus, Errors, RouterError};
use crate::stats::{Stats, StatsSink};
use crate::types::{
    InfoResponse, MetricDetailsResponse, MultiFetchRequest, MultiFetchResponse, MultiGlobRequest,
    MultiGlobResponse, Timeouts,
};

/// What a caller sees when an operation yields no usable data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    pub status: ApiStatus,
    pub message: String,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status.as_u16())
    }
}

impl std::error::Error for QueryError {}

impl QueryError {
    fn from_errors(errors: &Errors) -> Self {
        Self {
            status: errors.status(),
            message: errors
                .summary()
                .unwrap_or_else(|| "no usable data".to_string()),
        }
    }
}

impl From<&RouterError> for QueryError {
    fn from(err: &RouterError) -> Self {
        Self {
            status: ApiStatus::from(err),
            message: err.to_string(),
        }
    }
}

/// Successful operation outcome: data plus the counters behind it.
/// Non-fatal failures that occurred along the way ride along for logging
/// or response annotation by the embedding server.
#[derive(Debug, Clone)]
pub struct QueryOutcome<T> {
    pub data: T,
    pub stats: Stats,
    pub partial_errors: Vec<RouterError>,
}

/// Front door for all query traffic
pub struct QueryRouter {
    root: Arc<BroadcastGroup>,
    timeouts: Timeouts,
    sink: Arc<dyn StatsSink>,
    shutdown: CancellationToken,
    probe_trigger: mpsc::Sender<()>,
}

impl QueryRouter {
    /// Wrap the root group and start the background probe loop.
    ///
    /// The loop probes once immediately so the routing cache is warm
    /// before the first query, then re-probes every `probe_interval` or
    /// whenever [`QueryRouter::force_probe`] is called.
    #[must_use]
    pub fn start(
        root: Arc<BroadcastGroup>,
        config: &RouterConfig,
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (probe_trigger, probe_rx) = mpsc::channel(1);

        tokio::spawn(probe_loop(
            Arc::clone(&root),
            config.probe_interval,
            config.find_timeout,
            shutdown.clone(),
            probe_rx,
        ));

        Self {
            root,
            timeouts: config.timeouts(),
            sink,
            shutdown,
            probe_trigger,
        }
    }

    /// Retrieve and merge datapoints for every requested target
    pub async fn fetch(
        &self,
        request: &MultiFetchRequest,
    ) -> Result<QueryOutcome<MultiFetchResponse>, QueryError> {
        if request.metrics.is_empty() {
            return Err(QueryError {
                status: ApiStatus::BadRequest,
                message: "empty fetch request".to_string(),
            });
        }
        let ctx = RequestContext::with_timeout(self.timeouts.render);
        let reply = self.root.fetch(&ctx, request).await;
        self.finish("fetch", reply)
    }

    /// Expand globs across every group
    pub async fn find(
        &self,
        request: &MultiGlobRequest,
    ) -> Result<QueryOutcome<MultiGlobResponse>, QueryError> {
        if request.metrics.is_empty() {
            return Err(QueryError {
                status: ApiStatus::BadRequest,
                message: "empty find request".to_string(),
            });
        }
        let ctx = RequestContext::with_timeout(self.timeouts.find);
        let reply = self.root.find(&ctx, request).await;
        self.finish("find", reply)
    }

    /// Storage metadata for the given metric names, keyed by server
    pub async fn info(&self, names: &[String]) -> Result<QueryOutcome<InfoResponse>, QueryError> {
        let ctx = RequestContext::with_timeout(self.timeouts.find);
        let reply = self.root.info(&ctx, names).await;
        self.finish("info", reply)
    }

    /// Union of every metric name any group knows
    pub async fn list(&self) -> Result<QueryOutcome<Vec<String>>, QueryError> {
        let ctx = RequestContext::with_timeout(self.timeouts.find);
        let reply = self.root.list(&ctx).await;
        self.finish("list", reply)
    }

    /// Per-metric file details from every group, keyed by server
    pub async fn details(
        &self,
    ) -> Result<QueryOutcome<std::collections::HashMap<String, MetricDetailsResponse>>, QueryError>
    {
        let ctx = RequestContext::with_timeout(self.timeouts.find);
        let reply = self.root.details(&ctx).await;
        self.finish("details", reply)
    }

    /// Tag name autocomplete across every group
    pub async fn tag_names(
        &self,
        prefix: &str,
        limit: u64,
    ) -> Result<QueryOutcome<Vec<String>>, QueryError> {
        let ctx = RequestContext::with_timeout(self.timeouts.find);
        let reply = self.root.tag_names(&ctx, prefix, limit).await;
        self.finish("tag_names", reply)
    }

    /// Tag value autocomplete across every group
    pub async fn tag_values(
        &self,
        tag: &str,
        prefix: &str,
        limit: u64,
    ) -> Result<QueryOutcome<Vec<String>>, QueryError> {
        let ctx = RequestContext::with_timeout(self.timeouts.find);
        let reply = self.root.tag_values(&ctx, tag, prefix, limit).await;
        self.finish("tag_values", reply)
    }

    /// Ask the probe loop to refresh the routing cache ahead of schedule.
    /// A refresh already in flight absorbs the request.
    pub fn force_probe(&self) {
        let _ = self.probe_trigger.try_send(());
    }

    /// Stop the background probe loop
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Addresses of every concrete server reachable below the root
    #[must_use]
    pub fn backends(&self) -> Vec<String> {
        self.root.backends()
    }

    /// Publish counters and collapse the reply into the outer result shape
    fn finish<T>(&self, operation: &str, reply: Reply<T>) -> Result<QueryOutcome<T>, QueryError> {
        self.sink.publish(&reply.stats);
        log_errors(operation, &reply.errors);

        if reply.errors.have_fatal_errors {
            return Err(QueryError::from_errors(&reply.errors));
        }
        Ok(QueryOutcome {
            data: reply.response,
            stats: reply.stats,
            partial_errors: reply.errors.errors,
        })
    }
}

impl Drop for QueryRouter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Report accumulated failures at each error's own level
fn log_errors(operation: &str, errors: &Errors) {
    for err in &errors.errors {
        match err.log_level() {
            tracing::Level::DEBUG => debug!(operation, %err, "backend error"),
            tracing::Level::INFO => info!(operation, %err, "backend error"),
            _ => warn!(operation, %err, "backend error"),
        }
    }
}

/// Periodic TLD probe keeping the root's routing cache warm
async fn probe_loop(
    root: Arc<BroadcastGroup>,
    interval: Duration,
    probe_timeout: Duration,
    shutdown: CancellationToken,
    mut trigger: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = trigger.recv() => {
                debug!("forced routing probe");
            }
            () = shutdown.cancelled() => {
                debug!("probe loop stopped");
                return;
            }
        }

        let ctx = RequestContext::with_timeout(probe_timeout);
        match root.probe_tlds(&ctx).await {
            Ok(tlds) => {
                debug!(tlds = tlds.len(), "routing probe completed");
            }
            Err(err) => {
                warn!(%err, "routing probe failed, keeping previous cache");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_err() -> RouterError {
        RouterError::TimeoutExceeded {
            backend: "g1".to_string(),
        }
    }

    #[test]
    fn test_query_error_from_fatal_errors() {
        let mut errors = Errors::fatal(RouterError::NotFound {
            query: "a.*".to_string(),
        });
        errors.add(timeout_err());

        let err = QueryError::from_errors(&errors);
        assert_eq!(err.status, ApiStatus::ServiceUnavailable);
        assert!(err.message.contains("g1"));
    }

    #[test]
    fn test_query_error_from_single_error() {
        let err = QueryError::from(&RouterError::BadRequest {
            reason: "bad glob".to_string(),
        });
        assert_eq!(err.status, ApiStatus::BadRequest);
        assert_eq!(err.status.as_u16(), 400);
    }

    #[test]
    fn test_query_error_display_carries_status_code() {
        let err = QueryError::from(&timeout_err());
        let rendered = err.to_string();
        assert!(rendered.contains("503"));
        assert!(rendered.contains("g1"));
    }
}
