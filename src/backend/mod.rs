//! Backend abstraction: one contract for leaves and composites
//!
//! A [`BackendServer`] is either a concrete protocol client doing real
//! network I/O or a [`broadcast::BroadcastGroup`] fanning out to children
//! that satisfy the same contract. The composite holds trait objects, so
//! cluster topologies nest to arbitrary depth without special cases.
//!
//! Protocol adapters are instantiated by name through a
//! [`ProtocolRegistry`] value built at startup and passed explicitly;
//! there is no global constructor map.

pub mod broadcast;
pub mod protocol;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, GroupConfig};
use crate::context::RequestContext;
use crate::errors::{Errors, RouterError};
use crate::limiter::ConcurrencyLimiter;
use crate::routing::RoutingCache;
use crate::stats::Stats;
use crate::types::{
    InfoResponse, LoadBalanceMethod, MetricDetailsResponse, MultiFetchRequest, MultiFetchResponse,
    MultiGlobRequest, MultiGlobResponse,
};

/// Outcome of one backend operation: data, counters and accumulated
/// failures travel together so partial results survive partial failure
#[derive(Debug, Clone, Default)]
pub struct Reply<T> {
    pub response: T,
    pub stats: Stats,
    pub errors: Errors,
}

impl<T: Default> Reply<T> {
    /// Successful reply with no failures
    #[must_use]
    pub fn ok(response: T) -> Self {
        Self {
            response,
            stats: Stats::default(),
            errors: Errors::default(),
        }
    }

    /// Reply carrying no usable data
    #[must_use]
    pub fn fatal(err: RouterError) -> Self {
        Self {
            response: T::default(),
            stats: Stats::default(),
            errors: Errors::fatal(err),
        }
    }

    /// Fatal reply that still reports counters (e.g. a timeout increment)
    #[must_use]
    pub fn fatal_with_stats(err: RouterError, stats: Stats) -> Self {
        Self {
            response: T::default(),
            stats,
            errors: Errors::fatal(err),
        }
    }
}

/// The capability contract every backend satisfies.
///
/// Metadata operations default to "not supported", which is non-fatal to a
/// parent group unless every child fails identically.
#[async_trait]
pub trait BackendServer: Send + Sync {
    /// Identity used for limiter slots, info keying and log lines
    fn name(&self) -> &str;

    /// Addresses of the concrete servers reachable below this node
    fn backends(&self) -> Vec<String>;

    /// Retrieve datapoints. Non-fatal errors mean some but not all
    /// requested series came back; fatal means none did.
    async fn fetch(&self, ctx: &RequestContext, request: &MultiFetchRequest)
        -> Reply<MultiFetchResponse>;

    /// Expand globs. Fatal only if the glob matched nothing anywhere.
    async fn find(&self, ctx: &RequestContext, request: &MultiGlobRequest)
        -> Reply<MultiGlobResponse>;

    /// Storage metadata for the given metric names, keyed by server
    async fn info(&self, _ctx: &RequestContext, _names: &[String]) -> Reply<InfoResponse> {
        Reply::fatal(RouterError::NotSupportedByBackend {
            backend: self.name().to_string(),
        })
    }

    /// Every metric name this backend knows
    async fn list(&self, _ctx: &RequestContext) -> Reply<Vec<String>> {
        Reply::fatal(RouterError::NotSupportedByBackend {
            backend: self.name().to_string(),
        })
    }

    /// Per-metric file details, keyed by server
    async fn details(
        &self,
        _ctx: &RequestContext,
    ) -> Reply<HashMap<String, MetricDetailsResponse>> {
        Reply::fatal(RouterError::NotSupportedByBackend {
            backend: self.name().to_string(),
        })
    }

    /// Top-level path segments this backend currently serves. Used only
    /// for routing-cache population.
    async fn probe_tlds(&self, ctx: &RequestContext) -> Result<Vec<String>, RouterError>;

    /// Tag name autocomplete passthrough
    async fn tag_names(
        &self,
        _ctx: &RequestContext,
        _prefix: &str,
        _limit: u64,
    ) -> Reply<Vec<String>> {
        Reply::fatal(RouterError::NotSupportedByBackend {
            backend: self.name().to_string(),
        })
    }

    /// Tag value autocomplete passthrough
    async fn tag_values(
        &self,
        _ctx: &RequestContext,
        _tag: &str,
        _prefix: &str,
        _limit: u64,
    ) -> Reply<Vec<String>> {
        Reply::fatal(RouterError::NotSupportedByBackend {
            backend: self.name().to_string(),
        })
    }
}

/// Constructor for one protocol adapter
pub type ClientConstructor =
    Box<dyn Fn(&GroupConfig) -> anyhow::Result<Arc<dyn BackendServer>> + Send + Sync>;

/// Explicit map from protocol name to adapter constructor.
///
/// Built once at startup and passed by reference wherever adapters are
/// instantiated by name.
#[derive(Default)]
pub struct ProtocolRegistry {
    constructors: HashMap<String, ClientConstructor>,
}

impl ProtocolRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the adapters this crate ships
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("msgpack", |cfg| {
            Ok(Arc::new(protocol::msgpack::MsgpackClient::from_config(cfg)?) as _)
        });
        registry.register("prometheus", |cfg| {
            Ok(Arc::new(protocol::prometheus::PrometheusClient::from_config(cfg)?) as _)
        });
        registry
    }

    /// Register (or replace) the constructor for `protocol`
    pub fn register<F>(&mut self, protocol: &str, constructor: F)
    where
        F: Fn(&GroupConfig) -> anyhow::Result<Arc<dyn BackendServer>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(protocol.to_string(), Box::new(constructor));
    }

    /// Protocol names currently registered, sorted
    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate the adapter for one configured group
    pub fn create(&self, config: &GroupConfig) -> anyhow::Result<Arc<dyn BackendServer>> {
        let constructor = self.constructors.get(&config.protocol).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown protocol '{}' for group '{}' (registered: {})",
                config.protocol,
                config.name,
                self.protocols().join(", ")
            )
        })?;
        constructor(config)
    }
}

/// Build the process-root broadcast group from configuration.
///
/// Each configured group becomes one child: a single protocol client for
/// round-robin groups, or a nested broadcast group of per-server clients
/// when the group's load-balance method is `broadcast`. The root group
/// carries the shared routing cache and a limiter keyed by child name.
pub fn build_root(
    config: &Config,
    registry: &ProtocolRegistry,
) -> anyhow::Result<Arc<broadcast::BroadcastGroup>> {
    anyhow::ensure!(!config.groups.is_empty(), "no backend groups configured");

    let mut children: Vec<Arc<dyn BackendServer>> = Vec::with_capacity(config.groups.len());
    let mut capacities = HashMap::new();

    for group in &config.groups {
        let child: Arc<dyn BackendServer> = match group.lb_method {
            LoadBalanceMethod::RoundRobin => {
                let client = registry.create(group)?;
                if group.max_batch_size > 0 {
                    // Batching lives in the group layer; leaf clients only
                    // speak the wire, so a batched round-robin group gets a
                    // single-child wrapper carrying its batch size
                    Arc::new(broadcast::BroadcastGroup::new(
                        group.name.clone(),
                        vec![client],
                        ConcurrencyLimiter::new(HashMap::from([(
                            group.name.clone(),
                            group.concurrency_limit,
                        )]))?,
                        group.timeouts(),
                        group.max_batch_size,
                    ))
                } else {
                    client
                }
            }
            LoadBalanceMethod::Broadcast => {
                // One client per server, fanned out by a nested group
                let mut leaves: Vec<Arc<dyn BackendServer>> = Vec::new();
                let mut leaf_capacities = HashMap::new();
                for server in &group.servers {
                    let mut leaf_config = group.clone();
                    leaf_config.name = format!("{}:{}", group.name, server);
                    leaf_config.servers = vec![server.clone()];
                    leaf_capacities.insert(leaf_config.name.clone(), group.concurrency_limit);
                    leaves.push(registry.create(&leaf_config)?);
                }
                Arc::new(broadcast::BroadcastGroup::new(
                    group.name.clone(),
                    leaves,
                    ConcurrencyLimiter::new(leaf_capacities)?,
                    group.timeouts(),
                    group.max_batch_size,
                ))
            }
        };
        capacities.insert(group.name.clone(), group.concurrency_limit);
        children.push(child);
    }

    let root = broadcast::BroadcastGroup::new(
        "root".to_string(),
        children,
        ConcurrencyLimiter::new(capacities)?,
        config.router.timeouts(),
        0,
    )
    .into_root(RoutingCache::new(config.router.cache_expiry));

    Ok(Arc::new(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lists_default_protocols() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(registry.protocols(), vec!["msgpack", "prometheus"]);
    }

    #[test]
    fn test_registry_rejects_unknown_protocol() {
        let registry = ProtocolRegistry::with_defaults();
        let mut config = GroupConfig::default();
        config.name = "g1".to_string();
        config.protocol = "carrier-pigeon".to_string();
        config.servers = vec!["http://localhost:8080".to_string()];

        let err = match registry.create(&config) {
            Ok(_) => panic!("expected error for unknown protocol"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("carrier-pigeon"));
        assert!(err.to_string().contains("g1"));
    }

    #[test]
    fn test_registry_custom_registration() {
        let mut registry = ProtocolRegistry::new();
        registry.register("msgpack", |cfg| {
            Ok(Arc::new(protocol::msgpack::MsgpackClient::from_config(cfg)?) as _)
        });
        assert_eq!(registry.protocols(), vec!["msgpack"]);
    }
}
