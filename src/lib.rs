//! Federating query router for heterogeneous time-series storage clusters
//!
//! One logical query fans out to every configured backend group, partial
//! answers are merged, and the caller gets a single response plus a single
//! status even when some groups fail or time out.
//!
//! The building blocks:
//!
//! - [`backend::BackendServer`]: the uniform contract satisfied by both
//!   concrete protocol clients and composite groups
//! - [`backend::broadcast::BroadcastGroup`]: concurrent scatter-gather
//!   over children with deadline-bounded merging
//! - [`limiter::ConcurrencyLimiter`]: named in-flight caps protecting
//!   each backend group
//! - [`routing::RoutingCache`]: top-level-domain hints narrowing the
//!   fan-out, refreshed by a background probe
//! - [`router::QueryRouter`]: the outer surface deriving one status from
//!   the accumulated failures and publishing merged counters

pub mod backend;
pub mod config;
pub mod context;
pub mod errors;
pub mod limiter;
pub mod logging;
pub mod merge;
pub mod router;
pub mod routing;
pub mod stats;
pub mod types;

pub use backend::{build_root, BackendServer, ProtocolRegistry, Reply};
pub use config::Config;
pub use context::RequestContext;
pub use errors::{ApiStatus, Errors, RouterError};
pub use limiter::ConcurrencyLimiter;
pub use router::{QueryError, QueryOutcome, QueryRouter};
pub use routing::RoutingCache;
pub use stats::{LogSink, Stats, StatsSink};
