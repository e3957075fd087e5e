//! Shared machinery for concrete protocol adapters
//!
//! Each adapter translates the uniform request shapes into its wire format
//! and performs one logical request per attempt against a server chosen by
//! round-robin, retrying against the next server on transport failure up
//! to the group's `max_tries`.

pub mod msgpack;
pub mod prometheus;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::context::RequestContext;
use crate::errors::RouterError;
use crate::stats::Stats;
use crate::types::Timeouts;

/// Lock-free round-robin rotation over a group's server addresses
#[derive(Debug)]
pub struct ServerRotation {
    servers: Vec<String>,
    current: AtomicUsize,
}

impl ServerRotation {
    pub fn new(servers: Vec<String>) -> anyhow::Result<Self> {
        anyhow::ensure!(!servers.is_empty(), "server rotation needs at least one address");
        Ok(Self {
            servers,
            current: AtomicUsize::new(0),
        })
    }

    /// Next server in rotation
    #[must_use]
    pub fn next(&self) -> &str {
        let index = self.current.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        &self.servers[index]
    }

    /// All addresses, in configured order
    #[must_use]
    pub fn all(&self) -> &[String] {
        &self.servers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// HTTP client honoring the group's connect budget
pub fn http_client(timeouts: &Timeouts) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeouts.connect)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build http client: {e}"))
}

/// Run one attempt per server until one succeeds or `max_tries` attempts
/// were spent. Retryable failures increment the retry counter and move to
/// the next server; anything else is reported immediately.
pub async fn with_retries<T, F, Fut>(
    backend: &str,
    rotation: &ServerRotation,
    max_tries: usize,
    stats: &mut Stats,
    attempt: F,
) -> Result<T, RouterError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, RouterError>>,
{
    let mut last_error = RouterError::MaxTriesExceeded {
        backend: backend.to_string(),
        tries: max_tries,
    };

    for try_number in 0..max_tries {
        let server = rotation.next().to_string();
        match attempt(server.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                stats.retries += 1;
                debug!(
                    backend,
                    server,
                    try_number,
                    %err,
                    "attempt failed, rotating to next server"
                );
                last_error = err;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error)
}

/// Race one wire call against the request context
pub async fn bounded<T, Fut>(ctx: &RequestContext, backend: &str, call: Fut) -> Result<T, RouterError>
where
    Fut: Future<Output = Result<T, RouterError>>,
{
    tokio::select! {
        result = call => result,
        () = ctx.done() => Err(RouterError::TimeoutExceeded {
            backend: backend.to_string(),
        }),
    }
}

/// Map a reqwest failure into the shared taxonomy
pub fn transport_error(backend: &str, err: &reqwest::Error) -> RouterError {
    if err.is_timeout() {
        RouterError::TimeoutExceeded {
            backend: backend.to_string(),
        }
    } else {
        RouterError::BackendFailed {
            backend: backend.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Map an HTTP status into the shared taxonomy; `None` means usable
pub fn status_error(backend: &str, status: reqwest::StatusCode) -> Option<RouterError> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        400 => RouterError::BadRequest {
            reason: format!("backend '{backend}' rejected the request"),
        },
        403 => RouterError::Forbidden {
            reason: format!("backend '{backend}' refused the request"),
        },
        404 => RouterError::NotFound {
            query: backend.to_string(),
        },
        _ => RouterError::BackendFailed {
            backend: backend.to_string(),
            reason: format!("http status {status}"),
        },
    })
}
