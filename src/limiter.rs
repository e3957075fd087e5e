//! Per-backend admission control
//!
//! One counting semaphore per backend name bounds how many requests may be
//! in flight against that backend at once. Entry blocks until a slot frees
//! up or the request context is done; the returned permit releases its slot
//! on drop, so a worker that loses a deadline race can never leak a slot.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::context::RequestContext;
use crate::errors::RouterError;

/// Named set of counting semaphores, one per backend identity
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyLimiter {
    limits: HashMap<String, Arc<Semaphore>>,
}

/// Held slot for one in-flight backend call; the slot frees on drop
#[derive(Debug)]
pub struct LimiterPermit {
    // None when the backend has no configured limit
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConcurrencyLimiter {
    /// Build the limiter from per-backend capacities.
    ///
    /// A capacity of zero would deadlock every caller, so it is rejected
    /// here at startup rather than discovered at runtime.
    pub fn new(capacities: HashMap<String, usize>) -> anyhow::Result<Self> {
        let mut limits = HashMap::with_capacity(capacities.len());
        for (name, capacity) in capacities {
            anyhow::ensure!(
                capacity > 0,
                "concurrency limit for backend '{name}' must be non-zero"
            );
            limits.insert(name, Arc::new(Semaphore::new(capacity)));
        }
        Ok(Self { limits })
    }

    /// Acquire a slot for `name`, waiting until one frees up.
    ///
    /// Returns a timeout error without consuming a slot if the context is
    /// cancelled or its deadline fires first. Backends with no configured
    /// limit are admitted immediately.
    pub async fn enter(
        &self,
        name: &str,
        ctx: &RequestContext,
    ) -> Result<LimiterPermit, RouterError> {
        let Some(semaphore) = self.limits.get(name) else {
            return Ok(LimiterPermit { _permit: None });
        };

        if ctx.is_done() {
            return Err(RouterError::TimeoutExceeded {
                backend: name.to_string(),
            });
        }

        tokio::select! {
            permit = Arc::clone(semaphore).acquire_owned() => {
                // acquire_owned only errors if the semaphore is closed,
                // which this limiter never does
                match permit {
                    Ok(permit) => Ok(LimiterPermit { _permit: Some(permit) }),
                    Err(_) => Err(RouterError::BackendFailed {
                        backend: name.to_string(),
                        reason: "limiter closed".to_string(),
                    }),
                }
            }
            () = ctx.done() => {
                debug!(backend = name, "gave up waiting for a limiter slot");
                Err(RouterError::TimeoutExceeded { backend: name.to_string() })
            }
        }
    }

    /// Free slots currently available for `name`; `None` if unlimited
    #[must_use]
    pub fn available(&self, name: &str) -> Option<usize> {
        self.limits.get(name).map(|s| s.available_permits())
    }
}
