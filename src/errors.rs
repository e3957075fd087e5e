//! Error taxonomy and aggregation for scatter-gather results
//!
//! Leaf adapters translate wire-level failures into [`RouterError`];
//! broadcast groups only accumulate them into [`Errors`]; the query router
//! derives one externally-visible status code at the boundary.
//!
//! A result carrying non-fatal errors still carries usable data. The fatal
//! flag means no usable data exists anywhere behind this result.

use thiserror::Error;

/// One failure somewhere in the scatter-gather tree
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RouterError {
    /// The query matched nothing anywhere
    #[error("no metrics found for '{query}'")]
    NotFound { query: String },

    /// A deadline fired before the backend answered
    #[error("timeout exceeded while waiting on '{backend}'")]
    TimeoutExceeded { backend: String },

    /// Transport-level failure (connection refused, malformed response)
    #[error("backend '{backend}' failed: {reason}")]
    BackendFailed { backend: String, reason: String },

    /// Every server in a group was tried and none answered
    #[error("max tries exceeded for '{backend}' after {tries} attempts")]
    MaxTriesExceeded { backend: String, tries: usize },

    /// The caller's request was malformed
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// The backend refused the request outright
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// The protocol spoken by this backend lacks the capability
    #[error("operation not supported by backend '{backend}'")]
    NotSupportedByBackend { backend: String },

    /// The capability exists in the protocol but not in this adapter yet
    #[error("operation not implemented yet")]
    NotImplementedYet,

    /// Two responses for the same metric disagree on the request window
    #[error("start time mismatch for '{metric}': {ours} vs {theirs}")]
    StartTimeMismatch {
        metric: String,
        ours: i64,
        theirs: i64,
    },
}

impl RouterError {
    /// Whether this failure is worth retrying against another server
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TimeoutExceeded { .. } | Self::BackendFailed { .. }
        )
    }

    /// Log level appropriate for reporting this failure
    #[must_use]
    pub const fn log_level(&self) -> tracing::Level {
        match self {
            // Misses are routine
            Self::NotFound { .. } | Self::NotSupportedByBackend { .. } => tracing::Level::DEBUG,
            Self::BadRequest { .. } | Self::Forbidden { .. } => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        }
    }
}

/// Externally-visible outcome of a merged set of failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    NotFound,
    ServiceUnavailable,
    Forbidden,
    BadRequest,
}

impl ApiStatus {
    /// HTTP status code the handler layer should answer with
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::ServiceUnavailable => 503,
            Self::Forbidden => 403,
            Self::BadRequest => 400,
        }
    }

    /// Precedence rank; higher wins when merging. "Not found" is the
    /// weakest outcome, a client-input error beats everything.
    const fn rank(self) -> u8 {
        match self {
            Self::NotFound => 0,
            Self::ServiceUnavailable => 1,
            Self::Forbidden => 2,
            Self::BadRequest => 3,
        }
    }

    /// Combine two statuses deterministically, independent of order
    #[must_use]
    pub const fn escalate(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl From<&RouterError> for ApiStatus {
    fn from(err: &RouterError) -> Self {
        match err {
            RouterError::BadRequest { .. } | RouterError::StartTimeMismatch { .. } => {
                Self::BadRequest
            }
            RouterError::Forbidden { .. } => Self::Forbidden,
            RouterError::TimeoutExceeded { .. }
            | RouterError::BackendFailed { .. }
            | RouterError::MaxTriesExceeded { .. } => Self::ServiceUnavailable,
            RouterError::NotFound { .. }
            | RouterError::NotSupportedByBackend { .. }
            | RouterError::NotImplementedYet => Self::NotFound,
        }
    }
}

/// Ordered accumulation of failures from one scatter-gather operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Errors {
    /// Individual failures in arrival order
    pub errors: Vec<RouterError>,
    /// True iff no usable data exists behind this result
    pub have_fatal_errors: bool,
}

impl Errors {
    /// A single fatal failure
    #[must_use]
    pub fn fatal(err: RouterError) -> Self {
        Self {
            errors: vec![err],
            have_fatal_errors: true,
        }
    }

    /// A single non-fatal failure alongside otherwise-valid data
    #[must_use]
    pub fn non_fatal(err: RouterError) -> Self {
        Self {
            errors: vec![err],
            have_fatal_errors: false,
        }
    }

    /// Append one non-fatal failure
    pub fn add(&mut self, err: RouterError) {
        self.errors.push(err);
    }

    /// Append failures from a child result, OR-ing the fatal flags
    pub fn absorb(&mut self, other: Errors) {
        self.errors.extend(other.errors);
        self.have_fatal_errors |= other.have_fatal_errors;
    }

    /// Whether anything at all failed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Derive the single externally-visible status.
    ///
    /// Deterministic under reordering: the same set of failures always
    /// produces the same code.
    #[must_use]
    pub fn status(&self) -> ApiStatus {
        self.errors
            .iter()
            .fold(ApiStatus::NotFound, |status, err| {
                status.escalate(ApiStatus::from(err))
            })
    }

    /// The most specific message available: the first error whose status
    /// equals the derived one
    #[must_use]
    pub fn summary(&self) -> Option<String> {
        let status = self.status();
        self.errors
            .iter()
            .find(|e| ApiStatus::from(*e) == status)
            .map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> RouterError {
        RouterError::TimeoutExceeded {
            backend: "b1".to_string(),
        }
    }

    fn not_found() -> RouterError {
        RouterError::NotFound {
            query: "a.b.*".to_string(),
        }
    }

    #[test]
    fn test_not_found_is_default_status() {
        let errors = Errors::fatal(not_found());
        assert_eq!(errors.status(), ApiStatus::NotFound);
        assert_eq!(errors.status().as_u16(), 404);
    }

    #[test]
    fn test_timeout_escalates_to_unavailable() {
        let mut errors = Errors::fatal(not_found());
        errors.add(timeout());
        assert_eq!(errors.status(), ApiStatus::ServiceUnavailable);
    }

    #[test]
    fn test_bad_request_wins_over_timeout() {
        let mut errors = Errors::fatal(timeout());
        errors.add(RouterError::BadRequest {
            reason: "negative time range".to_string(),
        });
        assert_eq!(errors.status(), ApiStatus::BadRequest);

        // Same set, reversed arrival order
        let mut reversed = Errors::fatal(RouterError::BadRequest {
            reason: "negative time range".to_string(),
        });
        reversed.add(timeout());
        assert_eq!(reversed.status(), ApiStatus::BadRequest);
    }

    #[test]
    fn test_forbidden_wins_over_timeout_but_not_bad_request() {
        let mut errors = Errors::fatal(timeout());
        errors.add(RouterError::Forbidden {
            reason: "acl".to_string(),
        });
        assert_eq!(errors.status(), ApiStatus::Forbidden);

        errors.add(RouterError::BadRequest {
            reason: "bad glob".to_string(),
        });
        assert_eq!(errors.status(), ApiStatus::BadRequest);
    }

    #[test]
    fn test_absorb_ors_fatal_flag() {
        let mut errors = Errors::non_fatal(timeout());
        assert!(!errors.have_fatal_errors);

        errors.absorb(Errors::fatal(not_found()));
        assert!(errors.have_fatal_errors);
        assert_eq!(errors.errors.len(), 2);
    }

    #[test]
    fn test_absorb_non_fatal_keeps_flag() {
        let mut errors = Errors::fatal(not_found());
        errors.absorb(Errors::non_fatal(timeout()));
        assert!(errors.have_fatal_errors);
    }

    #[test]
    fn test_summary_matches_derived_status() {
        let mut errors = Errors::fatal(not_found());
        errors.add(timeout());

        let summary = errors.summary().unwrap();
        assert!(summary.contains("b1"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(timeout().is_retryable());
        assert!(
            RouterError::BackendFailed {
                backend: "b".to_string(),
                reason: "connection refused".to_string(),
            }
            .is_retryable()
        );
        assert!(!not_found().is_retryable());
        assert!(
            !RouterError::BadRequest {
                reason: "x".to_string()
            }
            .is_retryable()
        );
    }
}
