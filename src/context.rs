//! Request-scoped deadline and cancellation
//!
//! Every backend operation takes a [`RequestContext`] explicitly, so each
//! suspension point (limiter entry, network call, gather loop) visibly
//! depends on it. Child contexts inherit cancellation from their parent
//! and may only tighten the deadline, never extend it.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline plus cancellation signal threaded through every backend call
#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no deadline and no parent; cancelled only explicitly
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Fresh context that expires after `timeout`
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Child context: cancelled when the parent is, deadline clamped to
    /// whichever of the parent's and the new one is sooner
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Signal everyone holding this context (or a child of it) to stop
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context is already cancelled or past its deadline
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline; `None` means no deadline
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves when the context is cancelled or the deadline fires.
    /// Never resolves for an unbounded, uncancelled context.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_done() {
        let ctx = RequestContext::background();
        assert!(!ctx.is_done());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_cancel_marks_done() {
        let ctx = RequestContext::background();
        ctx.cancel();
        assert!(ctx.is_done());
        // done() resolves immediately once cancelled
        ctx.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(ctx.is_done());
        ctx.done().await;
    }

    #[tokio::test]
    async fn test_child_inherits_cancellation() {
        let parent = RequestContext::background();
        let child = parent.child_with_timeout(Duration::from_secs(60));

        parent.cancel();
        assert!(child.is_done());
        // Cancelling a child must not cancel the parent
        let parent2 = RequestContext::background();
        let child2 = parent2.child_with_timeout(Duration::from_secs(60));
        child2.cancel();
        assert!(!parent2.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_clamped_to_parent() {
        let parent = RequestContext::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(child.is_done());
    }
}
