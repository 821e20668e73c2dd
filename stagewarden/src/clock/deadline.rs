//! Absolute deadlines with parent/child budgeting and cancellation.

use crate::cancellation::CancellationToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound used when a budget would overflow the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// An absolute point in time past which work must stop.
///
/// A deadline carries the cancellation token of the run it belongs to.
/// Cancelling the token makes the deadline, and every child derived from it,
/// report itself as expired immediately.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    token: Arc<CancellationToken>,
}

impl Deadline {
    /// Creates a root deadline `budget` from now with a fresh token.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self::with_token(budget, Arc::new(CancellationToken::new()))
    }

    /// Creates a root deadline `budget` from now bound to `token`.
    #[must_use]
    pub fn with_token(budget: Duration, token: Arc<CancellationToken>) -> Self {
        Self {
            at: offset(super::now(), budget),
            token,
        }
    }

    /// Derives a child deadline.
    ///
    /// The child expires after `max` or when the parent expires, whichever is
    /// sooner. It shares the parent's cancellation token.
    #[must_use]
    pub fn with_child(&self, max: Duration) -> Self {
        let own = offset(super::now(), max);
        Self {
            at: own.min(self.at),
            token: Arc::clone(&self.token),
        }
    }

    /// Time left before expiry; zero once expired or cancelled.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        if self.is_cancelled() {
            return Duration::ZERO;
        }
        self.at.saturating_duration_since(super::now())
    }

    /// Returns true once the deadline passed or the run was cancelled.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.is_cancelled() || super::now() >= self.at
    }

    /// Returns true if expiry was forced by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.token.reason()
    }

    /// The monotonic instant at which this deadline expires.
    #[must_use]
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// The cancellation token shared by this deadline family.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Resolves when the deadline expires or the run is cancelled.
    pub async fn wait(&self) {
        tokio::select! {
            () = tokio::time::sleep_until(self.at) => {}
            () = self.token.cancelled() => {}
        }
    }
}

fn offset(from: Instant, budget: Duration) -> Instant {
    from.checked_add(budget)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_deadline_not_expired() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(!deadline.expired());
        assert!(!deadline.is_cancelled());
        assert!(deadline.remaining() > Duration::from_secs(4));
    }

    #[test]
    fn test_zero_budget_is_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_child_never_outlives_parent() {
        let parent = Deadline::after(Duration::from_millis(100));
        let child = parent.with_child(Duration::from_secs(10));
        assert!(child.instant() <= parent.instant());
        assert!(child.remaining() <= Duration::from_millis(100));

        let short = parent.with_child(Duration::from_millis(10));
        assert!(short.instant() < parent.instant());
    }

    #[tokio::test]
    async fn test_child_capped_by_remaining_parent_budget() {
        let root = Deadline::after(Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let child = root.with_child(Duration::from_millis(150));
        assert!(child.remaining() <= Duration::from_millis(50));
        assert_eq!(child.instant(), root.instant());
    }

    #[test]
    fn test_cancel_expires_whole_family() {
        let root = Deadline::after(Duration::from_secs(60));
        let child = root.with_child(Duration::from_secs(30));
        let grandchild = child.with_child(Duration::from_secs(10));

        root.token().cancel("user interrupt");

        for deadline in [&root, &child, &grandchild] {
            assert!(deadline.expired());
            assert!(deadline.is_cancelled());
            assert_eq!(deadline.remaining(), Duration::ZERO);
        }
        assert_eq!(grandchild.cancel_reason(), Some("user interrupt".to_string()));
    }

    #[test]
    fn test_huge_budget_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.expired());
        let child = deadline.with_child(Duration::MAX);
        assert!(!child.expired());
    }

    #[tokio::test]
    async fn test_wait_resolves_at_expiry() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let start = std::time::Instant::now();
        deadline.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(deadline.expired());
    }

    #[tokio::test]
    async fn test_wait_resolves_on_cancel() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let token = Arc::clone(deadline.token());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel("stop");
        });

        tokio::time::timeout(Duration::from_secs(2), deadline.wait())
            .await
            .expect("wait should resolve on cancellation");
        assert!(deadline.is_cancelled());
    }
}
