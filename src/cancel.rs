//! Cooperative cancellation token
//!
//! One process-wide token is created per run and passed explicitly to every
//! function that can suspend. There is no per-target cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared stop signal polled at every suspension point.
///
/// Cancellation is cooperative only: an in-flight click or HTTP call is
/// allowed to complete, but no new sleep or retry starts once the token
/// is signalled.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every pending `sleep`.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Clear the flag so a subsequent run can start cleanly.
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::Relaxed);
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed and the token is still
    /// clear, `false` if cancellation cut the sleep short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = self.inner.notify.notified() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn cancel_wakes_sleepers() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let completed = handle.await.unwrap();
        assert!(!completed);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn reset_clears_the_flag() {
        let token = CancelToken::new();
        token.cancel();
        assert!(!token.sleep(Duration::from_millis(1)).await);
        token.reset();
        assert!(!token.is_cancelled());
        assert!(token.sleep(Duration::from_millis(1)).await);
    }
}
