//! Shared retry policy
//!
//! Page provisioning and result upload both retry a bounded number of times
//! with a fixed backoff; this is the single abstraction both call sites use.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::cancel::CancelToken;

/// Fixed backoff between provisioning and upload attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Bounded retry with a fixed inter-attempt backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first (always >= 1).
    pub attempts: u32,
    /// Sleep between attempts.
    pub backoff: Duration,
}

/// Why a retried operation did not produce a value.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// All attempts ran and failed; carries the last error.
    Exhausted(E),
    /// The cancel token fired before an attempt could succeed.
    Cancelled,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Policy for page provisioning: `max_attempts` total attempts.
    pub fn for_provisioning(max_attempts: u32) -> Self {
        Self::new(max_attempts, RETRY_BACKOFF)
    }

    /// Policy for result upload: `retry_count` retries after the first attempt.
    pub fn for_upload(retry_count: u32) -> Self {
        Self::new(retry_count + 1, RETRY_BACKOFF)
    }

    /// Run `op` until it succeeds, attempts are exhausted, or the token fires.
    ///
    /// The closure receives the 1-based attempt number. The backoff sleep is
    /// skipped after the final attempt and aborted by cancellation.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancelToken,
        op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_inner(cancel, true, op).await
    }

    /// Like [`RetryPolicy::run`], but the first attempt executes even when
    /// the token is already signalled; cancellation only suppresses retries.
    ///
    /// A stopped run must still report its aggregate, so the upload path uses
    /// this variant. Immediate abort on cancellation belongs to provisioning.
    pub async fn run_at_least_once<T, E, F, Fut>(
        &self,
        cancel: &CancelToken,
        op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_inner(cancel, false, op).await
    }

    async fn run_inner<T, E, F, Fut>(
        &self,
        cancel: &CancelToken,
        abort_before_first: bool,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() && (abort_before_first || attempt > 1) {
                return Err(RetryFailure::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < self.attempts && !cancel.sleep(self.backoff).await {
                return Err(RetryFailure::Cancelled);
            }
        }

        match last_error {
            Some(e) => Err(RetryFailure::Exhausted(e)),
            None => Err(RetryFailure::Cancelled),
        }
    }
}
