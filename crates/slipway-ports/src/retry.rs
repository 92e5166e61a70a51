//! Bounded retry with cancellation
//!
//! Replaces sleep-in-a-loop polling: at most `max_attempts` attempts,
//! `interval` apart, and a cancellation request interrupts either the
//! attempt in flight or the sleep between attempts.

use std::future::Future;
use std::time::Duration;

use slipway_core::CancelToken;

/// Attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Probes before giving up
    pub max_attempts: u32,
    /// Pause between probes
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create new policy
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Longest time the loop can spend sleeping
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// How a retry loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// An attempt produced a value
    Ready(T),
    /// Every attempt came back empty
    Exhausted { attempts: u32 },
    /// Cancelled before an attempt succeeded
    Cancelled,
}

impl<T> RetryOutcome<T> {
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Run `attempt` until it yields `Some`, the budget runs out, or `cancel` fires.
///
/// `attempt` receives the 1-based attempt number.
pub async fn retry_until<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancelToken,
    mut attempt: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for n in 1..=policy.max_attempts {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return RetryOutcome::Cancelled,
            result = attempt(n) => {
                if let Some(value) = result {
                    return RetryOutcome::Ready(value);
                }
            }
        }

        if n < policy.max_attempts {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return RetryOutcome::Cancelled,
                () = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    RetryOutcome::Exhausted {
        attempts: policy.max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(100));

        let outcome = retry_until(policy, &CancelToken::never(), |n| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                (n == 3).then_some(n)
            }
        })
        .await;

        assert_eq!(outcome, RetryOutcome::Ready(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_without_trailing_sleep() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let outcome: RetryOutcome<()> =
            retry_until(policy, &CancelToken::never(), |_| async { None }).await;

        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 3 });
        assert_eq!(start.elapsed(), policy.budget());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep() {
        let (handle, token) = CancelToken::pair();
        let policy = RetryPolicy::new(100, Duration::from_secs(10));

        let task = tokio::spawn(async move {
            retry_until::<(), _, _>(policy, &token, |_| async { None }).await
        });

        tokio::time::sleep(Duration::from_secs(15)).await;
        handle.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome, RetryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn zero_attempts_is_exhausted() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        let outcome: RetryOutcome<()> =
            retry_until(policy, &CancelToken::never(), |_| async { Some(()) }).await;
        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 0 });
    }
}
