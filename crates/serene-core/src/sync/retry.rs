//! Retry with exponential backoff
//!
//! Transient remote errors are retried with delay `base * 2^(attempt - 1)`
//! before attempt `attempt` (so 2s then 4s with a one second base). Delays
//! are non-blocking and abandoned as soon as the cancellation token fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::engine::SyncError;
use crate::remote::RemoteError;

/// Retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    /// Delay before the given 1-based attempt (zero for the first)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Delay before `attempt`, stretched to honor a backend hint
    pub fn delay_after_error(&self, attempt: u32, error: &RemoteError) -> Duration {
        let backoff = self.delay_before(attempt);
        match error.retry_after() {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or attempts run out
///
/// `on_retry` is called with (next attempt, delay, error) before each wait.
/// Returns [`SyncError::Cancelled`] if the token fires before an attempt
/// or during a wait.
pub async fn with_backoff<T, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
    mut on_retry: R,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
    R: FnMut(u32, Duration, &RemoteError),
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                warn!("{} failed with terminal error: {}", label, e);
                return Err(SyncError::Remote(e));
            }
            Err(e) if attempt >= max_attempts => {
                warn!("{} failed after {} attempt(s): {}", label, attempt, e);
                return Err(SyncError::Remote(e));
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay_after_error(attempt, &e);
                warn!(
                    "{} failed ({}), retrying in {:?} (attempt {}/{})",
                    label, e, delay, attempt, max_attempts
                );
                on_retry(attempt, delay, &e);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before(4), Duration::from_secs(8));
    }

    #[test]
    fn test_rate_limit_hint_stretches_delay() {
        let policy = RetryPolicy::default();
        let hinted = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(policy.delay_after_error(2, &hinted), Duration::from_secs(30));

        let short = RemoteError::RateLimited {
            retry_after: Some(Duration::from_millis(10)),
        };
        assert_eq!(policy.delay_after_error(2, &short), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let mut delays = Vec::new();
        let start = Instant::now();

        let result = with_backoff(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            "test",
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::no_internet())
                } else {
                    Ok(7)
                }
            },
            |_, delay, _| delays.push(delay),
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert!(start.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            "test",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::ZoneNotFound)
            },
            |_, _, _| {},
        )
        .await;

        assert!(matches!(
            result,
            Err(SyncError::Remote(RemoteError::ZoneNotFound))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            "test",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::rate_limited())
            },
            |_, _, _| {},
        )
        .await;

        assert!(matches!(
            result,
            Err(SyncError::Remote(RemoteError::RateLimited { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_exits_early() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = with_backoff(
            &RetryPolicy::default(),
            &cancel,
            "test",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::no_internet())
            },
            |_, _, _| {},
        )
        .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = with_backoff(
            &RetryPolicy::default(),
            &cancel,
            "test",
            || async { Ok(()) },
            |_, _, _| {},
        )
        .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
