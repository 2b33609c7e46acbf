// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bounded Retries
//!
//! Broker restarts and network blips are common, so setup and the receive loop
//! run under a bounded retry budget. The delay between attempts grows linearly
//! (`attempt * base_delay`). Once the budget is spent the last failure is
//! surfaced as a `ConnectionError`.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    ///
    /// # Parameters
    /// * `max_attempts` - Total attempts, raised to at least one
    /// * `base_delay` - Backoff unit; attempt `n` is followed by `n * base_delay`
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Runs `operation` until it succeeds or the policy's attempts are exhausted.
///
/// The closure is invoked once per attempt, so every attempt gets a fresh
/// future (and, for connection setup, a fresh connection).
pub async fn run_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    match retry_loop(policy, None, operation).await? {
        Some(value) => Ok(value),
        None => Err(AmqpError::InternalError("retry loop cancelled".to_owned())),
    }
}

/// Same as [`run_with_retries`], but gives up quietly once `stop` is
/// cancelled.
///
/// The token is checked before every attempt and interrupts the backoff
/// sleep. A running attempt is never interrupted; it is expected to watch
/// the token itself. Returns `Ok(None)` when stopped.
///
/// # Parameters
/// * `policy` - attempt budget and backoff
/// * `stop` - cancels further attempts
/// * `operation` - produces one attempt per call
pub async fn run_with_retries_until<T, F, Fut>(
    policy: &RetryPolicy,
    stop: &CancellationToken,
    operation: F,
) -> Result<Option<T>, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    retry_loop(policy, Some(stop), operation).await
}

async fn retry_loop<T, F, Fut>(
    policy: &RetryPolicy,
    stop: Option<&CancellationToken>,
    mut operation: F,
) -> Result<Option<T>, AmqpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let cancelled = || stop.is_some_and(CancellationToken::is_cancelled);
    let mut attempt = 0;

    loop {
        if cancelled() {
            debug!(attempt, "retries cancelled");
            return Ok(None);
        }

        attempt += 1;
        debug!(attempt, "connecting");

        let err = match operation().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };

        if attempt >= policy.max_attempts {
            error!(
                error = err.to_string(),
                attempts = attempt,
                "retries exhausted"
            );
            return Err(AmqpError::ConnectionError(err.to_string()));
        }

        let delay = policy.delay_for(attempt);
        warn!(
            error = err.to_string(),
            attempt,
            delay_secs = delay.as_secs_f64(),
            "operation failed, retrying"
        );

        match stop {
            Some(stop) => {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ten_attempts() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), AmqpError> = run_with_retries(&RetryPolicy::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AmqpError::ConnectionError("broker down".to_owned())) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        assert!(matches!(result, Err(AmqpError::ConnectionError(msg)) if msg.contains("broker down")));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_runs_once() {
        let attempts = AtomicU32::new(0);

        let result = run_with_retries(&RetryPolicy::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, AmqpError>("success") }
        })
        .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_linearly_with_the_attempt() {
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = run_with_retries(&RetryPolicy::default(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(AmqpError::ChannelError)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        // 2s after the first failure, 4s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_interrupts_the_backoff() {
        let attempts = AtomicU32::new(0);
        let stop = CancellationToken::new();
        let token = stop.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            token.cancel();
        });

        let result: Result<Option<()>, AmqpError> =
            run_with_retries_until(&RetryPolicy::default(), &stop, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(AmqpError::ConnectionError("broker down".to_owned())) }
            })
            .await;

        // Attempts at 0s and 2s, then the 4s backoff is cut short at 3s.
        assert_eq!(result, Ok(None));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancelled_token_skips_every_attempt() {
        let attempts = AtomicU32::new(0);
        let stop = CancellationToken::new();
        stop.cancel();

        let result = run_with_retries_until(&RetryPolicy::default(), &stop, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, AmqpError>(()) }
        })
        .await;

        assert_eq!(result, Ok(None));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for(3), Duration::from_millis(30));
    }
}
