// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic retry-with-backoff executor, used by the HTTP caller for
//! transient transport errors (spec: default 8 attempts, exponential
//! backoff capped at 60s).

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// A retry policy: number of attempts, initial delay, backoff multiplier,
/// and a ceiling on any single delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before the given (1-indexed) retry attempt, with up to 20%
    /// jitter so concurrent retries don't synchronize.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.0..0.2 * capped_ms);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Runs `op` repeatedly per `policy` until it succeeds, `should_retry`
/// returns false for the error, or the attempt budget is exhausted.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn execute<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_if(&mut op, |_| true).await
    }

    /// Like [`execute`], but `should_retry` can veto a retry for errors that
    /// are known to be non-transient (e.g. an `AbortError`).
    pub async fn execute_if<F, Fut, T, E>(
        &self,
        mut op: F,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_with_delay(&mut op, should_retry, |_| None).await
    }

    /// Like [`execute_if`], but `delay_override` lets a specific error carry
    /// its own wait time (e.g. a `Retry-After`-derived duration) instead of
    /// the policy's generic exponential backoff.
    pub async fn execute_with_delay<F, Fut, T, E>(
        &self,
        mut op: F,
        should_retry: impl Fn(&E) -> bool,
        delay_override: impl Fn(&E) -> Option<Duration>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    let delay = delay_override(&err).unwrap_or_else(|| self.policy.delay_for_attempt(attempt));
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), 1.0, Duration::from_millis(5));
        let executor = RetryExecutor::new(policy);
        let attempts = AtomicU32::new(0);

        let result: Result<u32, String> = executor
            .execute(|| async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0, Duration::from_millis(5));
        let executor = RetryExecutor::new(policy);

        let result: Result<u32, String> = executor.execute(|| async { Err("always".to_string()) }).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delay_override_replaces_generic_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(30), 2.0, Duration::from_secs(60));
        let executor = RetryExecutor::new(policy);
        let attempts = AtomicU32::new(0);

        let start = tokio::time::Instant::now();
        let result: Result<u32, String> = executor
            .execute_with_delay(
                || async {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 0 { Err("rate limited".to_string()) } else { Ok(7) }
                },
                |_| true,
                |_| Some(Duration::from_millis(1)),
            )
            .await;

        assert_eq!(result, Ok(7));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn should_retry_veto_stops_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), 1.0, Duration::from_millis(5));
        let executor = RetryExecutor::new(policy);
        let attempts = AtomicU32::new(0);

        let result: Result<u32, String> = executor
            .execute_if(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                },
                |_| false,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
