//! Retry with exponential backoff around upstream calls.
//!
//! Each call moves through [`RetryState`]s: an attempt either succeeds,
//! fails terminally (non-retriable error, or retries exhausted) or schedules
//! a retry after a backoff delay. Every attempt runs under its own timeout.

use crate::config::UpstreamConfig;
use quire_abstraction::UpstreamError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observable transitions of a retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `n` (1-based) is in flight.
    Attempting { attempt: u32 },
    /// Attempt `attempt` failed; the next starts after `delay`.
    Retrying { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

/// Why a retried call gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// The error class rules out retrying.
    #[error("non-retriable upstream error after {attempts} attempt(s): {error}")]
    NonRetriable { error: UpstreamError, attempts: u32 },

    /// Every allowed attempt failed.
    #[error("retries exhausted after {attempts} attempts: {error}")]
    Exhausted { error: UpstreamError, attempts: u32 },

    #[error("cancelled during attempt {attempts}")]
    Cancelled { attempts: u32 },
}

/// Exponential backoff with jitter and per-attempt timeouts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
    attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default())
    }
}

impl RetryPolicy {
    /// Creates a policy without jitter.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, attempt_timeout: Duration) -> Self {
        Self { max_retries, base_delay, max_delay, jitter_ratio: 0.0, attempt_timeout }
    }

    /// Adds up to `ratio` of each delay as random jitter.
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.max_retries, config.base_delay(), config.max_delay(), config.timeout())
            .with_jitter(config.jitter_ratio)
    }

    /// Attempts made before giving up, the first included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Backoff before the retry that follows failed attempt `attempt`, without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Upper bound on the wall time of one retried call.
    pub fn worst_case_duration(&self) -> Duration {
        let timeouts = self.attempt_timeout.saturating_mul(self.max_attempts());
        (1..=self.max_retries)
            .map(|attempt| self.with_max_jitter(self.backoff_delay(attempt)))
            .fold(timeouts, Duration::saturating_add)
    }

    fn with_max_jitter(&self, delay: Duration) -> Duration {
        delay.saturating_add(delay.mul_f64(self.jitter_ratio)).min(self.max_delay)
    }

    fn delay_after(&self, attempt: u32, error: &UpstreamError) -> Duration {
        let mut delay = self.backoff_delay(attempt);
        if let Some(hint) = error.retry_after() {
            delay = delay.max(hint).min(self.max_delay);
        }
        if self.jitter_ratio > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
            delay = delay.saturating_add(delay.mul_f64(jitter));
        }
        // max_delay bounds the real sleep, jitter included.
        delay.min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails terminally or `cancel` fires.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, operation: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.execute_observed(cancel, operation, |_| {}).await
    }

    /// Like [`RetryPolicy::execute`], reporting each state transition to `observe`.
    pub async fn execute_observed<T, F, Fut, O>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut observe: O,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
        O: FnMut(&RetryState),
    {
        let mut attempt = 1;
        loop {
            observe(&RetryState::Attempting { attempt });

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(attempt, "Upstream call cancelled");
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                outcome = tokio::time::timeout(self.attempt_timeout, operation(attempt)) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => {
                    debug!(attempt, "Upstream call succeeded");
                    observe(&RetryState::Succeeded { attempts: attempt });
                    return Ok(value);
                }
                Ok(Err(error)) => error,
                Err(_) => UpstreamError::Timeout(format!(
                    "attempt {attempt} exceeded {}ms",
                    self.attempt_timeout.as_millis()
                )),
            };

            if !error.is_retriable() {
                warn!(attempt, error = %error, "Upstream call failed with non-retriable error");
                observe(&RetryState::Failed { attempts: attempt });
                return Err(RetryError::NonRetriable { error, attempts: attempt });
            }

            if attempt > self.max_retries {
                info!(attempts = attempt, error = %error, "Upstream retries exhausted");
                observe(&RetryState::Failed { attempts: attempt });
                return Err(RetryError::Exhausted { error, attempts: attempt });
            }

            let delay = self.delay_after(attempt, &error);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying upstream call");
            observe(&RetryState::Retrying { attempt, delay });

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(attempt, "Upstream call cancelled during backoff");
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(100), Duration::from_secs(1), Duration::from_secs(5))
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = policy(6);
        let delays: Vec<u64> = (1..=6).map(|a| policy.backoff_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_worst_case_duration() {
        // 3 attempts x 5s + (100ms + 200ms) backoff.
        assert_eq!(policy(2).worst_case_duration(), Duration::from_millis(15_300));
        // Jitter raises each backoff by at most its ratio.
        assert_eq!(policy(2).with_jitter(0.5).worst_case_duration(), Duration::from_millis(15_450));
    }

    #[test]
    fn test_retry_after_hint_raises_delay_within_cap() {
        let policy = policy(3);
        let hinted = UpstreamError::RateLimited { retry_after: Some(Duration::from_millis(700)), message: String::new() };
        assert_eq!(policy.delay_after(1, &hinted), Duration::from_millis(700));

        let huge = UpstreamError::RateLimited { retry_after: Some(Duration::from_secs(60)), message: String::new() };
        assert_eq!(policy.delay_after(1, &huge), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = policy(3).with_jitter(0.25);
        let error = UpstreamError::Timeout(String::new());
        for _ in 0..100 {
            let delay = policy.delay_after(2, &error);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = policy(6).with_jitter(0.5);
        let error = UpstreamError::Timeout(String::new());
        for _ in 0..100 {
            assert!(policy.delay_after(4, &error) <= Duration::from_secs(1));
            assert_eq!(policy.delay_after(5, &error), Duration::from_secs(1));
        }
        // 7 attempts x 5s + 150 + 300 + 600 + 1000 + 1000 + 1000 ms.
        assert_eq!(policy.worst_case_duration(), Duration::from_millis(39_050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut states = Vec::new();

        let result = policy(3)
            .execute_observed(
                &CancellationToken::new(),
                move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err(UpstreamError::Server { status: 503, message: "busy".into() }) } else { Ok(n) } }
                },
                |state| states.push(state.clone()),
            )
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            states,
            [
                RetryState::Attempting { attempt: 1 },
                RetryState::Retrying { attempt: 1, delay: Duration::from_millis(100) },
                RetryState::Attempting { attempt: 2 },
                RetryState::Retrying { attempt: 2, delay: Duration::from_millis(200) },
                RetryState::Attempting { attempt: 3 },
                RetryState::Succeeded { attempts: 3 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(2)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Network("unreachable".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, error: UpstreamError::Network(_) })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Unauthorized("bad key".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result,
            Err(RetryError::NonRetriable { error: UpstreamError::Unauthorized("bad key".into()), attempts: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retriable() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result = policy(1)
            .execute(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        futures::future::pending::<()>().await;
                    }
                    Ok("late")
                }
            })
            .await;

        assert_eq!(result, Ok("late"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_millis(5_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result: Result<(), _> = policy(3)
            .execute(&cancel, |_| {
                trigger.cancel();
                async { Err(UpstreamError::Timeout("slow".into())) }
            })
            .await;

        assert_eq!(result, Err(RetryError::Cancelled { attempts: 1 }));
    }
}
