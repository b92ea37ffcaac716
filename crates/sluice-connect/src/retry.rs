//! Retry and backoff for flush and commit I/O
//!
//! Every sink flavor runs its external calls through the same state machine:
//!
//! ```text
//! Attempt(n) -> Success
//!            -> retryable failure, n < max  -> backoff -> Attempt(n+1)
//!            -> identity conflict           -> regenerate identity -> Attempt(n)
//!            -> non-retryable, or n == max  -> Fatal
//! ```
//!
//! Backoff waits are cancellable through a [`CancellationToken`]; a cancelled
//! wait surfaces as [`ConnectorError::Cancelled`] and is never retried.

use crate::config::RetrySettings;
use crate::error::{ConnectorError, ConnectorResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How the delay grows between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// `min(step * attempt, max)`
    Linear { step: Duration, max: Duration },
    /// `min(initial * factor^(attempt-1), max)` with optional jitter
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
    },
    /// Constant delay
    Fixed(Duration),
}

impl Backoff {
    /// Delay after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Linear { step, max } => step.saturating_mul(attempt).min(*max),
            Backoff::Fixed(d) => *d,
            Backoff::Exponential {
                initial,
                max,
                factor,
                jitter,
            } => {
                // cap exponent to keep the f64 finite
                let exp = attempt.min(30) as i32 - 1;
                let base = (initial.as_millis() as f64 * factor.powi(exp))
                    .min(max.as_millis() as f64);
                let spread = if *jitter > 0.0 {
                    let range = base * jitter;
                    rand::thread_rng().gen_range(-range..=range)
                } else {
                    0.0
                };
                Duration::from_millis((base + spread).clamp(0.0, max.as_millis() as f64) as u64)
            }
        }
    }
}

/// Retry limits for one kind of operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts; attempt `max_attempts` failing is fatal
    pub max_attempts: u32,
    /// Budget for identity conflicts, independent of `max_attempts`
    pub max_conflict_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Linear backoff `min(multiplier * attempt, max_backoff)`
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_retries.max(1),
            max_conflict_retries: settings.max_conflict_retries,
            backoff: Backoff::Linear {
                step: Duration::from_millis(settings.retry_backoff_multiplier_ms),
                max: Duration::from_millis(settings.max_retry_backoff_ms),
            },
        }
    }

    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            max_conflict_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            max_conflict_retries: RetrySettings::default().max_conflict_retries,
            backoff: Backoff::Exponential {
                initial,
                max,
                factor: 2.0,
                jitter: 0.1,
            },
        }
    }

    /// Set max attempts (builder pattern)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set conflict budget (builder pattern)
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Set backoff (builder pattern)
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start tracking one logical operation
    pub fn start(&self, operation: impl Into<String>) -> RetryState<'_> {
        RetryState {
            policy: self,
            operation: operation.into(),
            attempt: 1,
            conflicts: 0,
        }
    }
}

/// What the caller should do after a failed attempt
#[derive(Debug)]
pub enum RetryDecision {
    /// Wait, then run the next attempt
    Backoff(Duration),
    /// Replace the batch label / transaction id and retry immediately
    RegenerateIdentity,
    /// Give up; the error is final
    Fail(ConnectorError),
}

/// Attempt counter for one logical operation
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    operation: String,
    attempt: u32,
    conflicts: u32,
}

impl RetryState<'_> {
    /// Number of the attempt about to run (1-based)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn conflicts(&self) -> u32 {
        self.conflicts
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Classify the failure of the current attempt and advance.
    pub fn on_failure(&mut self, error: ConnectorError) -> RetryDecision {
        if error.is_identity_conflict() {
            if self.conflicts >= self.policy.max_conflict_retries {
                return RetryDecision::Fail(ConnectorError::RetriesExhausted {
                    operation: self.operation.clone(),
                    attempts: self.attempt,
                    source: Box::new(error),
                });
            }
            self.conflicts += 1;
            return RetryDecision::RegenerateIdentity;
        }

        if !error.is_retryable() {
            return RetryDecision::Fail(error);
        }

        if self.attempt >= self.policy.max_attempts {
            return RetryDecision::Fail(ConnectorError::RetriesExhausted {
                operation: self.operation.clone(),
                attempts: self.attempt,
                source: Box::new(error),
            });
        }

        let delay = self.policy.backoff.delay(self.attempt);
        warn!(
            operation = %self.operation,
            attempt = self.attempt,
            max_attempts = self.policy.max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        self.attempt += 1;
        RetryDecision::Backoff(delay)
    }
}

/// Sleep for `delay` unless cancelled first
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> ConnectorResult<()> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(ConnectorError::Cancelled("backoff interrupted".to_string()))
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ConnectorError::Cancelled(
            "backoff interrupted".to_string(),
        )),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `operation` under `policy`.
///
/// Identity conflicts are retried immediately within the conflict budget; the
/// closure is expected to pick a fresh identity itself on its next call.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> ConnectorResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ConnectorResult<T>>,
{
    let mut state = policy.start(operation_name);
    loop {
        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled(format!(
                "{} cancelled",
                operation_name
            )));
        }
        match operation(state.attempt()).await {
            Ok(value) => return Ok(value),
            Err(e) => match state.on_failure(e) {
                RetryDecision::Backoff(delay) => backoff(delay, cancel).await?,
                RetryDecision::RegenerateIdentity => {}
                RetryDecision::Fail(e) => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn linear(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_backoff(Backoff::Linear {
                step: Duration::from_millis(100),
                max: Duration::from_millis(250),
            })
    }

    #[test]
    fn test_linear_backoff_is_capped() {
        let b = Backoff::Linear {
            step: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(250));
        assert_eq!(b.delay(50), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff_bounded() {
        let b = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
        };
        for attempt in 1..40 {
            assert!(b.delay(attempt) <= Duration::from_secs(1));
        }
        let d3 = b.delay(3).as_millis();
        assert!((360..=440).contains(&d3), "got {}", d3);
    }

    #[test]
    fn test_from_settings() {
        let policy = RetryPolicy::from_settings(&RetrySettings {
            max_retries: 4,
            retry_backoff_multiplier_ms: 10,
            max_retry_backoff_ms: 25,
            max_conflict_retries: 1,
        });
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff.delay(2), Duration::from_millis(20));
        assert_eq!(policy.backoff.delay(3), Duration::from_millis(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry(&linear(3), "flush", &CancellationToken::new(), |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ConnectorError::transient("503"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_is_exact() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: ConnectorResult<()> =
            retry(&linear(3), "flush", &CancellationToken::new(), |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ConnectorError::connection("refused"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            ConnectorError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: ConnectorResult<()> =
            retry(&linear(5), "flush", &CancellationToken::new(), |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ConnectorError::Auth("denied".into()))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ConnectorError::Auth(_))));
    }

    #[test]
    fn test_conflicts_use_separate_budget() {
        let policy = linear(2).with_max_conflict_retries(2);
        let mut state = policy.start("load");

        assert!(matches!(
            state.on_failure(ConnectorError::conflict("l1", "exists")),
            RetryDecision::RegenerateIdentity
        ));
        assert!(matches!(
            state.on_failure(ConnectorError::conflict("l2", "exists")),
            RetryDecision::RegenerateIdentity
        ));
        // conflicts did not consume the I/O budget
        assert_eq!(state.attempt(), 1);
        assert!(matches!(
            state.on_failure(ConnectorError::transient("503")),
            RetryDecision::Backoff(_)
        ));
        assert!(matches!(
            state.on_failure(ConnectorError::conflict("l3", "exists")),
            RetryDecision::Fail(ConnectorError::RetriesExhausted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = linear(10).with_backoff(Backoff::Fixed(Duration::from_secs(60)));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: ConnectorResult<()> = retry(&policy, "flush", &cancel, |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ConnectorError::transient("503"))
            }
        })
        .await;

        assert!(matches!(result, Err(ConnectorError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
