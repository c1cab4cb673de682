//! Bounded exponential backoff around any fallible async operation.
//!
//! The controller knows nothing about what it retries. Classification comes
//! from [`Retryable`], progress is reported through an `on_backoff` callback,
//! and every suspension (the call itself and the wait between attempts) races
//! a [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::gateway::ProviderError;

/// Whether a failure is transient (worth another attempt) or fatal.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        ProviderError::is_retryable(self)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    30.0
}

fn default_multiplier() -> f64 {
    2.0
}

/// Retry configuration. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid retry policy: {0}")]
pub struct InvalidPolicy(pub String);

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: f64, max_delay: f64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidPolicy> {
        if self.max_attempts == 0 {
            return Err(InvalidPolicy("max_attempts must be at least 1".into()));
        }
        if !self.initial_delay.is_finite() || self.initial_delay < 0.0 {
            return Err(InvalidPolicy(
                "initial_delay must be finite and non-negative".into(),
            ));
        }
        if !self.max_delay.is_finite() || self.max_delay < 0.0 {
            return Err(InvalidPolicy(
                "max_delay must be finite and non-negative".into(),
            ));
        }
        if self.initial_delay >= max_delay_secs() || self.max_delay >= max_delay_secs() {
            return Err(InvalidPolicy(format!(
                "delays must be below {} seconds",
                max_delay_secs()
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(InvalidPolicy("multiplier must be finite and >= 1".into()));
        }
        Ok(())
    }

    /// Backoff in seconds after the failed attempt with 0-based index `attempt_index`:
    /// `min(initial_delay * multiplier^attempt_index, max_delay)`.
    pub fn delay_secs(&self, attempt_index: u32) -> f64 {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let raw = self.initial_delay * self.multiplier.powi(exponent);
        if raw.is_finite() {
            raw.min(self.max_delay).max(0.0)
        } else {
            self.max_delay.max(0.0)
        }
    }

    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let secs = self.delay_secs(attempt_index);
        if secs.is_finite() {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

/// Largest delay a `Duration` can hold, in seconds.
fn max_delay_secs() -> f64 {
    Duration::MAX.as_secs_f64()
}

/// A failed attempt about to be followed by a backoff wait.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a E,
}

/// Terminal outcome of [`with_retry`] when no attempt succeeded.
///
/// The operation's own error is carried unchanged.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("attempt {attempt} failed permanently: {error}")]
    Fatal { attempt: u32, error: E },
    #[error("cancelled during attempt {attempt}")]
    Cancelled { attempt: u32 },
}

impl<E> RetryError<E> {
    /// The last error the operation returned, if it returned one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// Number of attempts that ran (or was running when cancelled).
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } | RetryError::Cancelled { attempt } => *attempt,
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, runs out of attempts, or
/// `cancel` fires.
///
/// `operation` receives the 1-based attempt number. `on_backoff` is called
/// once per retryable failure that will be followed by another attempt, before
/// the wait starts.
pub async fn with_retry<T, E, F, Fut, B>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_backoff: B,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: FnMut(&RetryAttempt<'_, E>),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempt });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempt }),
            result = operation(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(RetryError::Fatal { attempt, error });
        }
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for(attempt - 1);
        on_backoff(&RetryAttempt {
            attempt,
            max_attempts,
            delay,
            error: &error,
        });
        tracing::debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying after transient failure"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempt }),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky(u32),
        Broken,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky(_))
        }
    }

    #[test]
    fn delay_follows_capped_exponential() {
        let policy = RetryPolicy::new(10, 1.0, 30.0, 2.0);
        assert_eq!(policy.delay_secs(0), 1.0);
        assert_eq!(policy.delay_secs(1), 2.0);
        assert_eq!(policy.delay_secs(4), 16.0);
        assert_eq!(policy.delay_secs(5), 30.0);
        assert_eq!(policy.delay_secs(u32::MAX), 30.0);
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(0, 1.0, 30.0, 2.0).validate().is_err());
        assert!(RetryPolicy::new(3, -1.0, 30.0, 2.0).validate().is_err());
        assert!(RetryPolicy::new(3, 1.0, f64::NAN, 2.0).validate().is_err());
        assert!(RetryPolicy::new(3, 1.0, 30.0, 0.5).validate().is_err());
    }

    #[test]
    fn delays_beyond_duration_range_are_rejected_and_never_panic() {
        assert!(RetryPolicy::new(3, 1e20, 1e20, 2.0).validate().is_err());
        assert!(RetryPolicy::new(3, 1.0, 1e20, 2.0).validate().is_err());

        let unchecked = RetryPolicy::new(3, 1e20, 1e20, 2.0);
        assert_eq!(unchecked.delay_for(0), Duration::MAX);
        assert_eq!(unchecked.delay_for(7), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut delays = Vec::new();
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let result = with_retry(
            &policy,
            &cancel,
            |a: &RetryAttempt<'_, TestError>| delays.push((a.attempt, a.delay)),
            |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(TestError::Flaky(attempt))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            delays,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_returns_last_error_unchanged() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let err = with_retry(
            &policy,
            &cancel,
            |_: &RetryAttempt<'_, TestError>| {},
            |attempt| async move { Err::<(), _>(TestError::Flaky(attempt)) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 3);
        assert_eq!(err.into_inner(), Some(TestError::Flaky(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let err = with_retry(
            &policy,
            &cancel,
            |_: &RetryAttempt<'_, TestError>| panic!("no backoff expected"),
            |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Broken)
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Fatal { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 30.0, 30.0, 2.0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let err = with_retry(
            &policy,
            &cancel,
            move |_: &RetryAttempt<'_, TestError>| trigger.cancel(),
            |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Flaky(attempt))
                }
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
