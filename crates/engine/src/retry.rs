//! Bounded retry with exponential backoff and jitter.
//!
//! Used around cleanup calls (change-set and stack deletion). The remote
//! API's own waiters are not wrapped; they carry their own polling policy.
//!
//! An operation is attempted up to `max_attempts + 1` times. Before every
//! attempt after the first, the total elapsed time is checked against
//! `total_timeout`. Delays grow as `initial_delay * backoff_multiplier^n`,
//! capped at `max_delay`, plus up to `jitter_fraction` of that value.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Retry policy for one named operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay added as uniform random jitter.
    pub jitter_fraction: f64,
    /// Budget for all attempts and sleeps together.
    pub total_timeout: Duration,
    /// Used in log lines and error messages.
    pub operation_name: String,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            total_timeout: Duration::from_secs(30),
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryOptions {
    /// The same policy under a different operation name.
    pub fn named(&self, operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..self.clone()
        }
    }

    /// Delay before retry number `attempt` (0-indexed), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry number `attempt`, including random jitter.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = base.as_secs_f64() * self.jitter_fraction.max(0.0) * rng.gen::<f64>();
        base + Duration::from_secs_f64(jitter)
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The total timeout elapsed before the next attempt could start.
    #[error("{operation_name} timed out after {attempts} attempts: {last_error}")]
    TimedOut {
        operation_name: String,
        attempts: u32,
        last_error: E,
    },

    /// Every attempt failed.
    #[error("{operation_name} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation_name: String,
        attempts: u32,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::TimedOut { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::TimedOut { last_error, .. } | RetryError::Exhausted { last_error, .. } => {
                last_error
            }
        }
    }
}

/// Run `operation` under `options`, sleeping between failed attempts.
pub async fn run<T, E, F, Fut>(options: &RetryOptions, mut operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let total_attempts = options.max_attempts.saturating_add(1);
    let mut attempts = 0;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    tracing::debug!(
                        operation = %options.operation_name,
                        attempts = attempts + 1,
                        "succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };
        attempts += 1;

        if attempts >= total_attempts {
            return Err(RetryError::Exhausted {
                operation_name: options.operation_name.clone(),
                attempts,
                last_error: error,
            });
        }

        let delay = options.delay_for_attempt(attempts - 1, &mut rand::thread_rng());
        tracing::warn!(
            operation = %options.operation_name,
            attempt = attempts,
            max_attempts = total_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;

        if started.elapsed() >= options.total_timeout {
            return Err(RetryError::TimedOut {
                operation_name: options.operation_name.clone(),
                attempts,
                last_error: error,
            });
        }
    }
}
