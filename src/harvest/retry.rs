//! Retry policy values and the async combinator that consumes them.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

/// Delay between attempts. `attempt` is 1 for the delay after the first failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `min(base * 2^(attempt-1), max)` plus up to `jitter`
    Exponential {
        base: Duration,
        max: Duration,
        jitter: Duration,
    },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max, jitter } => {
                let exponent = attempt.saturating_sub(1).min(20);
                let delay = base.saturating_mul(1u32 << exponent).min(max);
                delay + random_jitter(jitter)
            }
        }
    }
}

/// Uniform random duration in `[0, max]`
pub fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Max attempts, delay schedule and which errors are worth another try
pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> RetryPolicy<E> {
    pub fn new(max_attempts: u32, backoff: Backoff, retryable: fn(&E) -> bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable,
        }
    }
}

/// Why [retry] gave up
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The error was not retryable
    Permanent(E),
    /// Every attempt failed with retryable errors
    Exhausted { attempts: u32, last: E },
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy<E>, mut op: F) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !(policy.retryable)(&error) {
                    return Err(RetryFailure::Permanent(error));
                }
                if attempt >= policy.max_attempts {
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }

                let delay = policy.backoff.delay(attempt);
                debug!("Attempt {} failed, retrying in {:?}", attempt, delay);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
