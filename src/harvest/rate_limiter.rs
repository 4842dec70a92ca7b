use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::harvest::retry::random_jitter;

/// Minimum gap between request completions, plus random jitter before each request
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Required time between the end of one request and the start of the next
    pub min_interval: Duration,
    /// Upper bound of the random delay added on top
    pub max_jitter: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct RateLimiterState {
    last_completion: Option<Instant>,
    total_waits: u64,
}

/// Completion-spaced rate limiter shared by everything one worker fetches
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<RateLimiterState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RateLimiterState::default())),
        }
    }

    /// Time still owed before the next request may start, without jitter
    pub fn remaining_interval(&self) -> Duration {
        let state = self.state.lock();
        match state.last_completion {
            Some(last) => self.config.min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Sleeps until the next request may start. Returns the time slept.
    pub async fn wait_turn(&self) -> Duration {
        let delay = self.remaining_interval() + random_jitter(self.config.max_jitter);

        if !delay.is_zero() {
            let waits = {
                let mut state = self.state.lock();
                state.total_waits += 1;
                state.total_waits
            };
            debug!("Rate limiter waiting for {:?} (wait {})", delay, waits);
            tokio::time::sleep(delay).await;
        }
        delay
    }

    /// Marks the end of a request, successful or not
    pub fn mark_completion(&self) {
        self.state.lock().last_completion = Some(Instant::now());
    }

    #[cfg(test)]
    pub fn total_waits(&self) -> u64 {
        self.state.lock().total_waits
    }

    /// Same settings, independent timing state
    pub fn fork(&self) -> Self {
        Self::new(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(interval_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            min_interval: Duration::from_millis(interval_ms),
            max_jitter: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_first_request_does_not_wait() {
        let limiter = limiter(300);
        assert_eq!(limiter.wait_turn().await, Duration::ZERO);
        assert_eq!(limiter.total_waits(), 0);
    }

    #[tokio::test]
    async fn test_waits_out_interval_after_completion() {
        let limiter = limiter(200);
        limiter.mark_completion();

        let start = Instant::now();
        limiter.wait_turn().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed <= Duration::from_millis(400));
        assert_eq!(limiter.total_waits(), 1);
    }

    #[tokio::test]
    async fn test_no_wait_once_interval_passed() {
        let limiter = limiter(50);
        limiter.mark_completion();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(limiter.remaining_interval(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_fork_has_independent_state() {
        let limiter = limiter(500);
        limiter.mark_completion();

        let forked = limiter.fork();
        assert_eq!(forked.remaining_interval(), Duration::ZERO);
        assert!(limiter.remaining_interval() > Duration::ZERO);
    }
}
