//! Retry policy with exponential backoff
//!
//! Applied to every management API request. Rate-limited and transient
//! transport failures are retried; auth, not-found and conflict responses
//! are returned immediately.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::api::error::ApiError;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomize delays by up to 25% to avoid thundering herds
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (attempt 1 = first retry)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_millis() as f64 * exp;
        let capped = raw.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            let factor: f64 = rand::rng().random_range(0.75..=1.25);
            capped * factor
        } else {
            capped
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// Executes API calls under a retry budget
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, retrying retryable failures with backoff.
    /// `what` names the request for log lines.
    pub async fn execute<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        what, e, delay, attempt, self.config.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!("{} failed without retry: {}", what, e);
                    return Err(e);
                }
            }
        }
    }
}
