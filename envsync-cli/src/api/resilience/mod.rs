//! Resilience features for management API interactions
//!
//! Provides retry policies with exponential backoff for throttled
//! requests and a semaphore-based limiter bounding the component worker
//! pool.

pub mod concurrency;
pub mod retry;

pub use concurrency::ConcurrencyLimiter;
pub use retry::{RetryConfig, RetryPolicy};

/// Combined resilience configuration for one run
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Maximum components synced concurrently. All writes for a single
    /// configuration stay inside one worker, so this never lets two
    /// workers write the same configuration.
    pub max_concurrent_components: usize,
    /// Whether the pool bound is enforced
    pub enabled: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_components: 8,
            enabled: true,
        }
    }
}
