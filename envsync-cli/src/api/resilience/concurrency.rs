//! Semaphore-based bound for the component worker pool
//!
//! The orchestrator acquires one permit per component before issuing any
//! request for it, which gives the run backpressure instead of unbounded
//! fan-out against the management API.

use std::sync::Arc;

use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::ConcurrencyConfig;

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    config: ConcurrencyConfig,
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let permits = if config.enabled {
            config.max_concurrent_components
        } else {
            // Large but valid pool when disabled (Tokio Semaphore max is 2^61-1)
            1_000_000
        };

        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    /// Acquire a worker slot. Waits if the pool is at capacity. The permit
    /// releases automatically when dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        if self.config.enabled && self.semaphore.available_permits() == 0 {
            debug!(
                "worker pool at capacity ({}), waiting for a slot",
                self.config.max_concurrent_components
            );
        }
        // The semaphore is never closed, so acquire cannot fail
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed")
    }

    /// Try to acquire a slot without waiting
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available_permits(&self) -> usize {
        if !self.config.enabled {
            return usize::MAX;
        }
        self.semaphore.available_permits()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
