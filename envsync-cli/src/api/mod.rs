//! Management API layer
//!
//! Typed models for the configuration inventory, the `EnvironmentClient`
//! contract with its HTTP implementation, the error taxonomy, token
//! provisioning and resilience (retry + worker pool bound).

pub mod client;
pub mod error;
pub mod models;
pub mod resilience;
pub mod tokens;

pub use client::{EnvironmentClient, StorageApiClient};
pub use error::{ApiError, RunError};
pub use models::{
    BranchRef, Component, ComponentConfig, ConfigRow, ConfigUrl, ProjectRef, Region,
};
pub use resilience::{ConcurrencyLimiter, ResilienceConfig, RetryConfig, RetryPolicy};
pub use tokens::{StorageToken, TokenCache};
