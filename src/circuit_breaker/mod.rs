//! Circuit breaker protecting callers from failing plugin operations.
//!
//! Per-operation state machine with three states:
//!
//! - **Closed**: requests pass through, consecutive failures are counted
//! - **Open**: fast-fail mode, requests are rejected until the reset timeout
//! - **Half-Open**: limited probe requests test whether the operation recovered
//!
//! # Example
//!
//! ```no_run
//! use plugin_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use plugin_resilience::errors::{ErrorCode, PluginError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CircuitBreakerConfig::builder()
//!         .failure_threshold(5)
//!         .reset_timeout(std::time::Duration::from_secs(60))
//!         .build()?;
//!
//!     let breaker = CircuitBreaker::new("netease:search", config);
//!
//!     let result = breaker
//!         .execute(|| Box::pin(async { Ok::<_, PluginError>(42) }))
//!         .await;
//!
//!     Ok(())
//! }
//! ```

mod config;
mod core;
mod metrics;
mod registry;
mod state;

pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder};
pub use core::{CircuitBreaker, CircuitBreakerStats};
pub use metrics::{init_circuit_breaker_metrics, CIRCUIT_BREAKER_METRICS};
pub use registry::{CircuitBreakerRegistry, RegistryHealth, StateCount};
pub use state::{CircuitBreakerState, StateData, StateTransition};

use crate::error::ResilienceError;
use crate::errors::PluginError;

/// Result type for circuit breaker operations
pub type CircuitBreakerResult<T> = std::result::Result<T, CircuitBreakerError>;

/// Errors that can occur in circuit breaker operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open and rejecting requests
    #[error("Circuit breaker is open for '{0}'")]
    Open(String),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The protected operation failed
    #[error("Operation failed: {0}")]
    OperationFailed(PluginError),

    /// Circuit breaker not found in registry
    #[error("Circuit breaker '{0}' not found")]
    NotFound(String),
}

impl CircuitBreakerError {
    /// The underlying plugin error, when the operation itself failed
    pub fn into_plugin_error(self) -> Option<PluginError> {
        match self {
            CircuitBreakerError::OperationFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CircuitBreakerError> for ResilienceError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open(name) => {
                ResilienceError::Internal(format!("Circuit breaker open: {}", name))
            }
            CircuitBreakerError::InvalidConfig(msg) => ResilienceError::Configuration(msg),
            CircuitBreakerError::OperationFailed(e) => ResilienceError::Internal(e.to_string()),
            CircuitBreakerError::NotFound(name) => {
                ResilienceError::NotFound(format!("Circuit breaker: {}", name))
            }
        }
    }
}
