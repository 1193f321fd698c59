//! Circuit breaker configuration with builder pattern.

use crate::circuit_breaker::CircuitBreakerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Number of consecutive successes in half-open state before closing
    pub success_threshold: u32,

    /// How long an open circuit waits before probing recovery
    pub reset_timeout: Duration,

    /// Maximum number of probe requests admitted in half-open state
    pub max_requests: u32,
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidConfig(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidConfig(
                "success_threshold must be greater than 0".to_string(),
            ));
        }

        if self.reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidConfig(
                "reset_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_requests == 0 {
            return Err(CircuitBreakerError::InvalidConfig(
                "max_requests must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            max_requests: 3,
        }
    }
}

/// Builder for CircuitBreakerConfig with fluent API
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<u32>,
    success_threshold: Option<u32>,
    reset_timeout: Option<Duration>,
    max_requests: Option<u32>,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = Some(timeout);
        self
    }

    pub fn max_requests(mut self, max: u32) -> Self {
        self.max_requests = Some(max);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        let default = CircuitBreakerConfig::default();

        let config = CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(default.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(default.success_threshold),
            reset_timeout: self.reset_timeout.unwrap_or(default.reset_timeout),
            max_requests: self.max_requests.unwrap_or(default.max_requests),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Predefined configurations for common protected operations
impl CircuitBreakerConfig {
    /// In-process plugin calls (low tolerance, quick recovery)
    pub fn for_plugin_call() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            max_requests: 3,
        }
    }

    /// Music source API calls (slow upstreams, longer cool-down)
    pub fn for_music_source() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(120),
            max_requests: 2,
        }
    }

    /// Third-party services (rate-limited, higher tolerance)
    pub fn for_third_party() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            max_requests: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(10)
            .success_threshold(3)
            .reset_timeout(Duration::from_secs(30))
            .build()
            .unwrap();

        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_with_defaults() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(7)
            .build()
            .unwrap();

        assert_eq!(config.failure_threshold, 7);
        assert_eq!(config.success_threshold, 2); // default
    }

    #[test]
    fn test_invalid_zero_failure_threshold() {
        let result = CircuitBreakerConfig::builder().failure_threshold(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_zero_success_threshold() {
        let result = CircuitBreakerConfig::builder().success_threshold(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_zero_max_requests() {
        let result = CircuitBreakerConfig::builder().max_requests(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_predefined_configs() {
        assert!(CircuitBreakerConfig::for_plugin_call().validate().is_ok());
        assert!(CircuitBreakerConfig::for_music_source().validate().is_ok());
        assert!(CircuitBreakerConfig::for_third_party().validate().is_ok());
    }

    #[test]
    fn test_music_source_config() {
        let config = CircuitBreakerConfig::for_music_source();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(120));
    }
}
