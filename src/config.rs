//! Versioned resilience configuration document.
//!
//! One [`ResilienceConfig`] carries the manager-level settings plus named
//! sub-configurations for circuit breakers, retry policies, fallbacks,
//! auto-recovery and policies. Loading layers built-in defaults, an optional
//! file and environment variables, then validates the merged document
//! wholesale: an invalid document is rejected entirely, nothing is applied.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ResilienceError, Result};
use crate::errors::ErrorCode;
use crate::fallback::FallbackConfig;
use crate::recovery::{AutoRecoveryConfig, RecoveryManagerConfig};
use crate::retry::{BackoffType, RetryConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Only document version this build understands
pub const CONFIG_VERSION: &str = "v1";

/// Environment variable prefix, e.g. `PLUGIN_RES__MANAGER__ENABLED=false`
const ENV_PREFIX: &str = "PLUGIN_RES";

/// Descriptive document metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            version: String::new(),
            author: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags: Vec::new(),
            labels: HashMap::new(),
        }
    }
}

/// Serializable retry policy.
///
/// [`RetryConfig`] itself is not serializable because it can carry a custom
/// delay function; this mirror covers everything a document can express.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffType,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
    #[serde(default)]
    pub retryable_codes: Vec<ErrorCode>,
    #[serde(default)]
    pub non_retryable_codes: Vec<ErrorCode>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicyConfig {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            backoff: config.backoff,
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
            jitter_factor: config.jitter_factor,
            retryable_codes: config.retryable_codes.clone(),
            non_retryable_codes: config.non_retryable_codes.clone(),
        }
    }
}

impl RetryPolicyConfig {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff: self.backoff,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
            jitter_factor: self.jitter_factor,
            retryable_codes: self.retryable_codes.clone(),
            non_retryable_codes: self.non_retryable_codes.clone(),
            custom_delay: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff == BackoffType::Custom {
            return Err(ResilienceError::Validation(
                "custom backoff cannot be expressed in a config document".to_string(),
            ));
        }
        self.to_retry_config().validate()
    }
}

/// Named resilience policy binding strategies to units and error codes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
    /// Lower applies first when several policies match
    pub priority: i32,
    /// Names of sub-configurations this policy applies, in order
    pub strategies: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Units the policy applies to; empty means all
    #[serde(default)]
    pub unit_ids: Vec<String>,
    /// Error codes the policy applies to; empty means all
    #[serde(default)]
    pub error_codes: Vec<ErrorCode>,
}

/// Top-level versioned configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub version: String,
    #[serde(default)]
    pub metadata: ConfigMetadata,
    #[serde(default)]
    pub manager: RecoveryManagerConfig,
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicyConfig>,
    #[serde(default)]
    pub fallbacks: HashMap<String, FallbackConfig>,
    #[serde(default)]
    pub auto_recovery: AutoRecoveryConfig,
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            metadata: ConfigMetadata::default(),
            manager: RecoveryManagerConfig::default(),
            circuit_breakers: HashMap::from([(
                "default".to_string(),
                CircuitBreakerConfig::default(),
            )]),
            retry_policies: HashMap::from([(
                "default".to_string(),
                RetryPolicyConfig::default(),
            )]),
            fallbacks: HashMap::from([("default".to_string(), FallbackConfig::default())]),
            auto_recovery: AutoRecoveryConfig::default(),
            policies: HashMap::new(),
        }
    }
}

impl ResilienceConfig {
    /// Layer built-in defaults, an optional file and the environment, then
    /// validate the merged document.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&ResilienceConfig::default())
                .map_err(|e| ResilienceError::Configuration(e.to_string()))?,
        );

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
            info!(path = %path.display(), "Loading resilience config file");
        }

        let merged = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ResilienceError::Configuration(e.to_string()))?;

        let document: ResilienceConfig = merged
            .try_deserialize()
            .map_err(|e| ResilienceError::Configuration(e.to_string()))?;
        document.validate()?;
        Ok(document)
    }

    /// Validate the whole document; any failure rejects it wholesale
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(ResilienceError::Configuration(format!(
                "unsupported config version '{}', expected '{}'",
                self.version, CONFIG_VERSION
            )));
        }

        self.manager.validate()?;
        self.auto_recovery.validate()?;

        for (name, breaker) in &self.circuit_breakers {
            breaker.validate().map_err(|e| {
                ResilienceError::Configuration(format!("circuit breaker '{}': {}", name, e))
            })?;
        }
        for (name, retry) in &self.retry_policies {
            retry.validate().map_err(|e| {
                ResilienceError::Configuration(format!("retry policy '{}': {}", name, e))
            })?;
        }
        for (name, fallback) in &self.fallbacks {
            fallback.validate().map_err(|e| {
                ResilienceError::Configuration(format!("fallback '{}': {}", name, e))
            })?;
        }

        for (name, policy) in &self.policies {
            if policy.strategies.is_empty() {
                return Err(ResilienceError::Configuration(format!(
                    "policy '{}' names no strategies",
                    name
                )));
            }
            for strategy in &policy.strategies {
                if !self.resolves(strategy) {
                    return Err(ResilienceError::Configuration(format!(
                        "policy '{}' references unknown strategy '{}'",
                        name, strategy
                    )));
                }
            }
        }

        Ok(())
    }

    /// Whether a policy strategy name resolves against any named sub-config
    fn resolves(&self, name: &str) -> bool {
        self.circuit_breakers.contains_key(name)
            || self.retry_policies.contains_key(name)
            || self.fallbacks.contains_key(name)
    }

    /// Enabled policies ordered by ascending priority
    pub fn active_policies(&self) -> Vec<&PolicyConfig> {
        let mut active: Vec<&PolicyConfig> =
            self.policies.values().filter(|p| p.enabled).collect();
        active.sort_by_key(|p| p.priority);
        active
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let document: ResilienceConfig = serde_json::from_str(raw)?;
        document.validate()?;
        Ok(document)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ResilienceError::Configuration(e.to_string()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let document: ResilienceConfig = serde_yaml::from_str(raw)
            .map_err(|e| ResilienceError::Configuration(e.to_string()))?;
        document.validate()?;
        Ok(document)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ResilienceError::Configuration(e.to_string()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let document: ResilienceConfig =
            toml::from_str(raw).map_err(|e| ResilienceError::Configuration(e.to_string()))?;
        document.validate()?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document_is_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.version, CONFIG_VERSION);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut config = ResilienceConfig::default();
        config.version = "v2".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported config version"));
    }

    #[test]
    fn test_bad_jitter_rejected() {
        let mut config = ResilienceConfig::default();
        if let Some(retry) = config.retry_policies.get_mut("default") {
            retry.jitter_factor = 1.5;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_breaker_threshold_rejected() {
        let mut config = ResilienceConfig::default();
        if let Some(breaker) = config.circuit_breakers.get_mut("default") {
            breaker.failure_threshold = 0;
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("circuit breaker 'default'"));
    }

    #[test]
    fn test_policy_reference_must_resolve() {
        let mut config = ResilienceConfig::default();
        config.policies.insert(
            "degrade-netease".to_string(),
            PolicyConfig {
                name: "degrade-netease".to_string(),
                description: String::new(),
                enabled: true,
                priority: 1,
                strategies: vec!["missing-strategy".to_string()],
                conditions: vec![],
                unit_ids: vec!["netease".to_string()],
                error_codes: vec![ErrorCode::PluginCrashed],
            },
        );

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown strategy 'missing-strategy'"));

        // pointing at an existing sub-config fixes it
        if let Some(policy) = config.policies.get_mut("degrade-netease") {
            policy.strategies = vec!["default".to_string()];
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_policy_strategies_rejected() {
        let mut config = ResilienceConfig::default();
        config.policies.insert(
            "noop".to_string(),
            PolicyConfig {
                name: "noop".to_string(),
                description: String::new(),
                enabled: true,
                priority: 1,
                strategies: vec![],
                conditions: vec![],
                unit_ids: vec![],
                error_codes: vec![],
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_active_policies_sorted_by_priority() {
        let mut config = ResilienceConfig::default();
        for (name, priority, enabled) in
            [("late", 10, true), ("early", 1, true), ("off", 0, false)]
        {
            config.policies.insert(
                name.to_string(),
                PolicyConfig {
                    name: name.to_string(),
                    description: String::new(),
                    enabled,
                    priority,
                    strategies: vec!["default".to_string()],
                    conditions: vec![],
                    unit_ids: vec![],
                    error_codes: vec![],
                },
            );
        }

        let names: Vec<&str> = config
            .active_policies()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[test]
    fn test_json_round_trip_validates() {
        let config = ResilienceConfig::default();
        let raw = config.to_json().unwrap();
        let parsed = ResilienceConfig::from_json(&raw).unwrap();
        assert_eq!(parsed.version, CONFIG_VERSION);
        assert!(parsed.circuit_breakers.contains_key("default"));
    }

    #[test]
    fn test_custom_backoff_not_expressible() {
        let mut retry = RetryPolicyConfig::default();
        retry.backoff = BackoffType::Custom;
        assert!(retry.validate().is_err());
    }
}
