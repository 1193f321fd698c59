//! Bounded retry execution with backoff and jitter.
//!
//! A [`RetryExecutor`] re-runs a failing async operation according to a
//! [`RetryConfig`]. Retryability is decided with a fixed precedence: the
//! non-retryable code list wins over the retryable list, which wins over the
//! error's own retryable flag; errors from outside the taxonomy fall back to
//! a transient-looking heuristic. Attempt state is created fresh per call and
//! never shared across concurrent executions.

use crate::error::ResilienceError;
use crate::errors::{is_temporary, ErrorCode, PluginError};
use crate::metrics::SharedMetrics;
use crate::scope::Scope;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, error, warn};

/// Backoff schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Linear,
    #[default]
    Exponential,
    Custom,
}

/// Immutable retry policy
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffType,
    pub backoff_factor: f64,
    pub jitter: bool,
    /// Fraction of the delay used as the jitter range, in [0, 1]
    pub jitter_factor: f64,
    /// Codes retried regardless of the error's own flag
    pub retryable_codes: Vec<ErrorCode>,
    /// Codes never retried; wins over everything else
    pub non_retryable_codes: Vec<ErrorCode>,
    /// Delay function used when backoff is [`BackoffType::Custom`]
    pub custom_delay: Option<Arc<dyn Fn(u32) -> Duration + Send + Sync>>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("jitter_factor", &self.jitter_factor)
            .field("custom_delay", &self.custom_delay.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff: BackoffType::Exponential,
            backoff_factor: 2.0,
            jitter: true,
            jitter_factor: 0.1,
            retryable_codes: vec![
                ErrorCode::Unavailable,
                ErrorCode::ResourceExhausted,
                ErrorCode::PluginTimeout,
                ErrorCode::PluginNetworkError,
                ErrorCode::MusicSourceRateLimit,
                ErrorCode::ThirdPartyServiceDown,
                ErrorCode::ThirdPartyRateLimit,
            ],
            non_retryable_codes: vec![
                ErrorCode::InvalidArgument,
                ErrorCode::PermissionDenied,
                ErrorCode::Unauthenticated,
                ErrorCode::NotFound,
                ErrorCode::PluginConfigInvalid,
            ],
            custom_delay: None,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::Validation(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.base_delay.is_zero() {
            return Err(ResilienceError::Validation(
                "base_delay must be greater than 0".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::Validation(
                "max_delay must not be smaller than base_delay".to_string(),
            ));
        }
        if self.backoff_factor <= 0.0 {
            return Err(ResilienceError::Validation(
                "backoff_factor must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ResilienceError::Validation(
                "jitter_factor must be between 0 and 1".to_string(),
            ));
        }
        if self.backoff == BackoffType::Custom && self.custom_delay.is_none() {
            return Err(ResilienceError::Validation(
                "custom backoff requires a custom_delay function".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a failed attempt should be retried
    pub fn should_retry(&self, attempt: u32, err: &PluginError) -> bool {
        if attempt + 1 >= self.max_attempts {
            return false;
        }

        let code = err.code();
        if self.non_retryable_codes.contains(&code) {
            return false;
        }
        if self.retryable_codes.contains(&code) {
            return true;
        }

        // Foreign errors carry no real code; judge them by how they look
        if code == ErrorCode::Unknown {
            return is_temporary(err);
        }

        err.retryable()
    }

    /// Delay before the attempt following `attempt` (0-based), capped and
    /// jittered
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = match self.backoff {
            BackoffType::Fixed => self.base_delay,
            BackoffType::Linear => self.base_delay.saturating_mul(attempt + 1),
            BackoffType::Exponential => Duration::from_secs_f64(
                self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32),
            ),
            BackoffType::Custom => match &self.custom_delay {
                Some(f) => f(attempt),
                None => self.base_delay,
            },
        };

        let capped = raw.min(self.max_delay);

        if !self.jitter || self.jitter_factor == 0.0 {
            return capped;
        }

        let range = capped.as_secs_f64() * self.jitter_factor;
        let offset = (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * range;
        let jittered = capped.as_secs_f64() + offset;
        if jittered < 0.0 {
            self.base_delay
        } else {
            Duration::from_secs_f64(jittered)
        }
    }
}

/// Builder for [`RetryConfig`]
#[derive(Default)]
pub struct RetryConfigBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    backoff: Option<BackoffType>,
    backoff_factor: Option<f64>,
    jitter: Option<bool>,
    jitter_factor: Option<f64>,
    retryable_codes: Option<Vec<ErrorCode>>,
    non_retryable_codes: Option<Vec<ErrorCode>>,
    custom_delay: Option<Arc<dyn Fn(u32) -> Duration + Send + Sync>>,
}

impl RetryConfigBuilder {
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn backoff(mut self, backoff: BackoffType) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = Some(factor);
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = Some(enabled);
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = Some(factor);
        self
    }

    pub fn retryable_codes(mut self, codes: Vec<ErrorCode>) -> Self {
        self.retryable_codes = Some(codes);
        self
    }

    pub fn non_retryable_codes(mut self, codes: Vec<ErrorCode>) -> Self {
        self.non_retryable_codes = Some(codes);
        self
    }

    pub fn custom_delay<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.custom_delay = Some(Arc::new(f));
        self.backoff = Some(BackoffType::Custom);
        self
    }

    pub fn build(self) -> Result<RetryConfig, ResilienceError> {
        let default = RetryConfig::default();

        let config = RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(default.max_attempts),
            base_delay: self.base_delay.unwrap_or(default.base_delay),
            max_delay: self.max_delay.unwrap_or(default.max_delay),
            backoff: self.backoff.unwrap_or(default.backoff),
            backoff_factor: self.backoff_factor.unwrap_or(default.backoff_factor),
            jitter: self.jitter.unwrap_or(default.jitter),
            jitter_factor: self.jitter_factor.unwrap_or(default.jitter_factor),
            retryable_codes: self.retryable_codes.unwrap_or(default.retryable_codes),
            non_retryable_codes: self
                .non_retryable_codes
                .unwrap_or(default.non_retryable_codes),
            custom_delay: self.custom_delay,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Executes operations under a retry policy
pub struct RetryExecutor {
    config: RetryConfig,
    metrics: Option<SharedMetrics>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, the policy gives up, or the scope
    /// is cancelled.
    ///
    /// On exhaustion the last error is returned wrapped with the attempt
    /// count; a non-retryable error is returned as-is after one attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &Scope,
        mut operation: F,
    ) -> Result<T, PluginError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PluginError>>,
    {
        let mut last_error: Option<PluginError> = None;

        for attempt in 0..self.config.max_attempts {
            if let Err(scope_err) = scope.check() {
                return Err(scope_error_to_plugin(scope_err));
            }

            match operation().await {
                Ok(value) => {
                    if let Some(metrics) = &self.metrics {
                        let attempts = (attempt + 1).to_string();
                        metrics
                            .increment_counter("retry_success_total", &[("attempts", &attempts)]);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(metrics) = &self.metrics {
                        let attempt_label = (attempt + 1).to_string();
                        let error_type = err.error_type().to_string();
                        metrics.increment_counter(
                            "retry_attempt_total",
                            &[("attempt", &attempt_label), ("error_type", &error_type)],
                        );
                    }

                    if !self.config.should_retry(attempt, &err) {
                        if attempt + 1 < self.config.max_attempts {
                            error!(
                                error = %err,
                                attempt = attempt + 1,
                                "Operation failed, not retrying"
                            );
                            return Err(err);
                        }
                        last_error = Some(err);
                        break;
                    }

                    let delay = self.config.delay_for(attempt);
                    warn!(
                        error = %err,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    last_error = Some(err);

                    if let Err(scope_err) = scope.sleep(delay).await {
                        return Err(scope_error_to_plugin(scope_err));
                    }
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| PluginError::new(ErrorCode::Unknown, "retry loop produced no error"));

        error!(
            error = %last,
            attempts = self.config.max_attempts,
            "Operation failed after all retries"
        );
        if let Some(metrics) = &self.metrics {
            let error_type = last.error_type().to_string();
            metrics.increment_counter("retry_exhausted_total", &[("error_type", &error_type)]);
        }

        let wrapped = PluginError::new(
            last.code(),
            format!(
                "operation failed after {} attempts: {}",
                self.config.max_attempts,
                last.message()
            ),
        )
        .with_severity(last.severity())
        .with_retryable(last.retryable())
        .with_cause(last);
        debug!(error = %wrapped, "Returning exhausted retry error");
        Err(wrapped)
    }
}

fn scope_error_to_plugin(err: ResilienceError) -> PluginError {
    match err {
        ResilienceError::Timeout(msg) => PluginError::new(ErrorCode::DeadlineExceeded, msg),
        ResilienceError::Cancelled(msg) => PluginError::new(ErrorCode::Cancelled, msg),
        other => PluginError::new(ErrorCode::Internal, other.to_string()),
    }
}
