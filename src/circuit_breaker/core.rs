//! Core circuit breaker implementation with async support.

use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerResult, CircuitBreakerState,
    StateData, StateTransition,
};
use crate::errors::PluginError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A thread-safe, async circuit breaker.
///
/// State transitions are linearized by the internal lock; the lock is never
/// held across the protected operation itself.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<StateData>>,
    /// Probe requests admitted since entering half-open
    half_open_requests: Arc<RwLock<u32>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the Closed state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            name = %name,
            config = ?config,
            "Creating new circuit breaker"
        );

        Self {
            name,
            config,
            state: Arc::new(RwLock::new(StateData::new())),
            half_open_requests: Arc::new(RwLock::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> CircuitBreakerState {
        self.state.read().state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an async operation protected by the circuit breaker.
    ///
    /// When the circuit does not admit the request, the operation is never
    /// invoked and [`CircuitBreakerError::Open`] is returned.
    pub async fn execute<F, T>(&self, operation: F) -> CircuitBreakerResult<T>
    where
        F: FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<T, PluginError>> + Send>>
            + Send,
    {
        self.check_and_update_state()?;

        super::metrics::CIRCUIT_BREAKER_METRICS
            .calls_total
            .with_label_values(&[&self.name, "allowed"])
            .inc();

        let start = std::time::Instant::now();
        let result = operation().await;
        let duration = start.elapsed();

        super::metrics::CIRCUIT_BREAKER_METRICS
            .call_duration
            .with_label_values(&[&self.name])
            .observe(duration.as_secs_f64());

        match result {
            Ok(value) => {
                self.on_success();
                super::metrics::CIRCUIT_BREAKER_METRICS
                    .successful_calls
                    .with_label_values(&[&self.name])
                    .inc();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                super::metrics::CIRCUIT_BREAKER_METRICS
                    .failed_calls
                    .with_label_values(&[&self.name])
                    .inc();
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    /// Execute an operation, producing a fallback value if the circuit is open
    pub async fn execute_with_fallback<F, FB, T>(
        &self,
        operation: F,
        fallback: FB,
    ) -> CircuitBreakerResult<T>
    where
        F: FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<T, PluginError>> + Send>>
            + Send,
        FB: FnOnce() -> std::pin::Pin<Box<dyn Future<Output = T> + Send>> + Send,
    {
        match self.execute(operation).await {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open(_)) => {
                debug!(
                    name = %self.name,
                    "Circuit breaker open, using fallback"
                );
                Ok(fallback().await)
            }
            Err(err) => Err(err),
        }
    }

    /// Check admission and perform the Open -> HalfOpen transition when due
    fn check_and_update_state(&self) -> CircuitBreakerResult<()> {
        let mut state = self.state.write();

        if state.should_attempt_reset(self.config.reset_timeout) {
            let transition = state.transition_to(CircuitBreakerState::HalfOpen);
            self.log_transition(&transition);
            *self.half_open_requests.write() = 0;
        }

        match state.state {
            CircuitBreakerState::Closed => Ok(()),
            CircuitBreakerState::Open => {
                super::metrics::CIRCUIT_BREAKER_METRICS
                    .rejected_calls
                    .with_label_values(&[&self.name])
                    .inc();
                Err(CircuitBreakerError::Open(self.name.clone()))
            }
            CircuitBreakerState::HalfOpen => {
                let mut half_open_count = self.half_open_requests.write();
                if *half_open_count >= self.config.max_requests {
                    super::metrics::CIRCUIT_BREAKER_METRICS
                        .rejected_calls
                        .with_label_values(&[&self.name])
                        .inc();
                    Err(CircuitBreakerError::Open(self.name.clone()))
                } else {
                    *half_open_count += 1;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.write();
        state.record_success();

        debug!(
            name = %self.name,
            current_state = %state.state,
            consecutive_successes = state.consecutive_successes,
            "Operation succeeded"
        );

        if state.state == CircuitBreakerState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            let transition = state.transition_to(CircuitBreakerState::Closed);
            self.log_transition(&transition);
            *self.half_open_requests.write() = 0;
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.write();
        state.record_failure();

        warn!(
            name = %self.name,
            current_state = %state.state,
            consecutive_failures = state.consecutive_failures,
            "Operation failed"
        );

        if state.state == CircuitBreakerState::Closed
            && state.consecutive_failures >= self.config.failure_threshold
        {
            let transition = state.transition_to(CircuitBreakerState::Open);
            self.log_transition(&transition);
        } else if state.state == CircuitBreakerState::HalfOpen {
            // Any failure in half-open state reopens the circuit
            let transition = state.transition_to(CircuitBreakerState::Open);
            self.log_transition(&transition);
            *self.half_open_requests.write() = 0;
        }
    }

    fn log_transition(&self, transition: &StateTransition) {
        info!(
            name = %self.name,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "Circuit breaker state transition"
        );

        super::metrics::CIRCUIT_BREAKER_METRICS
            .state
            .with_label_values(&[&self.name])
            .set(transition.to.to_metric_value());

        super::metrics::CIRCUIT_BREAKER_METRICS
            .state_transitions
            .with_label_values(&[
                &self.name,
                &transition.from.to_string(),
                &transition.to.to_string(),
            ])
            .inc();
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            failure_rate: state.failure_rate(),
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            transition_count: state.transition_count,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            last_state_change: state.last_state_change,
        }
    }

    /// Recorded state transitions, oldest first
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.state.read().transitions.clone()
    }

    /// Zero all counters and force the breaker Closed
    pub fn reset(&self) {
        let mut state = self.state.write();
        if let Some(transition) = state.reset() {
            self.log_transition(&transition);
        }
        *self.half_open_requests.write() = 0;
    }

    /// Operational override: force the circuit open regardless of counters
    pub fn force_open(&self) {
        let mut state = self.state.write();
        if state.state != CircuitBreakerState::Open {
            let transition = state.transition_to(CircuitBreakerState::Open);
            self.log_transition(&transition);
        }
    }

    /// Operational override: force the circuit closed regardless of counters
    pub fn force_close(&self) {
        let mut state = self.state.write();
        if state.state != CircuitBreakerState::Closed {
            let transition = state.transition_to(CircuitBreakerState::Closed);
            self.log_transition(&transition);
            *self.half_open_requests.write() = 0;
        }
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitBreakerState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub transition_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}
