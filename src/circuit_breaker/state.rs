//! Circuit breaker state machine.
//!
//! This module handles state transitions and request accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The current state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Circuit is closed, requests are allowed through, failures are counted
    Closed,
    /// Circuit is open, all requests are rejected, waiting for the reset timeout
    Open,
    /// Circuit is half-open, testing recovery with limited probe requests
    HalfOpen,
}

impl CircuitBreakerState {
    /// Numeric value for Prometheus gauges
    pub fn to_metric_value(&self) -> f64 {
        match self {
            CircuitBreakerState::Closed => 0.0,
            CircuitBreakerState::Open => 1.0,
            CircuitBreakerState::HalfOpen => 2.0,
        }
    }

    /// Whether requests may be admitted in this state
    pub fn allows_requests(&self) -> bool {
        matches!(
            self,
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen
        )
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CircuitBreakerState,
    pub to: CircuitBreakerState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

impl StateTransition {
    pub fn new(from: CircuitBreakerState, to: CircuitBreakerState, reason: String) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            reason,
        }
    }
}

/// Transitions retained per breaker
const MAX_RECORDED_TRANSITIONS: usize = 100;

/// Internal mutable state of a circuit breaker
#[derive(Debug, Clone)]
pub struct StateData {
    pub state: CircuitBreakerState,
    /// Failures since the last success, drives Closed -> Open
    pub consecutive_failures: u32,
    /// Successes since the last failure, drives HalfOpen -> Closed
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    /// When the circuit was opened (if in Open state)
    pub opened_at: Option<DateTime<Utc>>,
    pub transition_count: u64,
    pub transitions: Vec<StateTransition>,
}

impl StateData {
    pub fn new() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_failure_at: None,
            last_success_at: None,
            last_state_change: Utc::now(),
            opened_at: None,
            transition_count: 0,
            transitions: Vec::new(),
        }
    }

    /// Record a successful request
    pub fn record_success(&mut self) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.last_success_at = Some(Utc::now());
    }

    /// Record a failed request
    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Utc::now());
    }

    /// Fraction of requests that failed
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }

    /// Transition to a new state, recording the event
    pub fn transition_to(&mut self, new_state: CircuitBreakerState) -> StateTransition {
        let transition =
            StateTransition::new(self.state, new_state, self.transition_reason(new_state));

        self.state = new_state;
        self.last_state_change = Utc::now();
        self.transition_count += 1;

        // Streak counters are per-state; each transition starts a fresh streak
        // so half-open probes are never credited with successes from before
        // the circuit opened.
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;

        if new_state == CircuitBreakerState::Open {
            self.opened_at = Some(Utc::now());
        } else if new_state == CircuitBreakerState::Closed {
            self.opened_at = None;
        }

        if self.transitions.len() >= MAX_RECORDED_TRANSITIONS {
            self.transitions.remove(0);
        }
        self.transitions.push(transition.clone());

        transition
    }

    /// Reset everything back to a pristine closed breaker
    pub fn reset(&mut self) -> Option<StateTransition> {
        let transition = if self.state != CircuitBreakerState::Closed {
            Some(self.transition_to(CircuitBreakerState::Closed))
        } else {
            None
        };
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.total_requests = 0;
        self.successful_requests = 0;
        self.failed_requests = 0;
        self.last_failure_at = None;
        self.last_success_at = None;
        transition
    }

    fn transition_reason(&self, new_state: CircuitBreakerState) -> String {
        match (self.state, new_state) {
            (CircuitBreakerState::Closed, CircuitBreakerState::Open) => format!(
                "Failure threshold exceeded ({} consecutive failures)",
                self.consecutive_failures
            ),
            (CircuitBreakerState::Open, CircuitBreakerState::HalfOpen) => {
                "Reset timeout elapsed, testing recovery".to_string()
            }
            (CircuitBreakerState::HalfOpen, CircuitBreakerState::Closed) => format!(
                "Recovery successful ({} consecutive successes)",
                self.consecutive_successes
            ),
            (CircuitBreakerState::HalfOpen, CircuitBreakerState::Open) => {
                "Recovery probe failed".to_string()
            }
            _ => format!("Transitioned from {} to {}", self.state, new_state),
        }
    }

    /// Whether enough time has passed to transition from Open to HalfOpen
    pub fn should_attempt_reset(&self, reset_timeout: std::time::Duration) -> bool {
        if self.state != CircuitBreakerState::Open {
            return false;
        }

        if let Some(opened_at) = self.opened_at {
            let elapsed = Utc::now().signed_duration_since(opened_at);
            elapsed.num_milliseconds().max(0) as u128 >= reset_timeout.as_millis()
        } else {
            false
        }
    }
}

impl Default for StateData {
    fn default() -> Self {
        Self::new()
    }
}
