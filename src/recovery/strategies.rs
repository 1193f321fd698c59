//! Recovery strategies and the unit controller seam.
//!
//! A strategy decides whether it applies to a given error (`can_recover`) and
//! performs the actual recovery through the [`UnitController`] contract the
//! embedding application implements. Strategies are consulted in ascending
//! priority order.

use crate::errors::{ErrorCode, PluginError};
use crate::scope::Scope;
use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

/// Kind of recovery a strategy performs
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecoveryType {
    Restart,
    Reload,
    Fallback,
    Degrade,
    Custom,
}

/// Operations the host application exposes for acting on a unit
#[async_trait]
pub trait UnitController: Send + Sync {
    async fn restart(&self, unit_id: &str) -> Result<(), PluginError>;
    async fn reload(&self, unit_id: &str) -> Result<(), PluginError>;
    async fn reset(&self, unit_id: &str) -> Result<(), PluginError>;
    async fn failover(&self, unit_id: &str, target: &str) -> Result<(), PluginError>;
}

/// A single recovery approach for failed units
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn recovery_type(&self) -> RecoveryType;
    /// Lower priority runs first
    fn priority(&self) -> i32;
    fn timeout(&self) -> Duration;
    fn can_recover(&self, error: &PluginError) -> bool;
    async fn execute(&self, scope: &Scope, unit_id: &str) -> Result<(), PluginError>;
    fn reset(&self);
    fn is_healthy(&self) -> bool;
}

const STRATEGY_UNHEALTHY_AFTER: u32 = 3;

/// Consecutive-failure based health shared by the built-in strategies
#[derive(Default)]
struct StrategyHealth {
    consecutive_failures: AtomicU32,
}

impl StrategyHealth {
    fn record(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < STRATEGY_UNHEALTHY_AFTER
    }
}

/// Restarts a unit after crash-like failures
pub struct RestartStrategy {
    name: String,
    controller: Arc<dyn UnitController>,
    max_attempts: u32,
    attempt_delay: Duration,
    health: StrategyHealth,
}

impl RestartStrategy {
    pub fn new(controller: Arc<dyn UnitController>) -> Self {
        Self {
            name: "restart".to_string(),
            controller,
            max_attempts: 3,
            attempt_delay: Duration::from_secs(1),
            health: StrategyHealth::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }
}

#[async_trait]
impl RecoveryStrategy for RestartStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn recovery_type(&self) -> RecoveryType {
        RecoveryType::Restart
    }

    fn priority(&self) -> i32 {
        1
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn can_recover(&self, error: &PluginError) -> bool {
        matches!(
            error.code(),
            ErrorCode::PluginCrashed | ErrorCode::PluginTimeout | ErrorCode::PluginMemoryLimit
        )
    }

    async fn execute(&self, scope: &Scope, unit_id: &str) -> Result<(), PluginError> {
        info!(unit_id = %unit_id, "Attempting to restart unit");

        for attempt in 1..=self.max_attempts {
            scope
                .check()
                .map_err(|e| PluginError::new(ErrorCode::Cancelled, e.to_string()))?;

            if attempt > 1 {
                scope
                    .sleep(self.attempt_delay)
                    .await
                    .map_err(|e| PluginError::new(ErrorCode::Cancelled, e.to_string()))?;
            }

            match self.controller.restart(unit_id).await {
                Ok(()) => {
                    info!(unit_id = %unit_id, attempt, "Unit restart successful");
                    self.health.record(true);
                    return Ok(());
                }
                Err(e) => {
                    warn!(unit_id = %unit_id, attempt, error = %e, "Unit restart failed");
                }
            }
        }

        self.health.record(false);
        Err(PluginError::new(
            ErrorCode::Internal,
            format!(
                "failed to restart unit {} after {} attempts",
                unit_id, self.max_attempts
            ),
        ))
    }

    fn reset(&self) {
        self.health.reset();
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

/// Reloads a unit's code and configuration after init/config failures
pub struct ReloadStrategy {
    name: String,
    controller: Arc<dyn UnitController>,
    max_attempts: u32,
    attempt_delay: Duration,
    health: StrategyHealth,
}

impl ReloadStrategy {
    pub fn new(controller: Arc<dyn UnitController>) -> Self {
        Self {
            name: "reload".to_string(),
            controller,
            max_attempts: 3,
            attempt_delay: Duration::from_secs(1),
            health: StrategyHealth::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[async_trait]
impl RecoveryStrategy for ReloadStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn recovery_type(&self) -> RecoveryType {
        RecoveryType::Reload
    }

    fn priority(&self) -> i32 {
        2
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(20)
    }

    fn can_recover(&self, error: &PluginError) -> bool {
        matches!(
            error.code(),
            ErrorCode::PluginInitFailed
                | ErrorCode::PluginConfigInvalid
                | ErrorCode::PluginDependencyMissing
        )
    }

    async fn execute(&self, scope: &Scope, unit_id: &str) -> Result<(), PluginError> {
        info!(unit_id = %unit_id, "Attempting to reload unit");

        for attempt in 1..=self.max_attempts {
            scope
                .check()
                .map_err(|e| PluginError::new(ErrorCode::Cancelled, e.to_string()))?;

            if attempt > 1 {
                scope
                    .sleep(self.attempt_delay)
                    .await
                    .map_err(|e| PluginError::new(ErrorCode::Cancelled, e.to_string()))?;
            }

            match self.controller.reload(unit_id).await {
                Ok(()) => {
                    info!(unit_id = %unit_id, attempt, "Unit reload successful");
                    self.health.record(true);
                    return Ok(());
                }
                Err(e) => {
                    warn!(unit_id = %unit_id, attempt, error = %e, "Unit reload failed");
                }
            }
        }

        self.health.record(false);
        Err(PluginError::new(
            ErrorCode::Internal,
            format!(
                "failed to reload unit {} after {} attempts",
                unit_id, self.max_attempts
            ),
        ))
    }

    fn reset(&self) {
        self.health.reset();
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

/// Switches traffic to a configured fallback unit, or degrades when there is
/// none
pub struct FallbackStrategy {
    name: String,
    fallback_units: HashMap<String, String>,
    degraded: Arc<DashSet<String>>,
    allow_degradation: bool,
    health: StrategyHealth,
}

impl FallbackStrategy {
    pub fn new(fallback_units: HashMap<String, String>) -> Self {
        Self {
            name: "fallback".to_string(),
            fallback_units,
            degraded: Arc::new(DashSet::new()),
            allow_degradation: true,
            health: StrategyHealth::default(),
        }
    }

    pub fn without_degradation(mut self) -> Self {
        self.allow_degradation = false;
        self
    }

    pub fn fallback_for(&self, unit_id: &str) -> Option<&str> {
        self.fallback_units.get(unit_id).map(String::as_str)
    }

    pub fn is_degraded(&self, unit_id: &str) -> bool {
        self.degraded.contains(unit_id)
    }
}

#[async_trait]
impl RecoveryStrategy for FallbackStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn recovery_type(&self) -> RecoveryType {
        RecoveryType::Fallback
    }

    fn priority(&self) -> i32 {
        3
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn can_recover(&self, _error: &PluginError) -> bool {
        true
    }

    async fn execute(&self, scope: &Scope, unit_id: &str) -> Result<(), PluginError> {
        scope
            .check()
            .map_err(|e| PluginError::new(ErrorCode::Cancelled, e.to_string()))?;

        if let Some(fallback_id) = self.fallback_units.get(unit_id) {
            info!(
                unit_id = %unit_id,
                fallback_unit = %fallback_id,
                "Switching to fallback unit"
            );
            self.health.record(true);
            return Ok(());
        }

        if self.allow_degradation {
            info!(unit_id = %unit_id, "Enabling degradation mode");
            self.degraded.insert(unit_id.to_string());
            self.health.record(true);
            return Ok(());
        }

        self.health.record(false);
        Err(PluginError::new(
            ErrorCode::NotFound,
            format!("no fallback available for unit {}", unit_id),
        ))
    }

    fn reset(&self) {
        self.degraded.clear();
        self.health.reset();
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

/// Marks a unit as running in degraded mode without touching it
pub struct GracefulDegradeStrategy {
    name: String,
    degraded: Arc<DashSet<String>>,
    health: StrategyHealth,
}

impl GracefulDegradeStrategy {
    pub fn new() -> Self {
        Self {
            name: "graceful_degrade".to_string(),
            degraded: Arc::new(DashSet::new()),
            health: StrategyHealth::default(),
        }
    }

    pub fn is_degraded(&self, unit_id: &str) -> bool {
        self.degraded.contains(unit_id)
    }

    pub fn degraded_units(&self) -> Vec<String> {
        self.degraded.iter().map(|entry| entry.clone()).collect()
    }

    pub fn restore(&self, unit_id: &str) -> bool {
        self.degraded.remove(unit_id).is_some()
    }
}

impl Default for GracefulDegradeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecoveryStrategy for GracefulDegradeStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn recovery_type(&self) -> RecoveryType {
        RecoveryType::Degrade
    }

    fn priority(&self) -> i32 {
        4
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn can_recover(&self, _error: &PluginError) -> bool {
        true
    }

    async fn execute(&self, scope: &Scope, unit_id: &str) -> Result<(), PluginError> {
        scope
            .check()
            .map_err(|e| PluginError::new(ErrorCode::Cancelled, e.to_string()))?;

        info!(unit_id = %unit_id, "Unit entering degraded mode");
        self.degraded.insert(unit_id.to_string());
        self.health.record(true);
        Ok(())
    }

    fn reset(&self) {
        self.degraded.clear();
        self.health.reset();
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}
