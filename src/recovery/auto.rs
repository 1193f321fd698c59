//! Automatic health-check driven recovery.
//!
//! Registered units are health-checked on an interval. A unit failing the
//! check `failure_threshold` times in a row is recovered asynchronously by
//! trying the configured actions in order (Reset, Restart, Reload, Failover,
//! Custom by default), stopping at the first success.

use super::strategies::UnitController;
use crate::errors::PluginError;
use crate::scope::{CancellationToken, Scope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ordered actions tried when recovering a unit
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Reset,
    Restart,
    Reload,
    Failover,
    Custom,
}

/// Outcome of one health check
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
    #[default]
    Unknown,
}

/// Configuration for the auto-recovery loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRecoveryConfig {
    pub enabled: bool,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub max_recovery_attempts: u32,
    pub recovery_delay: Duration,
    pub failure_threshold: u32,
    pub actions: Vec<RecoveryAction>,
    #[serde(default)]
    pub failover_targets: Vec<String>,
}

impl Default for AutoRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(10),
            max_recovery_attempts: 3,
            recovery_delay: Duration::from_secs(5),
            failure_threshold: 3,
            actions: vec![
                RecoveryAction::Reset,
                RecoveryAction::Restart,
                RecoveryAction::Reload,
                RecoveryAction::Failover,
            ],
            failover_targets: vec![],
        }
    }
}

impl AutoRecoveryConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.health_check_interval.is_zero() {
            return Err(crate::error::ResilienceError::Validation(
                "health_check_interval must be greater than 0".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(crate::error::ResilienceError::Validation(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.max_recovery_attempts == 0 {
            return Err(crate::error::ResilienceError::Validation(
                "max_recovery_attempts must be greater than 0".to_string(),
            ));
        }
        if self.actions.is_empty() {
            return Err(crate::error::ResilienceError::Validation(
                "at least one recovery action is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a single health check
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub unit_id: String,
    pub status: HealthStatus,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub latency: Duration,
}

/// One recovery attempt made by the loop
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub unit_id: String,
    pub action: RecoveryAction,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Tracked health state of one registered unit
#[derive(Debug, Clone, Serialize)]
pub struct PluginHealthState {
    pub unit_id: String,
    pub status: HealthStatus,
    pub last_check: Option<HealthCheckResult>,
    pub failure_count: u32,
    pub recovery_attempts: u32,
    pub last_recovery: Option<RecoveryAttempt>,
    pub is_recovering: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginHealthState {
    fn new(unit_id: &str) -> Self {
        let now = Utc::now();
        Self {
            unit_id: unit_id.to_string(),
            status: HealthStatus::Unknown,
            last_check: None,
            failure_count: 0,
            recovery_attempts: 0,
            last_recovery: None,
            is_recovering: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Aggregate counters for the auto-recovery loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoRecoveryStats {
    pub total_health_checks: u64,
    pub failed_health_checks: u64,
    pub total_recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub average_recovery_time: Duration,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_recovery_at: Option<DateTime<Utc>>,
}

/// Health probe implemented by the host application
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, scope: &Scope, unit_id: &str) -> Result<HealthCheckResult, PluginError>;
}

type CustomRecoveryFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send>> + Send + Sync,
>;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Interval-driven health checking and recovery for registered units
pub struct AutoRecoveryManager {
    config: AutoRecoveryConfig,
    states: DashMap<String, PluginHealthState>,
    stats: RwLock<AutoRecoveryStats>,
    checker: Arc<dyn HealthChecker>,
    controller: Arc<dyn UnitController>,
    custom_recovery: Option<CustomRecoveryFn>,
    lifecycle: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    /// In-flight recovery tasks, joined by `stop`
    recovery_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AutoRecoveryManager {
    pub fn new(
        config: AutoRecoveryConfig,
        checker: Arc<dyn HealthChecker>,
        controller: Arc<dyn UnitController>,
    ) -> crate::error::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            states: DashMap::new(),
            stats: RwLock::new(AutoRecoveryStats::default()),
            checker,
            controller,
            custom_recovery: None,
            lifecycle: parking_lot::Mutex::new(None),
            recovery_tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn with_custom_recovery<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        self.custom_recovery = Some(Arc::new(move |unit_id| Box::pin(f(unit_id))));
        self
    }

    pub fn config(&self) -> &AutoRecoveryConfig {
        &self.config
    }

    /// Register a unit for health monitoring
    pub fn register_unit(&self, unit_id: &str) {
        let inserted = !self.states.contains_key(unit_id);
        self.states
            .entry(unit_id.to_string())
            .or_insert_with(|| PluginHealthState::new(unit_id));
        if inserted {
            info!(unit_id = %unit_id, "Unit registered for auto recovery");
        }
    }

    pub fn unregister_unit(&self, unit_id: &str) {
        if self.states.remove(unit_id).is_some() {
            info!(unit_id = %unit_id, "Unit unregistered from auto recovery");
        }
    }

    pub fn unit_state(&self, unit_id: &str) -> Option<PluginHealthState> {
        self.states.get(unit_id).map(|entry| entry.value().clone())
    }

    pub fn all_unit_states(&self) -> Vec<PluginHealthState> {
        self.states
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn stats(&self) -> AutoRecoveryStats {
        self.stats.read().clone()
    }

    /// Start the health-check loop
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Auto recovery is disabled");
            return;
        }

        let mut guard = self.lifecycle.lock();
        if guard.is_some() {
            warn!("Auto recovery manager is already started");
            return;
        }

        info!(
            health_check_interval_secs = self.config.health_check_interval.as_secs(),
            max_recovery_attempts = self.config.max_recovery_attempts,
            "Starting auto recovery manager"
        );

        let token = CancellationToken::new();
        let manager = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.run_health_checks(&loop_token).await,
                    _ = loop_token.cancelled() => break,
                }
            }
        });

        *guard = Some((token, handle));
    }

    /// Stop the loop, cancel in-flight recovery and join both the loop and
    /// any spawned recovery tasks, waiting up to a bounded grace period
    pub async fn stop(&self) {
        let stopped = {
            let mut guard = self.lifecycle.lock();
            guard.take()
        };
        let tasks: Vec<JoinHandle<()>> = self.recovery_tasks.lock().drain(..).collect();
        if stopped.is_none() && tasks.is_empty() {
            return;
        }

        let loop_handle = stopped.map(|(token, handle)| {
            token.cancel();
            handle
        });
        let drain = async move {
            if let Some(handle) = loop_handle {
                let _ = handle.await;
            }
            for task in tasks {
                let _ = task.await;
            }
        };

        if tokio::time::timeout(STOP_GRACE, drain).await.is_err() {
            warn!("Auto recovery manager stop timeout");
        } else {
            info!("Auto recovery manager stopped");
        }
    }

    async fn run_health_checks(self: &Arc<Self>, token: &CancellationToken) {
        let unit_ids: Vec<String> = self
            .states
            .iter()
            .filter(|entry| !entry.value().is_recovering)
            .map(|entry| entry.key().clone())
            .collect();

        for unit_id in unit_ids {
            if token.is_cancelled() {
                return;
            }
            self.check_unit(&unit_id, token).await;
        }
    }

    async fn check_unit(self: &Arc<Self>, unit_id: &str, token: &CancellationToken) {
        let scope =
            Scope::with_token(token.clone()).child_with_timeout(self.config.health_check_timeout);
        let started = tokio::time::Instant::now();

        let result = match self.checker.check(&scope, unit_id).await {
            Ok(result) => result,
            Err(e) => HealthCheckResult {
                unit_id: unit_id.to_string(),
                status: HealthStatus::Unknown,
                message: format!("health check failed: {}", e),
                checked_at: Utc::now(),
                latency: started.elapsed(),
            },
        };

        {
            let mut stats = self.stats.write();
            stats.total_health_checks += 1;
            stats.last_health_check_at = Some(Utc::now());
            if result.status == HealthStatus::Unhealthy {
                stats.failed_health_checks += 1;
            }
        }

        let should_recover = {
            let mut entry = match self.states.get_mut(unit_id) {
                Some(entry) => entry,
                None => return,
            };
            let state = entry.value_mut();
            state.status = result.status;
            state.updated_at = Utc::now();

            match result.status {
                HealthStatus::Unhealthy => state.failure_count += 1,
                HealthStatus::Healthy => state.failure_count = 0,
                _ => {}
            }
            state.last_check = Some(result);

            state.status == HealthStatus::Unhealthy
                && !state.is_recovering
                && state.failure_count >= self.config.failure_threshold
                && state.recovery_attempts < self.config.max_recovery_attempts
        };

        if !should_recover {
            if let Some(state) = self.states.get(unit_id) {
                if state.status == HealthStatus::Unhealthy
                    && state.recovery_attempts >= self.config.max_recovery_attempts
                {
                    error!(
                        unit_id = %unit_id,
                        attempts = state.recovery_attempts,
                        max_attempts = self.config.max_recovery_attempts,
                        "Max recovery attempts exceeded"
                    );
                }
            }
            return;
        }

        if let Some(mut entry) = self.states.get_mut(unit_id) {
            entry.value_mut().is_recovering = true;
        }

        let manager = Arc::clone(self);
        let unit = unit_id.to_string();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            manager.recover_unit(&unit, &task_token).await;
            if let Some(mut entry) = manager.states.get_mut(&unit) {
                entry.value_mut().is_recovering = false;
            }
        });

        let mut tasks = self.recovery_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn recover_unit(&self, unit_id: &str, token: &CancellationToken) {
        let scope = Scope::with_token(token.clone());
        if scope.sleep(self.config.recovery_delay).await.is_err() {
            return;
        }

        for action in self.config.actions.clone() {
            if self.attempt_action(unit_id, action).await {
                return;
            }
            if token.is_cancelled() {
                return;
            }
        }

        error!(unit_id = %unit_id, "All recovery actions failed");
    }

    async fn attempt_action(&self, unit_id: &str, action: RecoveryAction) -> bool {
        let started = tokio::time::Instant::now();
        info!(unit_id = %unit_id, action = %action, "Attempting recovery");

        let result = match action {
            RecoveryAction::Reset => self.controller.reset(unit_id).await,
            RecoveryAction::Restart => self.controller.restart(unit_id).await,
            RecoveryAction::Reload => self.controller.reload(unit_id).await,
            RecoveryAction::Failover => match self.config.failover_targets.first() {
                Some(target) => self.controller.failover(unit_id, target).await,
                None => {
                    debug!(unit_id = %unit_id, "No failover targets configured");
                    Err(PluginError::new(
                        crate::errors::ErrorCode::NotFound,
                        "no failover targets configured",
                    ))
                }
            },
            RecoveryAction::Custom => match &self.custom_recovery {
                Some(f) => f(unit_id.to_string()).await,
                None => {
                    warn!(unit_id = %unit_id, action = %action, "No recovery function for action");
                    Err(PluginError::new(
                        crate::errors::ErrorCode::NotFound,
                        "no custom recovery function registered",
                    ))
                }
            },
        };

        let duration = started.elapsed();
        let success = result.is_ok();
        let attempt = RecoveryAttempt {
            unit_id: unit_id.to_string(),
            action,
            attempted_at: Utc::now(),
            success,
            error: result.as_ref().err().map(|e| e.to_string()),
            duration,
        };

        {
            let mut stats = self.stats.write();
            stats.total_recovery_attempts += 1;
            stats.last_recovery_at = Some(Utc::now());
            if success {
                stats.successful_recoveries += 1;
                let n = stats.successful_recoveries;
                let total = stats.average_recovery_time * (n - 1) as u32 + duration;
                stats.average_recovery_time = total / n as u32;
            } else {
                stats.failed_recoveries += 1;
            }
        }

        if let Some(mut entry) = self.states.get_mut(unit_id) {
            let state = entry.value_mut();
            state.last_recovery = Some(attempt);
            state.recovery_attempts += 1;
            state.updated_at = Utc::now();
            if success {
                state.failure_count = 0;
                state.recovery_attempts = 0;
            }
        }

        match result {
            Ok(()) => {
                info!(
                    unit_id = %unit_id,
                    action = %action,
                    duration_ms = duration.as_millis() as u64,
                    "Recovery attempt succeeded"
                );
                true
            }
            Err(e) => {
                error!(
                    unit_id = %unit_id,
                    action = %action,
                    error = %e,
                    "Recovery attempt failed"
                );
                false
            }
        }
    }

    /// Run one health-check pass immediately. Exposed for embedders that
    /// drive checks themselves.
    pub async fn check_now(self: &Arc<Self>) {
        let token = CancellationToken::new();
        self.run_health_checks(&token).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::recovery::strategies::tests::FlakyController;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedChecker {
        healthy_after: u32,
        checks: AtomicU32,
    }

    impl ScriptedChecker {
        fn unhealthy_forever() -> Self {
            Self {
                healthy_after: u32::MAX,
                checks: AtomicU32::new(0),
            }
        }

        fn healthy() -> Self {
            Self {
                healthy_after: 0,
                checks: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn check(
            &self,
            _scope: &Scope,
            unit_id: &str,
        ) -> Result<HealthCheckResult, PluginError> {
            let n = self.checks.fetch_add(1, Ordering::SeqCst);
            let status = if n >= self.healthy_after {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            Ok(HealthCheckResult {
                unit_id: unit_id.to_string(),
                status,
                message: String::new(),
                checked_at: Utc::now(),
                latency: Duration::from_millis(1),
            })
        }
    }

    fn fast_config() -> AutoRecoveryConfig {
        AutoRecoveryConfig {
            health_check_interval: Duration::from_millis(10),
            health_check_timeout: Duration::from_millis(100),
            recovery_delay: Duration::from_millis(5),
            failure_threshold: 2,
            max_recovery_attempts: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let config = AutoRecoveryConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AutoRecoveryConfig {
            actions: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(AutoRecoveryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_register_unregister() {
        let manager = AutoRecoveryManager::new(
            AutoRecoveryConfig::default(),
            Arc::new(ScriptedChecker::healthy()),
            Arc::new(FlakyController::new(0)),
        )
        .unwrap();

        manager.register_unit("netease");
        manager.register_unit("netease");
        assert_eq!(manager.all_unit_states().len(), 1);
        assert_eq!(
            manager.unit_state("netease").unwrap().status,
            HealthStatus::Unknown
        );

        manager.unregister_unit("netease");
        assert!(manager.unit_state("netease").is_none());
    }

    #[tokio::test]
    async fn test_healthy_check_resets_failures() {
        let manager = Arc::new(
            AutoRecoveryManager::new(
                fast_config(),
                Arc::new(ScriptedChecker::healthy()),
                Arc::new(FlakyController::new(0)),
            )
            .unwrap(),
        );
        manager.register_unit("u1");
        manager.check_now().await;

        let state = manager.unit_state("u1").unwrap();
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.failure_count, 0);
        assert_eq!(manager.stats().total_health_checks, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_unit_triggers_recovery() {
        let controller = Arc::new(FlakyController::new(0));
        let manager = Arc::new(
            AutoRecoveryManager::new(
                fast_config(),
                Arc::new(ScriptedChecker::unhealthy_forever()),
                controller.clone(),
            )
            .unwrap(),
        );
        manager.register_unit("u1");

        // Two failing checks reach the threshold and spawn a recovery
        manager.check_now().await;
        manager.check_now().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Reset action (first in the default order) succeeded, zeroing counters
        let state = manager.unit_state("u1").unwrap();
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.recovery_attempts, 0);
        assert!(state.last_recovery.is_some());
        assert_eq!(
            state.last_recovery.unwrap().action,
            RecoveryAction::Reset
        );
        assert!(manager.stats().successful_recoveries >= 1);
    }

    #[tokio::test]
    async fn test_recovering_unit_skipped_by_checks() {
        let manager = Arc::new(
            AutoRecoveryManager::new(
                fast_config(),
                Arc::new(ScriptedChecker::unhealthy_forever()),
                Arc::new(FlakyController::new(0)),
            )
            .unwrap(),
        );
        manager.register_unit("u1");
        if let Some(mut entry) = manager.states.get_mut("u1") {
            entry.value_mut().is_recovering = true;
        }

        manager.check_now().await;
        assert_eq!(manager.stats().total_health_checks, 0);
    }

    #[tokio::test]
    async fn test_checker_error_maps_to_unknown() {
        struct FailingChecker;

        #[async_trait]
        impl HealthChecker for FailingChecker {
            async fn check(
                &self,
                _scope: &Scope,
                _unit_id: &str,
            ) -> Result<HealthCheckResult, PluginError> {
                Err(PluginError::new(ErrorCode::Unavailable, "probe down"))
            }
        }

        let manager = Arc::new(
            AutoRecoveryManager::new(
                fast_config(),
                Arc::new(FailingChecker),
                Arc::new(FlakyController::new(0)),
            )
            .unwrap(),
        );
        manager.register_unit("u1");
        manager.check_now().await;

        let state = manager.unit_state("u1").unwrap();
        assert_eq!(state.status, HealthStatus::Unknown);
        assert!(state
            .last_check
            .unwrap()
            .message
            .contains("health check failed"));
    }

    #[tokio::test]
    async fn test_stop_joins_in_flight_recovery() {
        struct SlowResetController {
            completed: AtomicU32,
        }

        #[async_trait]
        impl UnitController for SlowResetController {
            async fn restart(&self, _unit_id: &str) -> Result<(), PluginError> {
                Ok(())
            }

            async fn reload(&self, _unit_id: &str) -> Result<(), PluginError> {
                Ok(())
            }

            async fn reset(&self, _unit_id: &str) -> Result<(), PluginError> {
                tokio::time::sleep(Duration::from_millis(150)).await;
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            async fn failover(
                &self,
                _unit_id: &str,
                _target: &str,
            ) -> Result<(), PluginError> {
                Ok(())
            }
        }

        let controller = Arc::new(SlowResetController {
            completed: AtomicU32::new(0),
        });
        let manager = Arc::new(
            AutoRecoveryManager::new(
                fast_config(),
                Arc::new(ScriptedChecker::unhealthy_forever()),
                controller.clone(),
            )
            .unwrap(),
        );
        manager.register_unit("u1");

        // Reach the failure threshold and let the slow reset start
        manager.check_now().await;
        manager.check_now().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        manager.stop().await;
        assert_eq!(controller.completed.load(Ordering::SeqCst), 1);
        assert!(!manager.unit_state("u1").unwrap().is_recovering);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let manager = Arc::new(
            AutoRecoveryManager::new(
                fast_config(),
                Arc::new(ScriptedChecker::healthy()),
                Arc::new(FlakyController::new(0)),
            )
            .unwrap(),
        );
        manager.register_unit("u1");
        manager.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop().await;

        assert!(manager.stats().total_health_checks >= 1);
    }
}
