//! Recovery manager: bounded-concurrency execution of named strategies with
//! history and health sweeps.

use super::strategies::{RecoveryStrategy, RecoveryType};
use crate::error::{ResilienceError, Result};
use crate::errors::{ErrorCode, PluginError};
use crate::scope::Scope;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for the recovery manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryManagerConfig {
    pub enabled: bool,
    pub max_concurrent_recoveries: usize,
    pub recovery_timeout: Duration,
    pub health_check_interval: Duration,
    pub metrics_retention_period: Duration,
    pub enable_history: bool,
    pub max_history_size: usize,
}

impl Default for RecoveryManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_recoveries: 10,
            recovery_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            metrics_retention_period: Duration::from_secs(24 * 3600),
            enable_history: true,
            max_history_size: 1000,
        }
    }
}

impl RecoveryManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_recoveries == 0 {
            return Err(ResilienceError::Validation(
                "max_concurrent_recoveries must be greater than 0".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::Validation(
                "recovery_timeout must be greater than 0".to_string(),
            ));
        }
        if self.enable_history && self.max_history_size == 0 {
            return Err(ResilienceError::Validation(
                "max_history_size must be greater than 0 when history is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// One entry in the recovery history ring
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryEvent {
    pub id: String,
    pub unit_id: String,
    pub strategy_name: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

/// Bounded ring of recovery events
struct RecoveryHistory {
    events: RwLock<VecDeque<RecoveryEvent>>,
    max_size: usize,
}

impl RecoveryHistory {
    fn new(max_size: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(max_size)),
            max_size,
        }
    }

    fn add(&self, event: RecoveryEvent) {
        let mut events = self.events.write();
        if events.len() >= self.max_size {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn all(&self) -> Vec<RecoveryEvent> {
        self.events.read().iter().cloned().collect()
    }

    fn retain_newer_than(&self, cutoff: DateTime<Utc>) {
        self.events.write().retain(|event| event.timestamp > cutoff);
    }
}

/// Aggregate counters for the recovery manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryManagerStats {
    pub total_strategies: usize,
    pub healthy_strategies: usize,
    pub unhealthy_strategies: usize,
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub average_recovery_time: Duration,
    pub concurrent_recoveries: usize,
    pub last_recovery_at: Option<DateTime<Utc>>,
}

impl RecoveryManagerStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_recoveries == 0 {
            0.0
        } else {
            self.successful_recoveries as f64 / self.total_recoveries as f64
        }
    }
}

/// Registry and executor for recovery strategies
pub struct RecoveryManager {
    config: RecoveryManagerConfig,
    strategies: DashMap<String, Arc<dyn RecoveryStrategy>>,
    history: Option<RecoveryHistory>,
    stats: RwLock<RecoveryManagerStats>,
    concurrency: Arc<Semaphore>,
    loops: parking_lot::Mutex<Option<(watch::Sender<bool>, Vec<JoinHandle<()>>)>>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryManagerConfig) -> Result<Self> {
        config.validate()?;
        let history = config
            .enable_history
            .then(|| RecoveryHistory::new(config.max_history_size));
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_recoveries));
        Ok(Self {
            config,
            strategies: DashMap::new(),
            history,
            stats: RwLock::new(RecoveryManagerStats::default()),
            concurrency,
            loops: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RecoveryManagerConfig {
        &self.config
    }

    /// Register a strategy under its name
    pub fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) -> Result<()> {
        let name = strategy.name().to_string();
        if self.strategies.contains_key(&name) {
            return Err(ResilienceError::AlreadyExists(format!(
                "recovery strategy '{}'",
                name
            )));
        }

        info!(
            name = %name,
            recovery_type = %strategy.recovery_type(),
            priority = strategy.priority(),
            "Recovery strategy registered"
        );
        self.record_event(&name, "", "strategy_registered", true, None, None);
        self.strategies.insert(name, strategy);
        self.refresh_strategy_stats();
        Ok(())
    }

    pub fn unregister_strategy(&self, name: &str) -> Result<()> {
        self.strategies.remove(name).ok_or_else(|| {
            ResilienceError::NotFound(format!("recovery strategy '{}'", name))
        })?;
        info!(name = %name, "Recovery strategy unregistered");
        self.record_event(name, "", "strategy_unregistered", true, None, None);
        self.refresh_strategy_stats();
        Ok(())
    }

    pub fn strategy(&self, name: &str) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies.get(name).map(|entry| entry.value().clone())
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Strategies of one type in ascending priority
    pub fn strategies_by_type(&self, recovery_type: RecoveryType) -> Vec<Arc<dyn RecoveryStrategy>> {
        let mut matching: Vec<Arc<dyn RecoveryStrategy>> = self
            .strategies
            .iter()
            .filter(|entry| entry.value().recovery_type() == recovery_type)
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by_key(|strategy| strategy.priority());
        matching
    }

    /// Strategies applicable to `error`, in ascending priority
    pub fn applicable_strategies(&self, error: &PluginError) -> Vec<Arc<dyn RecoveryStrategy>> {
        let mut applicable: Vec<Arc<dyn RecoveryStrategy>> = self
            .strategies
            .iter()
            .filter(|entry| entry.value().can_recover(error))
            .map(|entry| entry.value().clone())
            .collect();
        applicable.sort_by_key(|strategy| strategy.priority());
        applicable
    }

    /// Run the named strategies for `unit_id` until one succeeds.
    ///
    /// Waits (cancellably) for one of the concurrency permits, bounds the
    /// whole run by the configured recovery timeout, and records each attempt
    /// in the history ring.
    pub async fn execute_recovery(
        &self,
        scope: &Scope,
        unit_id: &str,
        strategy_names: &[String],
    ) -> std::result::Result<(), PluginError> {
        if !self.config.enabled {
            return Ok(());
        }

        let _permit = scope
            .bound(self.concurrency.clone().acquire_owned())
            .await
            .map_err(|e| PluginError::new(ErrorCode::Cancelled, e.to_string()))?
            .map_err(|e| PluginError::new(ErrorCode::Internal, e.to_string()))?;

        {
            let mut stats = self.stats.write();
            stats.concurrent_recoveries += 1;
        }
        let result = self.run_strategies(scope, unit_id, strategy_names).await;
        {
            let mut stats = self.stats.write();
            stats.concurrent_recoveries -= 1;
        }
        result
    }

    async fn run_strategies(
        &self,
        scope: &Scope,
        unit_id: &str,
        strategy_names: &[String],
    ) -> std::result::Result<(), PluginError> {
        let strategies: Vec<Arc<dyn RecoveryStrategy>> = strategy_names
            .iter()
            .filter_map(|name| self.strategy(name))
            .collect();

        if strategies.is_empty() {
            return Err(PluginError::new(
                ErrorCode::NotFound,
                format!("no recovery strategies resolved for unit {}", unit_id),
            ));
        }

        let overall = scope.child_with_timeout(self.config.recovery_timeout);
        let mut last_error: Option<PluginError> = None;

        for strategy in strategies {
            let attempt_scope = overall.child_with_timeout(strategy.timeout());
            let started = tokio::time::Instant::now();
            debug!(
                unit_id = %unit_id,
                strategy = %strategy.name(),
                "Executing recovery strategy"
            );

            let result = strategy.execute(&attempt_scope, unit_id).await;
            let duration = started.elapsed();
            let success = result.is_ok();

            self.update_recovery_stats(success, duration);
            self.record_event(
                strategy.name(),
                unit_id,
                if success {
                    "recovery_success"
                } else {
                    "recovery_failed"
                },
                success,
                Some(duration),
                result.as_ref().err().map(|e| e.to_string()),
            );

            match result {
                Ok(()) => {
                    info!(
                        unit_id = %unit_id,
                        strategy = %strategy.name(),
                        duration_ms = duration.as_millis() as u64,
                        "Recovery strategy succeeded"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        unit_id = %unit_id,
                        strategy = %strategy.name(),
                        error = %e,
                        "Recovery strategy failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            PluginError::new(ErrorCode::Internal, "no strategy produced an error")
        });
        error!(unit_id = %unit_id, "All recovery strategies failed");
        Err(PluginError::new(
            ErrorCode::Internal,
            format!(
                "all recovery strategies failed for unit {}: {}",
                unit_id,
                last.message()
            ),
        )
        .with_cause(last))
    }

    /// Reset every registered strategy
    pub fn reset_all_strategies(&self) {
        for entry in self.strategies.iter() {
            entry.value().reset();
        }
        info!("All recovery strategies reset");
    }

    pub fn stats(&self) -> RecoveryManagerStats {
        self.stats.read().clone()
    }

    pub fn history(&self) -> Vec<RecoveryEvent> {
        self.history
            .as_ref()
            .map(|history| history.all())
            .unwrap_or_default()
    }

    /// Start the strategy health sweep and history retention loops
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Recovery manager is disabled");
            return;
        }

        let mut guard = self.loops.lock();
        if guard.is_some() {
            return;
        }

        info!(
            max_concurrent_recoveries = self.config.max_concurrent_recoveries,
            health_check_interval_secs = self.config.health_check_interval.as_secs(),
            "Starting recovery manager"
        );

        let (tx, rx) = watch::channel(false);
        let mut handles = Vec::new();

        {
            let manager = Arc::clone(self);
            let mut rx = rx.clone();
            let interval = self.config.health_check_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.sweep_strategy_health(),
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        if self.history.is_some() {
            let manager = Arc::clone(self);
            let mut rx = rx;
            // One cleanup pass per tenth of the retention period
            let interval = self.config.metrics_retention_period / 10;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.cleanup_history(),
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        *guard = Some((tx, handles));
    }

    /// Stop background loops
    pub async fn stop(&self) {
        let stopped = {
            let mut guard = self.loops.lock();
            guard.take()
        };
        if let Some((tx, handles)) = stopped {
            let _ = tx.send(true);
            for handle in handles {
                let _ = handle.await;
            }
            info!("Recovery manager stopped");
        }
    }

    fn sweep_strategy_health(&self) {
        let mut healthy = 0;
        let mut unhealthy = 0;

        for entry in self.strategies.iter() {
            if entry.value().is_healthy() {
                healthy += 1;
            } else {
                unhealthy += 1;
                warn!(
                    strategy = %entry.value().name(),
                    recovery_type = %entry.value().recovery_type(),
                    "Unhealthy recovery strategy detected"
                );
            }
        }

        let mut stats = self.stats.write();
        stats.healthy_strategies = healthy;
        stats.unhealthy_strategies = unhealthy;
    }

    fn cleanup_history(&self) {
        if let Some(history) = &self.history {
            let retention = chrono::Duration::from_std(self.config.metrics_retention_period)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
            history.retain_newer_than(Utc::now() - retention);
        }
    }

    fn refresh_strategy_stats(&self) {
        let total = self.strategies.len();
        let healthy = self
            .strategies
            .iter()
            .filter(|entry| entry.value().is_healthy())
            .count();

        let mut stats = self.stats.write();
        stats.total_strategies = total;
        stats.healthy_strategies = healthy;
        stats.unhealthy_strategies = total - healthy;
    }

    fn update_recovery_stats(&self, success: bool, duration: Duration) {
        let mut stats = self.stats.write();
        stats.total_recoveries += 1;
        stats.last_recovery_at = Some(Utc::now());

        if success {
            stats.successful_recoveries += 1;
            // Running mean over successful recoveries
            let n = stats.successful_recoveries;
            let total = stats.average_recovery_time * (n - 1) as u32 + duration;
            stats.average_recovery_time = total / n as u32;
        } else {
            stats.failed_recoveries += 1;
        }
    }

    fn record_event(
        &self,
        strategy_name: &str,
        unit_id: &str,
        event_type: &str,
        success: bool,
        duration: Option<Duration>,
        error: Option<String>,
    ) {
        if let Some(history) = &self.history {
            history.add(RecoveryEvent {
                id: Uuid::new_v4().to_string(),
                unit_id: unit_id.to_string(),
                strategy_name: strategy_name.to_string(),
                event_type: event_type.to_string(),
                timestamp: Utc::now(),
                success,
                duration,
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::strategies::tests::FlakyController;
    use crate::recovery::strategies::{FallbackStrategy, RestartStrategy};
    use std::collections::HashMap;

    fn manager() -> Arc<RecoveryManager> {
        Arc::new(RecoveryManager::new(RecoveryManagerConfig::default()).unwrap())
    }

    #[test]
    fn test_config_validation() {
        let config = RecoveryManagerConfig {
            max_concurrent_recoveries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RecoveryManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_register_and_unregister() {
        let manager = manager();
        let strategy = Arc::new(RestartStrategy::new(Arc::new(FlakyController::new(0))));

        manager.register_strategy(strategy.clone()).unwrap();
        assert!(manager.register_strategy(strategy).is_err());
        assert_eq!(manager.strategy_names(), vec!["restart".to_string()]);

        manager.unregister_strategy("restart").unwrap();
        assert!(manager.unregister_strategy("restart").is_err());
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let manager = manager();
        let controller = Arc::new(FlakyController::new(0));
        manager
            .register_strategy(Arc::new(RestartStrategy::new(controller.clone())))
            .unwrap();
        manager
            .register_strategy(Arc::new(FallbackStrategy::new(HashMap::new())))
            .unwrap();

        let scope = Scope::background();
        manager
            .execute_recovery(
                &scope,
                "netease",
                &["restart".to_string(), "fallback".to_string()],
            )
            .await
            .unwrap();

        // Restart succeeded; fallback never ran
        let events: Vec<String> = manager
            .history()
            .into_iter()
            .filter(|e| e.event_type == "recovery_success")
            .map(|e| e.strategy_name)
            .collect();
        assert_eq!(events, vec!["restart".to_string()]);
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let manager = manager();
        let strategy = Arc::new(
            RestartStrategy::new(Arc::new(FlakyController::new(100)))
                .with_max_attempts(1)
                .with_attempt_delay(Duration::from_millis(1)),
        );
        manager.register_strategy(strategy).unwrap();

        let scope = Scope::background();
        let err = manager
            .execute_recovery(&scope, "netease", &["restart".to_string()])
            .await
            .unwrap_err();
        assert!(err.message().contains("all recovery strategies failed"));
    }

    #[tokio::test]
    async fn test_unresolved_strategy_names() {
        let manager = manager();
        let scope = Scope::background();
        let err = manager
            .execute_recovery(&scope, "netease", &["missing".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_disabled_manager_is_noop() {
        let config = RecoveryManagerConfig {
            enabled: false,
            ..Default::default()
        };
        let manager = RecoveryManager::new(config).unwrap();
        let scope = Scope::background();
        manager
            .execute_recovery(&scope, "any", &["missing".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_track_recoveries() {
        let manager = manager();
        manager
            .register_strategy(Arc::new(RestartStrategy::new(Arc::new(
                FlakyController::new(0),
            ))))
            .unwrap();

        let scope = Scope::background();
        manager
            .execute_recovery(&scope, "u1", &["restart".to_string()])
            .await
            .unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_recoveries, 1);
        assert_eq!(stats.successful_recoveries, 1);
        assert!((stats.success_rate() - 1.0).abs() < 1e-9);
        assert!(stats.last_recovery_at.is_some());
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded() {
        let config = RecoveryManagerConfig {
            max_history_size: 5,
            ..Default::default()
        };
        let manager = Arc::new(RecoveryManager::new(config).unwrap());
        manager
            .register_strategy(Arc::new(RestartStrategy::new(Arc::new(
                FlakyController::new(0),
            ))))
            .unwrap();

        let scope = Scope::background();
        for _ in 0..10 {
            manager
                .execute_recovery(&scope, "u1", &["restart".to_string()])
                .await
                .unwrap();
        }
        assert!(manager.history().len() <= 5);
    }

    #[tokio::test]
    async fn test_applicable_strategies_sorted_by_priority() {
        let manager = manager();
        manager
            .register_strategy(Arc::new(FallbackStrategy::new(HashMap::new())))
            .unwrap();
        manager
            .register_strategy(Arc::new(RestartStrategy::new(Arc::new(
                FlakyController::new(0),
            ))))
            .unwrap();

        let err = PluginError::new(ErrorCode::PluginCrashed, "boom");
        let applicable = manager.applicable_strategies(&err);
        assert_eq!(applicable.len(), 2);
        assert_eq!(applicable[0].name(), "restart");
        assert_eq!(applicable[1].name(), "fallback");
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let manager = manager();
        manager.start();
        manager.stop().await;
    }
}
