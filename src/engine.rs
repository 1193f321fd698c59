//! Dependency-injected engine owning every resilience component.
//!
//! The engine is constructed explicitly by the application entry point from a
//! validated [`ResilienceConfig`] plus the host-app seams (unit controller,
//! health checker). `start` launches every background loop; `shutdown` stops
//! them within a bounded grace period. Nothing here is a hidden global.

use crate::alerts::{AlertAction, AlertActionKind, AlertRule, SmartAlertManager};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::classifier::HybridClassifier;
use crate::config::ResilienceConfig;
use crate::error::{ResilienceError, Result};
use crate::errors::PluginError;
use crate::events::{SharedPublisher, TracingPublisher};
use crate::fallback::FallbackExecutor;
use crate::logging::ErrorLogger;
use crate::metrics::{default_collector, SharedMetrics};
use crate::middleware::{terminal_fn, MiddlewareChain};
use crate::monitor::{AlertSeverity, ErrorMonitor};
use crate::recovery::{
    AutoRecoveryManager, GracefulDegradeStrategy, HealthChecker, RecoveryManager, ReloadStrategy,
    RestartStrategy, UnitController,
};
use crate::retry::RetryExecutor;
use crate::scope::Scope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Builder wiring the engine from config plus host-app seams
pub struct EngineBuilder {
    config: ResilienceConfig,
    controller: Arc<dyn UnitController>,
    checker: Arc<dyn HealthChecker>,
    metrics: Option<SharedMetrics>,
    events: Option<SharedPublisher>,
}

impl EngineBuilder {
    pub fn new(
        config: ResilienceConfig,
        controller: Arc<dyn UnitController>,
        checker: Arc<dyn HealthChecker>,
    ) -> Self {
        Self {
            config,
            controller,
            checker,
            metrics: None,
            events: None,
        }
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn events(mut self, events: SharedPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<ResilienceEngine> {
        self.config.validate()?;

        let metrics = self.metrics.unwrap_or_else(default_collector);
        let events: SharedPublisher = self.events.unwrap_or_else(|| Arc::new(TracingPublisher));

        let classifier = Arc::new(HybridClassifier::new().with_metrics(Arc::clone(&metrics)));
        let monitor = Arc::new(ErrorMonitor::new().with_metrics(Arc::clone(&metrics)));
        let alerts = Arc::new(SmartAlertManager::new().with_metrics(Arc::clone(&metrics)));
        // Rules backing the severity tiers the alert middleware fires on
        for (rule_id, severity) in [
            ("error_alert", AlertSeverity::High),
            ("critical_error_alert", AlertSeverity::Critical),
            ("fatal_error_alert", AlertSeverity::Critical),
        ] {
            alerts.register_rule(default_alert_rule(rule_id, severity))?;
        }
        let logger = Arc::new(ErrorLogger::default());

        let recovery = Arc::new(RecoveryManager::new(self.config.manager.clone())?);
        recovery.register_strategy(Arc::new(RestartStrategy::new(Arc::clone(&self.controller))))?;
        recovery.register_strategy(Arc::new(ReloadStrategy::new(Arc::clone(&self.controller))))?;
        recovery.register_strategy(Arc::new(GracefulDegradeStrategy::new()))?;

        let auto_recovery = Arc::new(AutoRecoveryManager::new(
            self.config.auto_recovery.clone(),
            Arc::clone(&self.checker),
            Arc::clone(&self.controller),
        )?);

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        for (name, breaker_config) in &self.config.circuit_breakers {
            breakers.get_or_create(name.clone(), breaker_config.clone());
        }

        let mut fallbacks = HashMap::new();
        for (name, fallback_config) in &self.config.fallbacks {
            fallbacks.insert(
                name.clone(),
                Arc::new(FallbackExecutor::new(name.clone(), fallback_config.clone())),
            );
        }

        let retry_config = self
            .config
            .retry_policies
            .get("default")
            .map(|policy| policy.to_retry_config())
            .unwrap_or_default();
        let retry = Arc::new(RetryExecutor::new(retry_config).with_metrics(Arc::clone(&metrics)));

        let default_breaker = breakers.get_or_create("default", Default::default());
        let chain = Arc::new(MiddlewareChain::new());
        chain.register_defaults(
            Arc::clone(&metrics),
            Arc::clone(&alerts),
            Arc::clone(&recovery),
            Arc::clone(&retry),
            default_breaker,
        );

        Ok(ResilienceEngine {
            config: self.config,
            metrics,
            events,
            classifier,
            monitor,
            alerts,
            logger,
            recovery,
            auto_recovery,
            breakers,
            fallbacks,
            retry,
            chain,
            running: AtomicBool::new(false),
        })
    }
}

fn default_alert_rule(rule_id: &str, severity: AlertSeverity) -> AlertRule {
    AlertRule {
        id: rule_id.to_string(),
        name: rule_id.replace('_', " "),
        description: "Fired by the alert middleware for handled plugin errors".to_string(),
        condition: "error_handled".to_string(),
        threshold: 1.0,
        duration: Duration::ZERO,
        severity,
        enabled: true,
        actions: vec![AlertAction {
            kind: AlertActionKind::Log,
            target: String::new(),
            parameters: HashMap::new(),
            enabled: true,
        }],
        labels: HashMap::new(),
        annotations: HashMap::new(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

/// The assembled resilience control plane
pub struct ResilienceEngine {
    config: ResilienceConfig,
    metrics: SharedMetrics,
    events: SharedPublisher,
    classifier: Arc<HybridClassifier>,
    monitor: Arc<ErrorMonitor>,
    alerts: Arc<SmartAlertManager>,
    logger: Arc<ErrorLogger>,
    recovery: Arc<RecoveryManager>,
    auto_recovery: Arc<AutoRecoveryManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    fallbacks: HashMap<String, Arc<FallbackExecutor>>,
    retry: Arc<RetryExecutor>,
    chain: Arc<MiddlewareChain>,
    running: AtomicBool,
}

impl ResilienceEngine {
    pub fn builder(
        config: ResilienceConfig,
        controller: Arc<dyn UnitController>,
        checker: Arc<dyn HealthChecker>,
    ) -> EngineBuilder {
        EngineBuilder::new(config, controller, checker)
    }

    /// Launch every background loop
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ResilienceError::AlreadyExists(
                "engine is already running".to_string(),
            ));
        }

        self.monitor.start()?;
        self.alerts.start()?;
        self.recovery.start();
        self.auto_recovery.start();
        for executor in self.fallbacks.values() {
            executor.start_cache_sweep();
        }

        self.events
            .publish("engine.started", serde_json::json!({}));
        info!("Resilience engine started");
        Ok(())
    }

    /// Stop every background loop within a bounded grace period
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ResilienceError::NotFound(
                "engine is not running".to_string(),
            ));
        }

        let stop_all = async {
            self.auto_recovery.stop().await;
            self.recovery.stop().await;
            if let Err(e) = self.monitor.stop().await {
                warn!(error = %e, "Error monitor did not stop cleanly");
            }
            if let Err(e) = self.alerts.stop().await {
                warn!(error = %e, "Alert manager did not stop cleanly");
            }
            for executor in self.fallbacks.values() {
                executor.stop_cache_sweep().await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE, stop_all).await.is_err() {
            warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Shutdown grace period elapsed, abandoning remaining loops"
            );
        }

        self.events
            .publish("engine.stopped", serde_json::json!({}));
        info!("Resilience engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a failure through classification, monitoring, logging and the
    /// middleware chain.
    pub async fn handle_error(
        &self,
        scope: &Scope,
        error: PluginError,
    ) -> std::result::Result<(), PluginError> {
        let unit_id = error
            .context_value("unit_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let classifier = Arc::clone(&self.classifier);
        let monitor = Arc::clone(&self.monitor);
        let logger = Arc::clone(&self.logger);
        let events = Arc::clone(&self.events);

        // Classification, recording and logging are side channels at the
        // bottom of the chain; they never fail the handling path.
        let terminal = terminal_fn(move |scope: Scope, error: PluginError| {
            let classifier = Arc::clone(&classifier);
            let monitor = Arc::clone(&monitor);
            let logger = Arc::clone(&logger);
            let events = Arc::clone(&events);
            let unit_id = error
                .context_value("unit_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            async move {
                let classification = classifier.classify(&error, &unit_id);
                monitor.record_error(&unit_id, &error);
                logger.log_error(&scope, &error, &unit_id);
                events.publish(
                    "error.handled",
                    serde_json::json!({
                        "unit_id": unit_id,
                        "error_code": error.code().to_string(),
                        "category": classification.category,
                        "confidence": classification.confidence,
                    }),
                );
                Ok(())
            }
        });

        info!(unit_id = %unit_id, error = %error, "Handling plugin error");
        self.chain.execute(scope, error, terminal).await
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn classifier(&self) -> &Arc<HybridClassifier> {
        &self.classifier
    }

    pub fn monitor(&self) -> &Arc<ErrorMonitor> {
        &self.monitor
    }

    pub fn alerts(&self) -> &Arc<SmartAlertManager> {
        &self.alerts
    }

    pub fn logger(&self) -> &Arc<ErrorLogger> {
        &self.logger
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn auto_recovery(&self) -> &Arc<AutoRecoveryManager> {
        &self.auto_recovery
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    pub fn fallback(&self, name: &str) -> Option<&Arc<FallbackExecutor>> {
        self.fallbacks.get(name)
    }

    pub fn retry(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    pub fn middleware(&self) -> &Arc<MiddlewareChain> {
        &self.chain
    }
}
