//! Priority-ordered middleware chain for error handling.
//!
//! Each middleware wraps the next one; lower priority numbers run closer to
//! the original failure. The chain is rebuilt into a nested handler on every
//! [`MiddlewareChain::execute`] call, so middlewares can be added or removed
//! between invocations without affecting in-flight handling.

use crate::alerts::SmartAlertManager;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::errors::{ErrorCode, ErrorSeverity, PluginError};
use crate::metrics::SharedMetrics;
use crate::recovery::RecoveryManager;
use crate::retry::RetryExecutor;
use crate::scope::Scope;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a fire-and-forget recovery triggered from the chain may run
const RECOVERY_TRIGGER_TIMEOUT: Duration = Duration::from_secs(300);

pub const CONTEXT_PRIORITY: i32 = 100;
pub const RETRY_PRIORITY: i32 = 200;
pub const CIRCUIT_BREAKER_PRIORITY: i32 = 300;
pub const RECOVERY_PRIORITY: i32 = 400;
pub const ALERT_PRIORITY: i32 = 800;
pub const METRICS_PRIORITY: i32 = 900;
pub const LOGGING_PRIORITY: i32 = 1000;

/// Innermost handler the chain bottoms out on
pub type TerminalHandler =
    Arc<dyn Fn(Scope, PluginError) -> BoxFuture<'static, Result<(), PluginError>> + Send + Sync>;

/// Adapt an async closure into a [`TerminalHandler`]
pub fn terminal_fn<F, Fut>(f: F) -> TerminalHandler
where
    F: Fn(Scope, PluginError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
{
    Arc::new(move |scope, error| Box::pin(f(scope, error)))
}

/// One cross-cutting handler in the chain
#[async_trait]
pub trait ErrorMiddleware: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first (closer to the original failure)
    fn priority(&self) -> i32;

    async fn handle(
        &self,
        scope: &Scope,
        error: PluginError,
        next: Next,
    ) -> Result<(), PluginError>;
}

/// Continuation into the rest of the chain.
///
/// Cloneable and `'static` so middlewares can re-run the remainder (retry) or
/// hand it to an executor that requires owned futures (circuit breaker).
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<[Arc<dyn ErrorMiddleware>]>,
    index: usize,
    terminal: TerminalHandler,
}

impl Next {
    pub fn run(&self, scope: &Scope, error: PluginError) -> BoxFuture<'static, Result<(), PluginError>> {
        let next = self.clone();
        let scope = scope.clone();
        Box::pin(async move {
            match next.middlewares.get(next.index) {
                Some(middleware) => {
                    let deeper = Next {
                        middlewares: Arc::clone(&next.middlewares),
                        index: next.index + 1,
                        terminal: Arc::clone(&next.terminal),
                    };
                    middleware.handle(&scope, error, deeper).await
                }
                None => (next.terminal)(scope, error).await,
            }
        })
    }
}

/// Ordered middleware registry
pub struct MiddlewareChain {
    middlewares: RwLock<Vec<Arc<dyn ErrorMiddleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: RwLock::new(Vec::new()),
        }
    }

    /// Insert keeping ascending priority order
    pub fn add(&self, middleware: Arc<dyn ErrorMiddleware>) {
        let mut middlewares = self.middlewares.write();
        let position = middlewares
            .iter()
            .position(|existing| middleware.priority() < existing.priority())
            .unwrap_or(middlewares.len());
        info!(
            name = %middleware.name(),
            priority = middleware.priority(),
            "Error middleware added"
        );
        middlewares.insert(position, middleware);
    }

    pub fn remove(&self, name: &str) {
        let mut middlewares = self.middlewares.write();
        if let Some(position) = middlewares.iter().position(|m| m.name() == name) {
            middlewares.remove(position);
            info!(name = %name, "Error middleware removed");
        }
    }

    /// Names in execution order
    pub fn names(&self) -> Vec<String> {
        self.middlewares
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.read().is_empty()
    }

    /// Run `error` through the chain, bottoming out on `terminal`
    pub async fn execute(
        &self,
        scope: &Scope,
        error: PluginError,
        terminal: TerminalHandler,
    ) -> Result<(), PluginError> {
        let snapshot: Arc<[Arc<dyn ErrorMiddleware>]> =
            self.middlewares.read().clone().into();
        let next = Next {
            middlewares: snapshot,
            index: 0,
            terminal,
        };
        next.run(scope, error).await
    }

    /// Register the canonical middleware set in priority order
    pub fn register_defaults(
        &self,
        metrics: SharedMetrics,
        alerts: Arc<SmartAlertManager>,
        recovery: Arc<RecoveryManager>,
        retry: Arc<RetryExecutor>,
        breaker: Arc<CircuitBreaker>,
    ) {
        self.add(Arc::new(ContextMiddleware::new()));
        self.add(Arc::new(RetryMiddleware::new(retry)));
        self.add(Arc::new(CircuitBreakerMiddleware::new(breaker)));
        self.add(Arc::new(RecoveryMiddleware::new(recovery)));
        self.add(Arc::new(AlertMiddleware::new(alerts)));
        self.add(Arc::new(MetricsMiddleware::new(metrics)));
        self.add(Arc::new(LoggingMiddleware::new()));
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Enriches the error with handling context and a stack trace
pub struct ContextMiddleware {
    static_fields: HashMap<String, serde_json::Value>,
}

impl ContextMiddleware {
    pub fn new() -> Self {
        Self {
            static_fields: HashMap::new(),
        }
    }

    /// Attach a fixed context entry to every handled error
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.static_fields.insert(key.into(), value.into());
        self
    }
}

impl Default for ContextMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ErrorMiddleware for ContextMiddleware {
    fn name(&self) -> &str {
        "context"
    }

    fn priority(&self) -> i32 {
        CONTEXT_PRIORITY
    }

    async fn handle(
        &self,
        scope: &Scope,
        mut error: PluginError,
        next: Next,
    ) -> Result<(), PluginError> {
        for (key, value) in &self.static_fields {
            error.add_context(key.clone(), value.clone());
        }
        error.add_context("handled_at", chrono::Utc::now().to_rfc3339());
        error.capture_stack_trace();
        next.run(scope, error).await
    }
}

/// Re-runs the rest of the chain through the retry policy for retryable errors
pub struct RetryMiddleware {
    executor: Arc<RetryExecutor>,
}

impl RetryMiddleware {
    pub fn new(executor: Arc<RetryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ErrorMiddleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        RETRY_PRIORITY
    }

    async fn handle(
        &self,
        scope: &Scope,
        error: PluginError,
        next: Next,
    ) -> Result<(), PluginError> {
        if error.retryable() {
            self.executor
                .execute(scope, || next.run(scope, error.clone()))
                .await
        } else {
            next.run(scope, error).await
        }
    }
}

/// Protects downstream handling with a circuit breaker
pub struct CircuitBreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl ErrorMiddleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    fn priority(&self) -> i32 {
        CIRCUIT_BREAKER_PRIORITY
    }

    async fn handle(
        &self,
        scope: &Scope,
        error: PluginError,
        next: Next,
    ) -> Result<(), PluginError> {
        let scope = scope.clone();
        let result = self
            .breaker
            .execute(move || next.run(&scope, error))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(CircuitBreakerError::OperationFailed(err)) => Err(err),
            Err(CircuitBreakerError::Open(name)) => Err(PluginError::new(
                ErrorCode::Unavailable,
                format!("error handling rejected, circuit '{}' is open", name),
            )),
            Err(other) => Err(PluginError::new(ErrorCode::Internal, other.to_string())),
        }
    }
}

/// Fires recovery for the failing unit without blocking the chain
pub struct RecoveryMiddleware {
    manager: Arc<RecoveryManager>,
    /// Explicit strategy names; empty means "whatever applies to the error"
    strategy_names: Vec<String>,
}

impl RecoveryMiddleware {
    pub fn new(manager: Arc<RecoveryManager>) -> Self {
        Self {
            manager,
            strategy_names: Vec::new(),
        }
    }

    pub fn with_strategies(mut self, names: Vec<String>) -> Self {
        self.strategy_names = names;
        self
    }
}

#[async_trait]
impl ErrorMiddleware for RecoveryMiddleware {
    fn name(&self) -> &str {
        "recovery"
    }

    fn priority(&self) -> i32 {
        RECOVERY_PRIORITY
    }

    async fn handle(
        &self,
        scope: &Scope,
        error: PluginError,
        next: Next,
    ) -> Result<(), PluginError> {
        if let Some(unit_id) = error
            .context_value("unit_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        {
            let names = if self.strategy_names.is_empty() {
                self.manager
                    .applicable_strategies(&error)
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect()
            } else {
                self.strategy_names.clone()
            };
            if !names.is_empty() {
                let manager = Arc::clone(&self.manager);
                tokio::spawn(async move {
                    let recovery_scope = Scope::with_timeout(RECOVERY_TRIGGER_TIMEOUT);
                    if let Err(e) = manager
                        .execute_recovery(&recovery_scope, &unit_id, &names)
                        .await
                    {
                        warn!(unit_id = %unit_id, error = %e, "Background recovery failed");
                    }
                });
            }
        }
        next.run(scope, error).await
    }
}

/// Triggers alerts for severe errors without blocking the chain
pub struct AlertMiddleware {
    alerts: Arc<SmartAlertManager>,
}

impl AlertMiddleware {
    pub fn new(alerts: Arc<SmartAlertManager>) -> Self {
        Self { alerts }
    }

    fn rule_id_for(severity: ErrorSeverity) -> Option<&'static str> {
        match severity {
            ErrorSeverity::Critical => Some("critical_error_alert"),
            ErrorSeverity::Fatal => Some("fatal_error_alert"),
            ErrorSeverity::Error => Some("error_alert"),
            _ => None,
        }
    }
}

#[async_trait]
impl ErrorMiddleware for AlertMiddleware {
    fn name(&self) -> &str {
        "alert"
    }

    fn priority(&self) -> i32 {
        ALERT_PRIORITY
    }

    async fn handle(
        &self,
        scope: &Scope,
        error: PluginError,
        next: Next,
    ) -> Result<(), PluginError> {
        if let Some(rule_id) = Self::rule_id_for(error.severity()) {
            let mut data: HashMap<String, serde_json::Value> = HashMap::from([
                ("error_code".to_string(), serde_json::json!(error.code().to_string())),
                ("error_type".to_string(), serde_json::json!(error.error_type().to_string())),
                ("severity".to_string(), serde_json::json!(error.severity().to_string())),
                ("message".to_string(), serde_json::json!(error.message())),
            ]);
            if let Some(unit_id) = error.context_value("unit_id") {
                data.insert("unit_id".to_string(), unit_id.clone());
            }

            let alerts = Arc::clone(&self.alerts);
            tokio::spawn(async move {
                if let Err(e) = alerts.trigger_alert(rule_id, data) {
                    debug!(rule_id = %rule_id, error = %e, "Alert trigger skipped");
                }
            });
        }
        next.run(scope, error).await
    }
}

/// Records handling counters and latency
pub struct MetricsMiddleware {
    metrics: SharedMetrics,
}

impl MetricsMiddleware {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl ErrorMiddleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> i32 {
        METRICS_PRIORITY
    }

    async fn handle(
        &self,
        scope: &Scope,
        error: PluginError,
        next: Next,
    ) -> Result<(), PluginError> {
        let error_code = error.code().to_string();
        let error_type = error.error_type().to_string();
        let severity = error.severity().to_string();
        self.metrics.increment_counter(
            "error_handling_total",
            &[
                ("error_code", &error_code),
                ("error_type", &error_type),
                ("severity", &severity),
            ],
        );

        let start = std::time::Instant::now();
        let result = next.run(scope, error).await;
        let duration = start.elapsed();

        let success = if result.is_ok() { "true" } else { "false" };
        self.metrics
            .record_timer("error_handling_duration", duration, &[("success", success)]);
        if result.is_ok() {
            self.metrics
                .increment_counter("error_handling_success_total", &[]);
        } else {
            self.metrics
                .increment_counter("error_handling_failure_total", &[]);
        }
        result
    }
}

/// Outermost middleware: always records the error and the handling outcome
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ErrorMiddleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn priority(&self) -> i32 {
        LOGGING_PRIORITY
    }

    async fn handle(
        &self,
        scope: &Scope,
        error: PluginError,
        next: Next,
    ) -> Result<(), PluginError> {
        error!(
            error_code = %error.code(),
            error_type = %error.error_type(),
            severity = %error.severity(),
            message = %error.message(),
            "Plugin error occurred"
        );

        let start = std::time::Instant::now();
        let result = next.run(scope, error).await;

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Error handling completed"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::metrics::InMemoryMetrics;
    use crate::retry::RetryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        label: &'static str,
        priority: i32,
        order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ErrorMiddleware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn handle(
            &self,
            scope: &Scope,
            error: PluginError,
            next: Next,
        ) -> Result<(), PluginError> {
            self.order.lock().push(self.label);
            next.run(scope, error).await
        }
    }

    fn ok_terminal() -> TerminalHandler {
        terminal_fn(|_scope, _error| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_execution_follows_priority_not_insertion() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(Arc::new(Recorder {
            label: "last",
            priority: 900,
            order: order.clone(),
        }));
        chain.add(Arc::new(Recorder {
            label: "first",
            priority: 100,
            order: order.clone(),
        }));
        chain.add(Arc::new(Recorder {
            label: "middle",
            priority: 400,
            order: order.clone(),
        }));

        let scope = Scope::background();
        let error = PluginError::new(ErrorCode::PluginCrashed, "boom");
        chain.execute(&scope, error, ok_terminal()).await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "middle", "last"]);
        assert_eq!(chain.names(), vec!["first", "middle", "last"]);
    }

    #[tokio::test]
    async fn test_terminal_receives_error() {
        let chain = MiddlewareChain::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = seen.clone();
        let terminal = terminal_fn(move |_scope, error: PluginError| {
            let seen = seen_clone.clone();
            async move {
                *seen.lock() = Some(error.code());
                Ok(())
            }
        });

        let scope = Scope::background();
        let error = PluginError::new(ErrorCode::PluginTimeout, "slow");
        chain.execute(&scope, error, terminal).await.unwrap();
        assert_eq!(*seen.lock(), Some(ErrorCode::PluginTimeout));
    }

    #[tokio::test]
    async fn test_remove_middleware() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(Arc::new(Recorder {
            label: "a",
            priority: 100,
            order: order.clone(),
        }));
        chain.add(Arc::new(Recorder {
            label: "b",
            priority: 200,
            order: order.clone(),
        }));
        assert_eq!(chain.len(), 2);

        chain.remove("a");
        assert_eq!(chain.names(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_context_middleware_enriches_error() {
        let chain = MiddlewareChain::new();
        chain.add(Arc::new(ContextMiddleware::new().with_field("host", "test-node")));

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = seen.clone();
        let terminal = terminal_fn(move |_scope, error: PluginError| {
            let seen = seen_clone.clone();
            async move {
                *seen.lock() = Some(error);
                Ok(())
            }
        });

        let scope = Scope::background();
        let error = PluginError::new(ErrorCode::PluginCrashed, "boom");
        chain.execute(&scope, error, terminal).await.unwrap();

        let enriched = seen.lock().clone().unwrap();
        assert_eq!(
            enriched.context_value("host"),
            Some(&serde_json::Value::from("test-node"))
        );
        assert!(enriched.context_value("handled_at").is_some());
        assert!(enriched.stack_trace().is_some());
    }

    #[tokio::test]
    async fn test_retry_middleware_retries_only_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let terminal = terminal_fn(move |_scope, _error: PluginError| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PluginError::new(ErrorCode::PluginTimeout, "still failing"))
            }
        });

        let config = RetryConfig::builder()
            .max_attempts(3)
            .base_delay(Duration::from_millis(1))
            .jitter(false)
            .build()
            .unwrap();
        let chain = MiddlewareChain::new();
        chain.add(Arc::new(RetryMiddleware::new(Arc::new(RetryExecutor::new(
            config,
        )))));

        let scope = Scope::background();
        // Retryable error: terminal is driven once per attempt
        let error = PluginError::new(ErrorCode::PluginTimeout, "slow");
        assert!(error.retryable());
        let result = chain.execute(&scope, error, terminal.clone()).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Non-retryable error passes straight through
        calls.store(0, Ordering::SeqCst);
        let error = PluginError::new(ErrorCode::InvalidArgument, "bad input");
        assert!(!error.retryable());
        let result = chain.execute(&scope, error, terminal).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_middleware_rejects_when_open() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .build()
            .unwrap();
        let breaker = Arc::new(CircuitBreaker::new("mw-test", config));
        let chain = MiddlewareChain::new();
        chain.add(Arc::new(CircuitBreakerMiddleware::new(breaker.clone())));

        let failing = terminal_fn(|_scope, _error: PluginError| async {
            Err(PluginError::new(ErrorCode::PluginCrashed, "handler down"))
        });

        let scope = Scope::background();
        for _ in 0..2 {
            let error = PluginError::new(ErrorCode::PluginCrashed, "boom");
            let _ = chain.execute(&scope, error, failing.clone()).await;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let counting = terminal_fn(move |_scope, _error: PluginError| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let error = PluginError::new(ErrorCode::PluginCrashed, "boom");
        let result = chain.execute(&scope, error, counting).await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        // Rejected before the terminal handler ran
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_metrics_middleware_records_outcome() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let chain = MiddlewareChain::new();
        chain.add(Arc::new(MetricsMiddleware::new(metrics.clone())));

        let scope = Scope::background();
        let error = PluginError::new(ErrorCode::PluginCrashed, "boom");
        chain.execute(&scope, error, ok_terminal()).await.unwrap();

        assert_eq!(
            metrics.counter_value("error_handling_success_total", &[]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_alert_middleware_skips_low_severity() {
        let alerts = Arc::new(SmartAlertManager::new());
        let chain = MiddlewareChain::new();
        chain.add(Arc::new(AlertMiddleware::new(alerts.clone())));

        let scope = Scope::background();
        // Warning severity never reaches a rule lookup
        let error =
            PluginError::new(ErrorCode::PluginCrashed, "boom").with_severity(ErrorSeverity::Warning);
        chain.execute(&scope, error, ok_terminal()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(alerts.active_alerts().is_empty());
    }
}
