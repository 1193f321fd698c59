//! Per-unit error statistics, threshold alerts, and the monitoring loop.
//!
//! `ErrorMonitor::record_error` feeds the per-unit statistics; MTTR is the
//! mean of recorded recovery durations and MTBF the observed error span
//! divided by the interval count. `check_alerts` evaluates the configured
//! thresholds and the background loop dispatches resulting alerts to every
//! registered [`AlertHandler`].

use crate::error::{ResilienceError, Result};
use crate::errors::{ErrorCode, ErrorSeverity, ErrorType, PluginError};
use crate::metrics::SharedMetrics;
use crate::scope::CancellationToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MAX_TIMESTAMPS_PER_UNIT: usize = 1000;
const MAX_RECOVERY_SAMPLES: usize = 100;

/// What a threshold alert fired on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    ErrorRate,
    ErrorCount,
    Severity,
}

/// Urgency of a threshold alert
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<ErrorSeverity> for AlertSeverity {
    fn from(severity: ErrorSeverity) -> Self {
        match severity {
            ErrorSeverity::Trace | ErrorSeverity::Debug | ErrorSeverity::Info => {
                AlertSeverity::Low
            }
            ErrorSeverity::Warning => AlertSeverity::Medium,
            ErrorSeverity::Error => AlertSeverity::High,
            ErrorSeverity::Fatal | ErrorSeverity::Critical => AlertSeverity::Critical,
        }
    }
}

/// Alert emitted when a unit crosses one of its thresholds
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdAlert {
    pub id: String,
    pub kind: ThresholdKind,
    pub unit_id: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-unit alerting thresholds; zero disables the corresponding check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThreshold {
    /// Errors per second over `time_window`
    pub error_rate: f64,
    pub error_count: u64,
    pub severity_level: ErrorSeverity,
    pub time_window: Duration,
    pub enabled: bool,
}

impl Default for AlertThreshold {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            error_count: 0,
            severity_level: ErrorSeverity::Critical,
            time_window: Duration::from_secs(300),
            enabled: true,
        }
    }
}

/// Condensed record of one observed error
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub code: ErrorCode,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub message: String,
}

/// Aggregated error statistics for one unit
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub errors_by_type: HashMap<ErrorType, u64>,
    pub first_error: Option<ErrorRecord>,
    pub last_error: Option<ErrorRecord>,
    pub mttr: Duration,
    pub mtbf: Duration,
}

struct UnitStats {
    total_errors: u64,
    errors_by_type: HashMap<ErrorType, u64>,
    first_error: Option<ErrorRecord>,
    last_error: Option<ErrorRecord>,
    error_timestamps: VecDeque<DateTime<Utc>>,
    recovery_durations: VecDeque<Duration>,
}

impl UnitStats {
    fn new() -> Self {
        Self {
            total_errors: 0,
            errors_by_type: HashMap::new(),
            first_error: None,
            last_error: None,
            error_timestamps: VecDeque::new(),
            recovery_durations: VecDeque::new(),
        }
    }

    /// Mean recorded recovery duration
    fn mttr(&self) -> Duration {
        if self.recovery_durations.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.recovery_durations.iter().sum();
        total / self.recovery_durations.len() as u32
    }

    /// Observed error span divided by the interval count
    fn mtbf(&self) -> Duration {
        if self.total_errors < 2 {
            return Duration::ZERO;
        }
        let (first, last) = match (&self.first_error, &self.last_error) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return Duration::ZERO,
        };
        let span = (last - first).to_std().unwrap_or(Duration::ZERO);
        span / (self.total_errors - 1) as u32
    }

    fn snapshot(&self) -> ErrorStats {
        ErrorStats {
            total_errors: self.total_errors,
            errors_by_type: self.errors_by_type.clone(),
            first_error: self.first_error.clone(),
            last_error: self.last_error.clone(),
            mttr: self.mttr(),
            mtbf: self.mtbf(),
        }
    }
}

/// Receives alerts raised by the monitoring loop
#[async_trait]
pub trait AlertHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle_alert(&self, alert: &ThresholdAlert) -> Result<()>;
}

/// Handler that emits every alert as an error-level log event
pub struct LogAlertHandler {
    name: String,
}

impl LogAlertHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl AlertHandler for LogAlertHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_alert(&self, alert: &ThresholdAlert) -> Result<()> {
        error!(
            alert_id = %alert.id,
            kind = %alert.kind,
            unit_id = %alert.unit_id,
            severity = %alert.severity,
            message = %alert.message,
            "Alert triggered"
        );
        Ok(())
    }
}

/// Tracks errors per unit and raises threshold alerts
pub struct ErrorMonitor {
    stats: DashMap<String, UnitStats>,
    thresholds: DashMap<String, AlertThreshold>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    metrics: Option<SharedMetrics>,
    check_interval: Duration,
    lifecycle: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ErrorMonitor {
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
            thresholds: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            metrics: None,
            check_interval: Duration::from_secs(30),
            lifecycle: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Record one observed error for `unit_id`
    pub fn record_error(&self, unit_id: &str, error: &PluginError) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            code: error.code(),
            error_type: error.error_type(),
            severity: error.severity(),
            message: error.message().to_string(),
        };

        let mut entry = self
            .stats
            .entry(unit_id.to_string())
            .or_insert_with(UnitStats::new);
        let stats = entry.value_mut();

        stats.total_errors += 1;
        *stats.errors_by_type.entry(record.error_type).or_insert(0) += 1;
        if stats.first_error.is_none() {
            stats.first_error = Some(record.clone());
        }
        if stats.error_timestamps.len() >= MAX_TIMESTAMPS_PER_UNIT {
            stats.error_timestamps.pop_front();
        }
        stats.error_timestamps.push_back(record.timestamp);
        stats.last_error = Some(record);
        drop(entry);

        if let Some(metrics) = &self.metrics {
            let error_code = error.code().to_string();
            let error_type = error.error_type().to_string();
            let severity = error.severity().to_string();
            metrics.increment_counter(
                "unit_errors_total",
                &[
                    ("unit_id", unit_id),
                    ("error_code", &error_code),
                    ("error_type", &error_type),
                    ("severity", &severity),
                ],
            );
        }
    }

    /// Record how long a recovery of `unit_id` took; feeds MTTR
    pub fn record_recovery(&self, unit_id: &str, duration: Duration) {
        let mut entry = self
            .stats
            .entry(unit_id.to_string())
            .or_insert_with(UnitStats::new);
        let stats = entry.value_mut();
        if stats.recovery_durations.len() >= MAX_RECOVERY_SAMPLES {
            stats.recovery_durations.pop_front();
        }
        stats.recovery_durations.push_back(duration);
    }

    pub fn error_stats(&self, unit_id: &str) -> Option<ErrorStats> {
        self.stats.get(unit_id).map(|entry| entry.value().snapshot())
    }

    pub fn all_error_stats(&self) -> HashMap<String, ErrorStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Errors per second for `unit_id` over the trailing window
    pub fn error_rate(&self, unit_id: &str, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(0));

        match self.stats.get(unit_id) {
            Some(entry) => {
                let recent = entry
                    .value()
                    .error_timestamps
                    .iter()
                    .filter(|ts| **ts > cutoff)
                    .count();
                recent as f64 / window.as_secs_f64()
            }
            None => 0.0,
        }
    }

    pub fn mttr(&self, unit_id: &str) -> Duration {
        self.stats
            .get(unit_id)
            .map(|entry| entry.value().mttr())
            .unwrap_or(Duration::ZERO)
    }

    pub fn mtbf(&self, unit_id: &str) -> Duration {
        self.stats
            .get(unit_id)
            .map(|entry| entry.value().mtbf())
            .unwrap_or(Duration::ZERO)
    }

    pub fn set_alert_threshold(&self, unit_id: &str, threshold: AlertThreshold) {
        self.thresholds.insert(unit_id.to_string(), threshold);
    }

    pub fn register_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().push(handler);
    }

    /// Evaluate every enabled threshold against current statistics
    pub fn check_alerts(&self) -> Vec<ThresholdAlert> {
        let mut alerts = Vec::new();
        let now = Utc::now();

        for entry in self.thresholds.iter() {
            let unit_id = entry.key();
            let threshold = entry.value();
            if !threshold.enabled {
                continue;
            }

            let Some(stats) = self.stats.get(unit_id) else {
                continue;
            };
            let stats = stats.value();

            if threshold.error_rate > 0.0 {
                let rate = {
                    let cutoff = now
                        - chrono::Duration::from_std(threshold.time_window)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));
                    let recent = stats
                        .error_timestamps
                        .iter()
                        .filter(|ts| **ts > cutoff)
                        .count();
                    recent as f64 / threshold.time_window.as_secs_f64()
                };
                if rate > threshold.error_rate {
                    alerts.push(ThresholdAlert {
                        id: format!("{}_error_rate_{}", unit_id, now.timestamp()),
                        kind: ThresholdKind::ErrorRate,
                        unit_id: unit_id.clone(),
                        message: format!(
                            "error rate {:.3}/s exceeds threshold {:.3}/s",
                            rate, threshold.error_rate
                        ),
                        severity: AlertSeverity::High,
                        timestamp: now,
                        metadata: HashMap::from([
                            ("current_rate".to_string(), serde_json::json!(rate)),
                            (
                                "threshold".to_string(),
                                serde_json::json!(threshold.error_rate),
                            ),
                        ]),
                    });
                }
            }

            if threshold.error_count > 0 && stats.total_errors > threshold.error_count {
                alerts.push(ThresholdAlert {
                    id: format!("{}_error_count_{}", unit_id, now.timestamp()),
                    kind: ThresholdKind::ErrorCount,
                    unit_id: unit_id.clone(),
                    message: format!(
                        "error count {} exceeds threshold {}",
                        stats.total_errors, threshold.error_count
                    ),
                    severity: AlertSeverity::High,
                    timestamp: now,
                    metadata: HashMap::from([
                        (
                            "current_count".to_string(),
                            serde_json::json!(stats.total_errors),
                        ),
                        (
                            "threshold".to_string(),
                            serde_json::json!(threshold.error_count),
                        ),
                    ]),
                });
            }

            if let Some(last) = &stats.last_error {
                if last.severity >= threshold.severity_level {
                    alerts.push(ThresholdAlert {
                        id: format!("{}_severity_{}", unit_id, now.timestamp()),
                        kind: ThresholdKind::Severity,
                        unit_id: unit_id.clone(),
                        message: format!(
                            "error severity {} meets or exceeds threshold {}",
                            last.severity, threshold.severity_level
                        ),
                        severity: AlertSeverity::from(last.severity),
                        timestamp: now,
                        metadata: HashMap::from([
                            (
                                "current_severity".to_string(),
                                serde_json::json!(last.severity.to_string()),
                            ),
                            (
                                "threshold".to_string(),
                                serde_json::json!(threshold.severity_level.to_string()),
                            ),
                        ]),
                    });
                }
            }
        }

        alerts
    }

    /// Start the periodic alert-check loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.lifecycle.lock();
        if guard.is_some() {
            return Err(ResilienceError::AlreadyExists(
                "error monitor is already running".to_string(),
            ));
        }

        let token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.dispatch_alerts().await,
                    _ = loop_token.cancelled() => break,
                }
            }
        });

        *guard = Some((token, handle));
        info!("Error monitor started");
        Ok(())
    }

    /// Stop the loop
    pub async fn stop(&self) -> Result<()> {
        let stopped = {
            let mut guard = self.lifecycle.lock();
            guard.take()
        };
        let Some((token, handle)) = stopped else {
            return Err(ResilienceError::NotFound(
                "error monitor is not running".to_string(),
            ));
        };

        token.cancel();
        let _ = handle.await;
        info!("Error monitor stopped");
        Ok(())
    }

    async fn dispatch_alerts(&self) {
        let alerts = self.check_alerts();
        if alerts.is_empty() {
            return;
        }

        let handlers = self.handlers.read().clone();
        for alert in &alerts {
            for handler in &handlers {
                if let Err(e) = handler.handle_alert(alert).await {
                    warn!(
                        alert_id = %alert.id,
                        handler = %handler.name(),
                        error = %e,
                        "Failed to handle alert"
                    );
                }
            }
        }
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn err(code: ErrorCode) -> PluginError {
        PluginError::new(code, "test failure")
    }

    #[test]
    fn test_record_error_updates_stats() {
        let monitor = ErrorMonitor::new();
        monitor.record_error("netease", &err(ErrorCode::PluginTimeout));
        monitor.record_error("netease", &err(ErrorCode::PluginTimeout));
        monitor.record_error("netease", &err(ErrorCode::PluginConfigInvalid));

        let stats = monitor.error_stats("netease").unwrap();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.errors_by_type.get(&ErrorType::Timeout), Some(&2));
        assert_eq!(stats.errors_by_type.get(&ErrorType::Config), Some(&1));
        assert_eq!(
            stats.first_error.unwrap().code,
            ErrorCode::PluginTimeout
        );
        assert_eq!(
            stats.last_error.unwrap().code,
            ErrorCode::PluginConfigInvalid
        );
    }

    #[test]
    fn test_unknown_unit_has_no_stats() {
        let monitor = ErrorMonitor::new();
        assert!(monitor.error_stats("nobody").is_none());
        assert_eq!(monitor.error_rate("nobody", Duration::from_secs(60)), 0.0);
        assert_eq!(monitor.mttr("nobody"), Duration::ZERO);
        assert_eq!(monitor.mtbf("nobody"), Duration::ZERO);
    }

    #[test]
    fn test_error_rate_counts_recent_errors() {
        let monitor = ErrorMonitor::new();
        for _ in 0..6 {
            monitor.record_error("u1", &err(ErrorCode::Unavailable));
        }

        let rate = monitor.error_rate("u1", Duration::from_secs(60));
        assert!((rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_mttr_is_mean_of_recoveries() {
        let monitor = ErrorMonitor::new();
        monitor.record_recovery("u1", Duration::from_secs(10));
        monitor.record_recovery("u1", Duration::from_secs(30));
        assert_eq!(monitor.mttr("u1"), Duration::from_secs(20));
    }

    #[test]
    fn test_mtbf_requires_two_errors() {
        let monitor = ErrorMonitor::new();
        monitor.record_error("u1", &err(ErrorCode::Unavailable));
        assert_eq!(monitor.mtbf("u1"), Duration::ZERO);

        monitor.record_error("u1", &err(ErrorCode::Unavailable));
        // Two errors recorded back to back: span is tiny but defined
        assert!(monitor.mtbf("u1") < Duration::from_secs(1));
    }

    #[test]
    fn test_check_alerts_error_count() {
        let monitor = ErrorMonitor::new();
        monitor.set_alert_threshold(
            "u1",
            AlertThreshold {
                error_count: 2,
                severity_level: ErrorSeverity::Critical,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            monitor.record_error("u1", &err(ErrorCode::Unavailable));
        }

        let alerts = monitor.check_alerts();
        assert!(alerts
            .iter()
            .any(|a| a.kind == ThresholdKind::ErrorCount && a.unit_id == "u1"));
    }

    #[test]
    fn test_check_alerts_severity() {
        let monitor = ErrorMonitor::new();
        monitor.set_alert_threshold(
            "u1",
            AlertThreshold {
                severity_level: ErrorSeverity::Critical,
                ..Default::default()
            },
        );

        monitor.record_error("u1", &err(ErrorCode::PluginTimeout));
        assert!(monitor.check_alerts().is_empty());

        monitor.record_error("u1", &err(ErrorCode::PluginCrashed));
        let alerts = monitor.check_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, ThresholdKind::Severity);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_disabled_threshold_is_ignored() {
        let monitor = ErrorMonitor::new();
        monitor.set_alert_threshold(
            "u1",
            AlertThreshold {
                error_count: 1,
                enabled: false,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            monitor.record_error("u1", &err(ErrorCode::Unavailable));
        }
        assert!(monitor.check_alerts().is_empty());
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AlertHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle_alert(&self, _alert: &ThresholdAlert) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_monitor_loop_dispatches_to_handlers() {
        let monitor = Arc::new(ErrorMonitor::new().with_check_interval(Duration::from_millis(20)));
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        monitor.register_alert_handler(handler.clone());
        monitor.set_alert_threshold(
            "u1",
            AlertThreshold {
                error_count: 1,
                severity_level: ErrorSeverity::Critical,
                ..Default::default()
            },
        );
        monitor.record_error("u1", &err(ErrorCode::Unavailable));
        monitor.record_error("u1", &err(ErrorCode::Unavailable));

        monitor.start().unwrap();
        assert!(monitor.start().is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.stop().await.unwrap();
        assert!(monitor.stop().await.is_err());

        assert!(handler.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_log_alert_handler() {
        let handler = LogAlertHandler::new("log");
        assert_eq!(handler.name(), "log");
        let alert = ThresholdAlert {
            id: "a1".to_string(),
            kind: ThresholdKind::ErrorCount,
            unit_id: "u1".to_string(),
            message: "count exceeded".to_string(),
            severity: AlertSeverity::High,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        };
        handler.handle_alert(&alert).await.unwrap();
    }
}
