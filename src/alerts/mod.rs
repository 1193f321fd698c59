//! Rule-driven alerting with asynchronous actions.
//!
//! Rules are registered up front; `trigger_alert` instantiates an alert from
//! a rule and runs the rule's actions (log, webhook, custom handler) on a
//! detached task so the caller is never blocked. Resolved alerts are purged
//! after a retention period by the background cleanup loop.

use crate::error::{ResilienceError, Result};
use crate::metrics::SharedMetrics;
use crate::monitor::AlertSeverity;
use crate::scope::CancellationToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const ACTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Kind of action run when an alert fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertActionKind {
    Log,
    Webhook,
    Custom,
}

/// One action attached to an alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertAction {
    pub kind: AlertActionKind,
    /// Webhook URL or custom handler name
    pub target: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub enabled: bool,
}

/// Declarative alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub condition: String,
    pub threshold: f64,
    pub duration: Duration,
    pub severity: AlertSeverity,
    pub enabled: bool,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// A fired alert instance
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub unit_id: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Aggregate alert-manager statistics
#[derive(Debug, Clone, Serialize)]
pub struct AlertManagerStats {
    pub total_rules: usize,
    pub active_rules: usize,
    pub total_alerts: usize,
    pub active_alerts: usize,
    pub resolved_alerts: usize,
    pub alerts_by_severity: HashMap<String, usize>,
    pub last_alert: Option<Alert>,
    pub updated_at: DateTime<Utc>,
}

/// Custom handler invoked by [`AlertActionKind::Custom`] actions
#[async_trait]
pub trait AlertActionHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, alert: &Alert) -> Result<()>;
}

/// Alert rules, live alerts, and action dispatch
pub struct SmartAlertManager {
    rules: DashMap<String, AlertRule>,
    alerts: DashMap<String, Alert>,
    handlers: DashMap<String, Arc<dyn AlertActionHandler>>,
    http: reqwest::Client,
    metrics: Option<SharedMetrics>,
    check_interval: Duration,
    retention: Duration,
    lifecycle: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SmartAlertManager {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            alerts: DashMap::new(),
            handlers: DashMap::new(),
            http: reqwest::Client::new(),
            metrics: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
            retention: DEFAULT_RETENTION,
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

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Register an alert rule
    pub fn register_rule(&self, mut rule: AlertRule) -> Result<()> {
        if rule.id.is_empty() {
            return Err(ResilienceError::Validation(
                "alert rule id cannot be empty".to_string(),
            ));
        }
        if self.rules.contains_key(&rule.id) {
            return Err(ResilienceError::AlreadyExists(format!(
                "alert rule {}",
                rule.id
            )));
        }

        rule.created_at = Utc::now();
        rule.updated_at = Utc::now();
        info!(rule_id = %rule.id, name = %rule.name, "Alert rule registered");

        if let Some(metrics) = &self.metrics {
            let severity = rule.severity.to_string();
            metrics.increment_counter("alert_rules_registered_total", &[("severity", &severity)]);
        }

        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn unregister_rule(&self, rule_id: &str) -> Result<()> {
        self.rules
            .remove(rule_id)
            .ok_or_else(|| ResilienceError::NotFound(format!("alert rule {}", rule_id)))?;
        info!(rule_id = %rule_id, "Alert rule unregistered");
        Ok(())
    }

    pub fn rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules.get(rule_id).map(|entry| entry.value().clone())
    }

    /// Fire the rule with the given payload.
    ///
    /// A disabled rule is silently ignored; an unknown rule is an error. The
    /// rule's actions run on a detached task; the returned id identifies the
    /// stored alert.
    pub fn trigger_alert(
        &self,
        rule_id: &str,
        data: HashMap<String, serde_json::Value>,
    ) -> Result<Option<String>> {
        let rule = self
            .rules
            .get(rule_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ResilienceError::NotFound(format!("alert rule {}", rule_id)))?;

        if !rule.enabled {
            return Ok(None);
        }

        let unit_id = data
            .get("unit_id")
            .and_then(|value| value.as_str())
            .unwrap_or("unknown")
            .to_string();
        let alert = Alert {
            id: format!(
                "{}-{}",
                rule_id,
                Utc::now().timestamp_nanos_opt().unwrap_or_default()
            ),
            rule_id: rule_id.to_string(),
            unit_id,
            message: build_alert_message(&rule, &data),
            severity: rule.severity,
            timestamp: Utc::now(),
            metadata: data,
            resolved: false,
            resolved_at: None,
        };

        warn!(
            alert_id = %alert.id,
            rule_id = %rule_id,
            message = %alert.message,
            "Alert triggered"
        );

        if let Some(metrics) = &self.metrics {
            let severity = alert.severity.to_string();
            metrics.increment_counter("alerts_triggered_total", &[("severity", &severity)]);
        }

        let alert_id = alert.id.clone();
        self.alerts.insert(alert.id.clone(), alert.clone());
        self.spawn_actions(alert, rule);
        Ok(Some(alert_id))
    }

    fn spawn_actions(&self, alert: Alert, rule: AlertRule) {
        let http = self.http.clone();
        let handlers: Vec<(String, Arc<dyn AlertActionHandler>)> = rule
            .actions
            .iter()
            .filter(|action| action.enabled && action.kind == AlertActionKind::Custom)
            .filter_map(|action| {
                self.handlers
                    .get(&action.target)
                    .map(|entry| (action.target.clone(), entry.value().clone()))
            })
            .collect();

        tokio::spawn(async move {
            for action in rule.actions.iter().filter(|action| action.enabled) {
                match action.kind {
                    AlertActionKind::Log => {
                        error!(
                            alert_id = %alert.id,
                            message = %alert.message,
                            severity = %alert.severity,
                            "ALERT"
                        );
                    }
                    AlertActionKind::Webhook => {
                        let request = http
                            .post(&action.target)
                            .timeout(ACTION_TIMEOUT)
                            .json(&alert)
                            .send();
                        match request.await {
                            Ok(response) if response.status().is_success() => {}
                            Ok(response) => warn!(
                                alert_id = %alert.id,
                                target = %action.target,
                                status = %response.status(),
                                "Webhook alert action rejected"
                            ),
                            Err(e) => warn!(
                                alert_id = %alert.id,
                                target = %action.target,
                                error = %e,
                                "Webhook alert action failed"
                            ),
                        }
                    }
                    AlertActionKind::Custom => {
                        let Some((name, handler)) = handlers
                            .iter()
                            .find(|(name, _)| *name == action.target)
                        else {
                            warn!(
                                alert_id = %alert.id,
                                target = %action.target,
                                "No handler registered for custom alert action"
                            );
                            continue;
                        };
                        match tokio::time::timeout(ACTION_TIMEOUT, handler.handle(&alert)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(
                                alert_id = %alert.id,
                                handler = %name,
                                error = %e,
                                "Alert handler failed"
                            ),
                            Err(_) => warn!(
                                alert_id = %alert.id,
                                handler = %name,
                                "Alert handler timed out"
                            ),
                        }
                    }
                }
            }
        });
    }

    /// Unresolved alerts, newest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut active: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|entry| !entry.value().resolved)
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        active
    }

    pub fn alert(&self, alert_id: &str) -> Result<Alert> {
        self.alerts
            .get(alert_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ResilienceError::NotFound(format!("alert {}", alert_id)))
    }

    pub fn acknowledge_alert(&self, alert_id: &str, acknowledged_by: &str) -> Result<()> {
        let mut entry = self
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| ResilienceError::NotFound(format!("alert {}", alert_id)))?;
        let alert = entry.value_mut();

        if alert.resolved {
            return Err(ResilienceError::Validation(
                "cannot acknowledge resolved alert".to_string(),
            ));
        }

        alert.metadata.insert(
            "acknowledged_by".to_string(),
            serde_json::json!(acknowledged_by),
        );
        alert.metadata.insert(
            "acknowledged_at".to_string(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
        info!(alert_id = %alert_id, acknowledged_by = %acknowledged_by, "Alert acknowledged");
        Ok(())
    }

    pub fn resolve_alert(&self, alert_id: &str, resolved_by: &str) -> Result<()> {
        let mut entry = self
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| ResilienceError::NotFound(format!("alert {}", alert_id)))?;
        let alert = entry.value_mut();

        if alert.resolved {
            return Err(ResilienceError::Validation(
                "alert already resolved".to_string(),
            ));
        }

        alert.resolved = true;
        alert.resolved_at = Some(Utc::now());
        alert
            .metadata
            .insert("resolved_by".to_string(), serde_json::json!(resolved_by));
        info!(alert_id = %alert_id, resolved_by = %resolved_by, "Alert resolved");

        if let Some(metrics) = &self.metrics {
            let severity = alert.severity.to_string();
            metrics.increment_counter("alerts_resolved_total", &[("severity", &severity)]);
        }
        Ok(())
    }

    pub fn register_handler(&self, handler: Arc<dyn AlertActionHandler>) -> Result<()> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(ResilienceError::AlreadyExists(format!(
                "alert handler {}",
                name
            )));
        }
        info!(handler_name = %name, "Alert handler registered");
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn unregister_handler(&self, name: &str) -> Result<()> {
        self.handlers
            .remove(name)
            .ok_or_else(|| ResilienceError::NotFound(format!("alert handler {}", name)))?;
        info!(handler_name = %name, "Alert handler unregistered");
        Ok(())
    }

    /// Purge resolved alerts older than the retention period
    pub fn cleanup_old_alerts(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let before = self.alerts.len();
        self.alerts.retain(|_, alert| {
            !(alert.resolved && alert.resolved_at.map(|at| at < cutoff).unwrap_or(false))
        });
        before - self.alerts.len()
    }

    /// Start the periodic cleanup loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.lifecycle.lock();
        if guard.is_some() {
            return Err(ResilienceError::AlreadyExists(
                "alert manager already running".to_string(),
            ));
        }

        let token = CancellationToken::new();
        let manager = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.cleanup_old_alerts();
                    }
                    _ = loop_token.cancelled() => break,
                }
            }
        });

        *guard = Some((token, handle));
        info!("Alert manager started");
        Ok(())
    }

    /// Stop the cleanup loop
    pub async fn stop(&self) -> Result<()> {
        let stopped = {
            let mut guard = self.lifecycle.lock();
            guard.take()
        };
        let Some((token, handle)) = stopped else {
            return Err(ResilienceError::Validation(
                "alert manager not running".to_string(),
            ));
        };

        token.cancel();
        let _ = handle.await;
        info!("Alert manager stopped");
        Ok(())
    }

    pub fn stats(&self) -> AlertManagerStats {
        let total_rules = self.rules.len();
        let active_rules = self
            .rules
            .iter()
            .filter(|entry| entry.value().enabled)
            .count();

        let mut active_alerts = 0;
        let mut resolved_alerts = 0;
        let mut by_severity: HashMap<String, usize> = HashMap::new();
        let mut last_alert: Option<Alert> = None;

        for entry in self.alerts.iter() {
            let alert = entry.value();
            if alert.resolved {
                resolved_alerts += 1;
            } else {
                active_alerts += 1;
            }
            *by_severity.entry(alert.severity.to_string()).or_insert(0) += 1;
            if last_alert
                .as_ref()
                .map(|last| alert.timestamp > last.timestamp)
                .unwrap_or(true)
            {
                last_alert = Some(alert.clone());
            }
        }

        AlertManagerStats {
            total_rules,
            active_rules,
            total_alerts: self.alerts.len(),
            active_alerts,
            resolved_alerts,
            alerts_by_severity: by_severity,
            last_alert,
            updated_at: Utc::now(),
        }
    }
}

impl Default for SmartAlertManager {
    fn default() -> Self {
        Self::new()
    }
}

fn build_alert_message(rule: &AlertRule, data: &HashMap<String, serde_json::Value>) -> String {
    let mut message = format!("Alert: {}", rule.name);
    if !rule.description.is_empty() {
        message.push_str(&format!(" - {}", rule.description));
    }
    if let Some(unit_id) = data.get("unit_id").and_then(|value| value.as_str()) {
        message.push_str(&format!(" (unit: {})", unit_id));
    }
    message
}
