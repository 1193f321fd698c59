//! Structured error logging on top of `tracing`.
//!
//! [`ErrorLogger`] applies registered filters, enrichers and formatters to a
//! [`PluginError`] before emitting it at the level mapped from its severity.
//! Filtering happens before any field assembly, so suppressed errors cost
//! almost nothing.

use crate::errors::{ErrorCode, ErrorSeverity, PluginError};
use crate::scope::Scope;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Decides whether an error should be logged at all
pub trait ErrorFilter: Send + Sync {
    fn name(&self) -> &str;
    fn should_log(&self, error: &PluginError, unit_id: &str) -> bool;
}

/// Contributes extra fields to a log record
pub trait ErrorEnricher: Send + Sync {
    fn name(&self) -> &str;
    fn enrich(
        &self,
        scope: &Scope,
        error: &PluginError,
        unit_id: &str,
    ) -> HashMap<String, serde_json::Value>;
}

/// Renders an error into additional derived fields
pub trait ErrorFormatter: Send + Sync {
    fn name(&self) -> &str;
    fn format(&self, error: &PluginError, unit_id: &str) -> HashMap<String, serde_json::Value>;
}

/// Severity- and code-based filter.
///
/// An empty allow list admits every code; the deny list always wins.
pub struct SeverityFilter {
    name: String,
    min_severity: ErrorSeverity,
    allowed_codes: HashSet<ErrorCode>,
    denied_codes: HashSet<ErrorCode>,
    denied_units: HashSet<String>,
}

impl SeverityFilter {
    pub fn new(name: impl Into<String>, min_severity: ErrorSeverity) -> Self {
        Self {
            name: name.into(),
            min_severity,
            allowed_codes: HashSet::new(),
            denied_codes: HashSet::new(),
            denied_units: HashSet::new(),
        }
    }

    pub fn allow_code(mut self, code: ErrorCode) -> Self {
        self.allowed_codes.insert(code);
        self
    }

    pub fn deny_code(mut self, code: ErrorCode) -> Self {
        self.denied_codes.insert(code);
        self
    }

    pub fn deny_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.denied_units.insert(unit_id.into());
        self
    }
}

impl ErrorFilter for SeverityFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_log(&self, error: &PluginError, unit_id: &str) -> bool {
        if error.severity() < self.min_severity {
            return false;
        }
        if self.denied_codes.contains(&error.code()) {
            return false;
        }
        if !self.allowed_codes.is_empty() && !self.allowed_codes.contains(&error.code()) {
            return false;
        }
        !self.denied_units.contains(unit_id)
    }
}

/// Custom predicate filter
pub struct PredicateFilter {
    name: String,
    predicate: Box<dyn Fn(&PluginError, &str) -> bool + Send + Sync>,
}

impl PredicateFilter {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&PluginError, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }
}

impl ErrorFilter for PredicateFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_log(&self, error: &PluginError, unit_id: &str) -> bool {
        (self.predicate)(error, unit_id)
    }
}

/// Adds process identity and scope state to every record
pub struct ProcessEnricher;

impl ErrorEnricher for ProcessEnricher {
    fn name(&self) -> &str {
        "process"
    }

    fn enrich(
        &self,
        scope: &Scope,
        _error: &PluginError,
        _unit_id: &str,
    ) -> HashMap<String, serde_json::Value> {
        let mut fields = HashMap::new();
        fields.insert("pid".to_string(), serde_json::json!(std::process::id()));
        fields.insert(
            "scope_cancelled".to_string(),
            serde_json::json!(scope.is_cancelled()),
        );
        fields
    }
}

/// Serializes the full error as one JSON field
pub struct JsonFormatter;

impl ErrorFormatter for JsonFormatter {
    fn name(&self) -> &str {
        "json"
    }

    fn format(&self, error: &PluginError, _unit_id: &str) -> HashMap<String, serde_json::Value> {
        let mut fields = HashMap::new();
        if let Ok(rendered) = serde_json::to_string(error) {
            fields.insert("error_json".to_string(), serde_json::json!(rendered));
        }
        fields
    }
}

/// Filtered, enriched error logger
pub struct ErrorLogger {
    min_severity: RwLock<ErrorSeverity>,
    filters: RwLock<Vec<Arc<dyn ErrorFilter>>>,
    enrichers: RwLock<Vec<Arc<dyn ErrorEnricher>>>,
    formatters: RwLock<HashMap<String, Arc<dyn ErrorFormatter>>>,
}

impl ErrorLogger {
    pub fn new(min_severity: ErrorSeverity) -> Self {
        Self {
            min_severity: RwLock::new(min_severity),
            filters: RwLock::new(Vec::new()),
            enrichers: RwLock::new(Vec::new()),
            formatters: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_min_severity(&self, severity: ErrorSeverity) {
        *self.min_severity.write() = severity;
    }

    pub fn min_severity(&self) -> ErrorSeverity {
        *self.min_severity.read()
    }

    pub fn add_filter(&self, filter: Arc<dyn ErrorFilter>) {
        self.filters.write().push(filter);
    }

    pub fn remove_filter(&self, name: &str) {
        self.filters.write().retain(|f| f.name() != name);
    }

    pub fn add_enricher(&self, enricher: Arc<dyn ErrorEnricher>) {
        self.enrichers.write().push(enricher);
    }

    pub fn remove_enricher(&self, name: &str) {
        self.enrichers.write().retain(|e| e.name() != name);
    }

    pub fn add_formatter(&self, formatter: Arc<dyn ErrorFormatter>) {
        self.formatters
            .write()
            .insert(formatter.name().to_string(), formatter);
    }

    pub fn remove_formatter(&self, name: &str) {
        self.formatters.write().remove(name);
    }

    /// Log an error for a unit at its severity-mapped level
    pub fn log_error(&self, scope: &Scope, error: &PluginError, unit_id: &str) {
        self.log_error_with(scope, error, unit_id, HashMap::new());
    }

    /// Like [`log_error`](Self::log_error) with caller-supplied extra fields
    pub fn log_error_with(
        &self,
        scope: &Scope,
        error: &PluginError,
        unit_id: &str,
        extra: HashMap<String, serde_json::Value>,
    ) {
        let Some(fields) = self.render(scope, error, unit_id, extra) else {
            return;
        };
        self.emit(error, unit_id, &fields);
    }

    /// Assemble the field map, or `None` if the error is filtered out
    fn render(
        &self,
        scope: &Scope,
        error: &PluginError,
        unit_id: &str,
        extra: HashMap<String, serde_json::Value>,
    ) -> Option<HashMap<String, serde_json::Value>> {
        if error.severity() < *self.min_severity.read() {
            return None;
        }
        for filter in self.filters.read().iter() {
            if !filter.should_log(error, unit_id) {
                return None;
            }
        }

        let mut fields: HashMap<String, serde_json::Value> = HashMap::from([
            ("unit_id".to_string(), serde_json::json!(unit_id)),
            (
                "error_code".to_string(),
                serde_json::json!(error.code().to_string()),
            ),
            (
                "error_type".to_string(),
                serde_json::json!(error.error_type().to_string()),
            ),
            (
                "severity".to_string(),
                serde_json::json!(error.severity().to_string()),
            ),
            (
                "timestamp".to_string(),
                serde_json::json!(error.created_at().to_rfc3339()),
            ),
            ("retryable".to_string(), serde_json::json!(error.retryable())),
        ]);

        let context = error.context();
        if !context.is_empty() {
            fields.insert("error_context".to_string(), serde_json::json!(context));
        }
        if let Some(retry_after) = error.retry_after() {
            fields.insert(
                "retry_after_ms".to_string(),
                serde_json::json!(retry_after.as_millis() as u64),
            );
        }
        if let Some(stack) = error.stack_trace() {
            fields.insert("stack_trace".to_string(), serde_json::json!(stack));
        }
        if let Some(cause) = error.cause() {
            fields.insert("cause".to_string(), serde_json::json!(cause.to_string()));
        }

        for enricher in self.enrichers.read().iter() {
            fields.extend(enricher.enrich(scope, error, unit_id));
        }
        fields.extend(extra);
        for formatter in self.formatters.read().values() {
            fields.extend(formatter.format(error, unit_id));
        }

        Some(fields)
    }

    fn emit(&self, error: &PluginError, unit_id: &str, fields: &HashMap<String, serde_json::Value>) {
        let message = error.message();
        match error.severity() {
            ErrorSeverity::Trace => {
                trace!(unit_id = %unit_id, fields = ?fields, "{}", message)
            }
            ErrorSeverity::Debug => {
                debug!(unit_id = %unit_id, fields = ?fields, "{}", message)
            }
            ErrorSeverity::Info => {
                info!(unit_id = %unit_id, fields = ?fields, "{}", message)
            }
            ErrorSeverity::Warning => {
                warn!(unit_id = %unit_id, fields = ?fields, "{}", message)
            }
            ErrorSeverity::Error | ErrorSeverity::Fatal | ErrorSeverity::Critical => {
                error!(unit_id = %unit_id, fields = ?fields, "{}", message)
            }
        }
    }
}

impl Default for ErrorLogger {
    fn default() -> Self {
        Self::new(ErrorSeverity::Trace)
    }
}
