//! Canonical plugin error representation.

use crate::errors::{ErrorCode, ErrorSeverity, ErrorType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Capability view over a failure value.
///
/// The resilience pipeline works with [`PluginError`] directly; foreign error
/// types are adapted through [`PluginError::from_foreign`], which consults
/// this trait's heuristics. Implement it on custom error types to feed the
/// pipeline richer signals than the message-based defaults.
pub trait FailureInsight {
    /// Taxonomy code, if the failure exposes one
    fn error_code(&self) -> Option<ErrorCode>;

    /// Severity, if the failure exposes one
    fn failure_severity(&self) -> Option<ErrorSeverity>;

    /// Whether retrying the failed operation may succeed
    fn is_retryable(&self) -> bool;

    /// Whether the failure looks transient
    fn is_temporary(&self) -> bool;
}

/// Canonical error value flowing through classification, monitoring,
/// alerting and recovery.
///
/// The code is fixed at construction; type and severity default from the
/// code's static derivation and may be overridden per instance.
#[derive(Debug, Clone, Serialize)]
pub struct PluginError {
    code: ErrorCode,
    error_type: ErrorType,
    severity: ErrorSeverity,
    message: String,
    #[serde(skip)]
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    /// Lazily allocated: most errors never carry context
    context: Option<HashMap<String, serde_json::Value>>,
    created_at: DateTime<Utc>,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_trace: Option<String>,
}

impl PluginError {
    /// Create an error with defaults derived from the code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error_type: code.error_type(),
            severity: code.severity(),
            message: message.into(),
            cause: None,
            context: None,
            created_at: Utc::now(),
            retryable: code.is_retryable_default(),
            retry_after: None,
            stack_trace: None,
        }
    }

    /// Wrap an opaque error from outside the plugin error model.
    ///
    /// The code is `Unknown`; retryability falls back to a keyword heuristic
    /// over the message (timeout / temporar / unavailable / connection).
    pub fn from_foreign<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = err.to_string();
        let temporary = message_looks_temporary(&message);
        let mut plugin_err = Self::new(ErrorCode::Unknown, message);
        plugin_err.retryable = temporary;
        plugin_err.cause = Some(Arc::new(err));
        plugin_err
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    /// Context value by key, if any context has been attached
    pub fn context_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.as_ref().and_then(|ctx| ctx.get(key))
    }

    /// Full context map (empty if never populated)
    pub fn context(&self) -> HashMap<String, serde_json::Value> {
        self.context.clone().unwrap_or_default()
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Attach a context entry in place (used by enrichment middleware)
    pub fn add_context(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    }

    /// Capture a stack trace in place if none is present
    pub fn capture_stack_trace(&mut self) {
        if self.stack_trace.is_none() {
            self.stack_trace = Some(std::backtrace::Backtrace::force_capture().to_string());
        }
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {} (caused by: {})", self.code, self.message, cause),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for PluginError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl FailureInsight for PluginError {
    fn error_code(&self) -> Option<ErrorCode> {
        Some(self.code)
    }

    fn failure_severity(&self) -> Option<ErrorSeverity> {
        Some(self.severity)
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn is_temporary(&self) -> bool {
        self.retryable
            || self.error_type == ErrorType::Timeout
            || message_looks_temporary(&self.message)
    }
}

/// Whether an error is transient enough to retry blindly
pub fn is_temporary(err: &PluginError) -> bool {
    FailureInsight::is_temporary(err)
}

/// Whether an error represents a timeout
pub fn is_timeout(err: &PluginError) -> bool {
    err.error_type() == ErrorType::Timeout || err.code() == ErrorCode::DeadlineExceeded
}

fn message_looks_temporary(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timeout", "temporar", "unavailable", "connection"]
        .iter()
        .any(|kw| lower.contains(kw))
}
