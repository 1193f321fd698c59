use thiserror::Error;

/// Top-level error type for the resilience control plane
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Recovery failed: {0}")]
    Recovery(String),

    #[error("Alert error: {0}")]
    Alert(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResilienceError {
    /// Machine-readable error code for logs and events
    pub fn error_code(&self) -> &'static str {
        match self {
            ResilienceError::Configuration(_) => "CONFIGURATION",
            ResilienceError::NotFound(_) => "NOT_FOUND",
            ResilienceError::AlreadyExists(_) => "ALREADY_EXISTS",
            ResilienceError::Validation(_) => "VALIDATION",
            ResilienceError::Timeout(_) => "TIMEOUT",
            ResilienceError::Cancelled(_) => "CANCELLED",
            ResilienceError::Recovery(_) => "RECOVERY",
            ResilienceError::Alert(_) => "ALERT",
            ResilienceError::Serialization(_) => "SERIALIZATION",
            ResilienceError::Internal(_) => "INTERNAL",
        }
    }
}

/// Result type alias using ResilienceError
pub type Result<T> = std::result::Result<T, ResilienceError>;
