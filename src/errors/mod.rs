//! Canonical plugin error model: taxonomy codes, severities and the
//! [`PluginError`] value that flows through the resilience pipeline.

mod code;
mod model;

pub use code::{ErrorCode, ErrorSeverity, ErrorType};
pub use model::{is_temporary, is_timeout, FailureInsight, PluginError};
