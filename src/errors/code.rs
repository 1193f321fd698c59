//! Error taxonomy: codes, types and severities.
//!
//! Every [`ErrorCode`] carries a static default [`ErrorType`] and
//! [`ErrorSeverity`], plus a default retryability decision. Per-instance
//! overrides are possible on [`super::PluginError`], but the code itself is
//! immutable after construction.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Enumerated error codes for all failures surfaced by plugins
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Generic
    Unknown,
    Internal,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    Cancelled,

    // Plugin lifecycle
    PluginNotFound,
    PluginAlreadyLoaded,
    PluginInitFailed,
    PluginConfigInvalid,
    PluginDependencyMissing,
    PluginVersionMismatch,

    // Plugin runtime
    PluginTimeout,
    PluginCrashed,
    PluginMemoryLimit,
    PluginCpuLimit,
    PluginIoError,
    PluginNetworkError,
    PluginResourceLimit,
    PluginDataLoss,

    // Audio subsystem
    AudioDeviceError,
    AudioFormatError,
    AudioStreamError,

    // Music source
    MusicSourceUnavailable,
    MusicSourceAuthFailed,
    MusicSourceRateLimit,
    MusicSourceContentError,

    // Third-party services
    ThirdPartyServiceDown,
    ThirdPartyRateLimit,
    ThirdPartyAuthError,

    // UI
    UiRenderError,
    UiResourceNotFound,
}

/// Broad classification of an error, derived from its code
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Unknown,
    Validation,
    NotFound,
    Conflict,
    Permission,
    Auth,
    Resource,
    Availability,
    Timeout,
    Cancelled,
    Lifecycle,
    Config,
    Dependency,
    Runtime,
    Audio,
    MusicSource,
    ThirdParty,
    Ui,
    Internal,
}

/// Severity levels, totally ordered from Trace to Critical
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Critical,
}

impl ErrorCode {
    /// Default error type implied by this code
    pub fn error_type(&self) -> ErrorType {
        match self {
            ErrorCode::Unknown => ErrorType::Unknown,
            ErrorCode::Internal => ErrorType::Internal,
            ErrorCode::InvalidArgument => ErrorType::Validation,
            ErrorCode::NotFound => ErrorType::NotFound,
            ErrorCode::AlreadyExists => ErrorType::Conflict,
            ErrorCode::PermissionDenied => ErrorType::Permission,
            ErrorCode::Unauthenticated => ErrorType::Auth,
            ErrorCode::ResourceExhausted => ErrorType::Resource,
            ErrorCode::Unavailable => ErrorType::Availability,
            ErrorCode::DeadlineExceeded => ErrorType::Timeout,
            ErrorCode::Cancelled => ErrorType::Cancelled,

            ErrorCode::PluginNotFound
            | ErrorCode::PluginAlreadyLoaded
            | ErrorCode::PluginInitFailed
            | ErrorCode::PluginVersionMismatch => ErrorType::Lifecycle,
            ErrorCode::PluginConfigInvalid => ErrorType::Config,
            ErrorCode::PluginDependencyMissing => ErrorType::Dependency,

            ErrorCode::PluginTimeout => ErrorType::Timeout,
            ErrorCode::PluginCrashed
            | ErrorCode::PluginMemoryLimit
            | ErrorCode::PluginCpuLimit
            | ErrorCode::PluginIoError
            | ErrorCode::PluginNetworkError
            | ErrorCode::PluginResourceLimit
            | ErrorCode::PluginDataLoss => ErrorType::Runtime,

            ErrorCode::AudioDeviceError
            | ErrorCode::AudioFormatError
            | ErrorCode::AudioStreamError => ErrorType::Audio,

            ErrorCode::MusicSourceUnavailable
            | ErrorCode::MusicSourceAuthFailed
            | ErrorCode::MusicSourceRateLimit
            | ErrorCode::MusicSourceContentError => ErrorType::MusicSource,

            ErrorCode::ThirdPartyServiceDown
            | ErrorCode::ThirdPartyRateLimit
            | ErrorCode::ThirdPartyAuthError => ErrorType::ThirdParty,

            ErrorCode::UiRenderError | ErrorCode::UiResourceNotFound => ErrorType::Ui,
        }
    }

    /// Default severity implied by this code
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorCode::PluginCrashed | ErrorCode::PluginDataLoss => ErrorSeverity::Critical,
            ErrorCode::Internal | ErrorCode::PluginInitFailed => ErrorSeverity::Fatal,
            ErrorCode::PluginTimeout | ErrorCode::Unavailable | ErrorCode::ResourceExhausted => {
                ErrorSeverity::Error
            }
            ErrorCode::PluginConfigInvalid | ErrorCode::InvalidArgument => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Whether errors with this code are retryable by default.
    ///
    /// An explicit allow list; everything else defaults to non-retryable and
    /// may be overridden per instance or per retry policy.
    pub fn is_retryable_default(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::ResourceExhausted
                | ErrorCode::PluginTimeout
                | ErrorCode::PluginNetworkError
                | ErrorCode::MusicSourceRateLimit
                | ErrorCode::ThirdPartyServiceDown
                | ErrorCode::ThirdPartyRateLimit
        )
    }
}

impl ErrorSeverity {
    /// Numeric value for metrics gauges
    pub fn to_metric_value(&self) -> f64 {
        *self as u8 as f64
    }
}
