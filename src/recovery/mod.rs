//! Recovery of failed units: strategies, bounded-concurrency execution, and
//! the automatic health-check loop.

pub mod auto;
pub mod manager;
pub mod strategies;

pub use auto::{
    AutoRecoveryConfig, AutoRecoveryManager, AutoRecoveryStats, HealthCheckResult, HealthChecker,
    HealthStatus, PluginHealthState, RecoveryAction, RecoveryAttempt,
};
pub use manager::{RecoveryEvent, RecoveryManager, RecoveryManagerConfig, RecoveryManagerStats};
pub use strategies::{
    FallbackStrategy, GracefulDegradeStrategy, RecoveryStrategy, RecoveryType, ReloadStrategy,
    RestartStrategy, UnitController,
};
