//! Resilience control plane for dynamically managed plugins.
//!
//! Protects a host application from plugin failures with a set of cooperating
//! components: an error taxonomy and hybrid classifier, circuit breakers,
//! retry with backoff, fallbacks with a TTL cache, priority-ordered recovery
//! strategies behind a bounded-concurrency manager, an auto-recovery health
//! loop, an error monitor with threshold alerting, a rule-driven alert
//! manager, and a middleware chain tying the cross-cutting pieces together.
//!
//! [`engine::ResilienceEngine`] assembles everything from a validated
//! [`config::ResilienceConfig`]; individual components can also be used on
//! their own.

pub mod alerts;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod monitor;
pub mod recovery;
pub mod retry;
pub mod scope;

pub use crate::config::ResilienceConfig;
pub use crate::engine::{EngineBuilder, ResilienceEngine};
pub use crate::error::{ResilienceError, Result};
pub use crate::errors::{ErrorCode, ErrorSeverity, ErrorType, PluginError};
pub use crate::scope::{CancellationToken, Scope};
