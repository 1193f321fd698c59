//! Alternate-path execution when a primary operation fails.
//!
//! A [`FallbackExecutor`] bounds the primary operation by a timeout and, on
//! failure, produces a result from the configured [`FallbackKind`]: a cached
//! value, a static default, a degraded-feature marker, or a caller-supplied
//! function. Cache reads treat expired entries as misses and evict them; a
//! periodic sweep removes expired entries in the background.

use crate::errors::{ErrorCode, PluginError};
use crate::scope::Scope;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Kind of fallback behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    #[default]
    Cache,
    Default,
    Feature,
    Custom,
}

/// Configuration for a fallback executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub kind: FallbackKind,
    /// Bound on the primary operation
    pub timeout: Duration,
    /// Lifetime of cached results
    pub cache_expiry: Duration,
    /// Interval of the background expired-entry sweep
    pub cleanup_interval: Duration,
    /// Value returned by [`FallbackKind::Default`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            kind: FallbackKind::Cache,
            timeout: Duration::from_secs(10),
            cache_expiry: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            default_value: None,
        }
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<(), crate::error::ResilienceError> {
        if self.timeout.is_zero() {
            return Err(crate::error::ResilienceError::Validation(
                "fallback timeout must be greater than 0".to_string(),
            ));
        }
        if self.cache_expiry.is_zero() {
            return Err(crate::error::ResilienceError::Validation(
                "cache_expiry must be greater than 0".to_string(),
            ));
        }
        if self.kind == FallbackKind::Default && self.default_value.is_none() {
            return Err(crate::error::ResilienceError::Validation(
                "default fallback requires a default_value".to_string(),
            ));
        }
        Ok(())
    }
}

/// A cached fallback value with its absolute expiry
#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Counters exposed by a fallback executor
#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackStats {
    pub primary_successes: u64,
    pub fallback_successes: u64,
    pub fallback_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
    pub cache_hit_rate: f64,
}

type CustomFallbackFn =
    Arc<dyn Fn(&str, &PluginError) -> Result<serde_json::Value, PluginError> + Send + Sync>;

/// Executes a primary operation with a configured alternate path
pub struct FallbackExecutor {
    name: String,
    config: FallbackConfig,
    cache: Arc<DashMap<String, CacheEntry>>,
    custom: Option<CustomFallbackFn>,
    primary_successes: AtomicU64,
    fallback_successes: AtomicU64,
    fallback_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    sweep_stop: parking_lot::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl FallbackExecutor {
    pub fn new(name: impl Into<String>, config: FallbackConfig) -> Self {
        Self {
            name: name.into(),
            config,
            cache: Arc::new(DashMap::new()),
            custom: None,
            primary_successes: AtomicU64::new(0),
            fallback_successes: AtomicU64::new(0),
            fallback_failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            sweep_stop: parking_lot::Mutex::new(None),
        }
    }

    /// Register the function used by [`FallbackKind::Custom`]
    pub fn with_custom<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &PluginError) -> Result<serde_json::Value, PluginError>
            + Send
            + Sync
            + 'static,
    {
        self.custom = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Run the primary operation, falling back on failure.
    ///
    /// On primary success the result is cached under `key` when the kind is
    /// [`FallbackKind::Cache`].
    pub async fn execute<F, Fut>(
        &self,
        scope: &Scope,
        key: &str,
        primary: F,
    ) -> Result<serde_json::Value, PluginError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, PluginError>>,
    {
        let bounded = scope.child_with_timeout(self.config.timeout);
        let primary_result = match bounded.bound(primary()).await {
            Ok(inner) => inner,
            Err(scope_err) => Err(PluginError::new(
                ErrorCode::PluginTimeout,
                format!("primary operation did not complete: {}", scope_err),
            )),
        };

        match primary_result {
            Ok(value) => {
                self.primary_successes.fetch_add(1, Ordering::Relaxed);
                if self.config.kind == FallbackKind::Cache {
                    self.store(key, value.clone());
                }
                Ok(value)
            }
            Err(err) => {
                debug!(
                    name = %self.name,
                    key = %key,
                    error = %err,
                    kind = %self.config.kind,
                    "Primary operation failed, attempting fallback"
                );
                match self.dispatch_fallback(key, &err) {
                    Ok(value) => {
                        self.fallback_successes.fetch_add(1, Ordering::Relaxed);
                        Ok(value)
                    }
                    Err(fb_err) => {
                        self.fallback_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            name = %self.name,
                            key = %key,
                            error = %fb_err,
                            "Fallback failed"
                        );
                        Err(fb_err)
                    }
                }
            }
        }
    }

    fn dispatch_fallback(
        &self,
        key: &str,
        primary_err: &PluginError,
    ) -> Result<serde_json::Value, PluginError> {
        match self.config.kind {
            FallbackKind::Default => self.config.default_value.clone().ok_or_else(|| {
                PluginError::new(
                    ErrorCode::PluginConfigInvalid,
                    "default fallback has no configured value",
                )
            }),
            FallbackKind::Cache => self.lookup(key).ok_or_else(|| {
                PluginError::new(
                    ErrorCode::NotFound,
                    format!("no cached value for key '{}'", key),
                )
            }),
            FallbackKind::Feature => Ok(json!({
                "status": "degraded",
                "key": key,
                "reason": primary_err.message(),
            })),
            FallbackKind::Custom => match &self.custom {
                Some(f) => f(key, primary_err),
                None => Err(PluginError::new(
                    ErrorCode::PluginConfigInvalid,
                    "custom fallback has no registered function",
                )),
            },
        }
    }

    /// Store a value under `key` with the configured expiry
    pub fn store(&self, key: &str, value: serde_json::Value) {
        let ttl = ChronoDuration::from_std(self.config.cache_expiry)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        self.cache.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Utc::now() + ttl,
            },
        );
    }

    /// Cached value for `key`; an expired entry counts as a miss and is
    /// evicted
    pub fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        let expired = match self.cache.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.cache.remove(key);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Remove all expired cache entries
    pub fn sweep_expired(&self) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, entry| !entry.is_expired());
        let removed = before - self.cache.len();
        if removed > 0 {
            debug!(name = %self.name, removed, "Swept expired fallback cache entries");
        }
        removed
    }

    /// Start the periodic expired-entry sweep
    pub fn start_cache_sweep(self: &Arc<Self>) {
        let mut guard = self.sweep_stop.lock();
        if guard.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let executor = Arc::clone(self);
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        executor.sweep_expired();
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *guard = Some((tx, handle));
        info!(name = %self.name, "Fallback cache sweep started");
    }

    /// Stop the periodic sweep
    pub async fn stop_cache_sweep(&self) {
        let stopped = {
            let mut guard = self.sweep_stop.lock();
            guard.take()
        };
        if let Some((tx, handle)) = stopped {
            let _ = tx.send(true);
            let _ = handle.await;
            info!(name = %self.name, "Fallback cache sweep stopped");
        }
    }

    /// Current counters
    pub fn stats(&self) -> FallbackStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        FallbackStats {
            primary_successes: self.primary_successes.load(Ordering::Relaxed),
            fallback_successes: self.fallback_successes.load(Ordering::Relaxed),
            fallback_failures: self.fallback_failures.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_size: self.cache.len(),
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_config(expiry: Duration) -> FallbackConfig {
        FallbackConfig {
            kind: FallbackKind::Cache,
            cache_expiry: expiry,
            ..Default::default()
        }
    }

    fn fail() -> Result<serde_json::Value, PluginError> {
        Err(PluginError::new(ErrorCode::Unavailable, "primary down"))
    }

    #[tokio::test]
    async fn test_primary_success_populates_cache() {
        let executor = FallbackExecutor::new("search", cache_config(Duration::from_secs(60)));
        let scope = Scope::background();

        let result = executor
            .execute(&scope, "query:jazz", || async { Ok(json!({"hits": 3})) })
            .await;
        assert_eq!(result.unwrap(), json!({"hits": 3}));

        // Primary now fails, cached value is served
        let result = executor.execute(&scope, "query:jazz", || async { fail() }).await;
        assert_eq!(result.unwrap(), json!({"hits": 3}));

        let stats = executor.stats();
        assert_eq!(stats.primary_successes, 1);
        assert_eq!(stats.fallback_successes, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_cache_miss_reports_failure() {
        let executor = FallbackExecutor::new("search", cache_config(Duration::from_secs(60)));
        let scope = Scope::background();

        let result = executor.execute(&scope, "unseen", || async { fail() }).await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(executor.stats().fallback_failures, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_read_is_miss_and_evicts() {
        let executor = FallbackExecutor::new("search", cache_config(Duration::from_millis(30)));
        executor.store("k", json!(1));
        assert_eq!(executor.lookup("k"), Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.lookup("k"), None);
        assert_eq!(executor.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_default_fallback() {
        let config = FallbackConfig {
            kind: FallbackKind::Default,
            default_value: Some(json!("offline")),
            ..Default::default()
        };
        let executor = FallbackExecutor::new("status", config);
        let scope = Scope::background();

        let result = executor.execute(&scope, "any", || async { fail() }).await;
        assert_eq!(result.unwrap(), json!("offline"));
    }

    #[tokio::test]
    async fn test_feature_fallback_degraded_marker() {
        let config = FallbackConfig {
            kind: FallbackKind::Feature,
            ..Default::default()
        };
        let executor = FallbackExecutor::new("lyrics", config);
        let scope = Scope::background();

        let result = executor.execute(&scope, "track:1", || async { fail() }).await;
        let value = result.unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["key"], "track:1");
    }

    #[tokio::test]
    async fn test_custom_fallback() {
        let config = FallbackConfig {
            kind: FallbackKind::Custom,
            ..Default::default()
        };
        let executor = FallbackExecutor::new("custom", config)
            .with_custom(|key, _err| Ok(json!(format!("fallback:{}", key))));
        let scope = Scope::background();

        let result = executor.execute(&scope, "abc", || async { fail() }).await;
        assert_eq!(result.unwrap(), json!("fallback:abc"));
    }

    #[tokio::test]
    async fn test_primary_timeout_triggers_fallback() {
        let config = FallbackConfig {
            kind: FallbackKind::Feature,
            timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let executor = FallbackExecutor::new("slow", config);
        let scope = Scope::background();

        let result = executor
            .execute(&scope, "k", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(1))
            })
            .await;
        assert_eq!(result.unwrap()["status"], "degraded");
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let executor = FallbackExecutor::new("sweep", cache_config(Duration::from_millis(20)));
        executor.store("a", json!(1));
        executor.store("b", json!(2));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = executor.sweep_expired();
        assert_eq!(removed, 2);
        assert_eq!(executor.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_background_sweep_lifecycle() {
        let config = FallbackConfig {
            kind: FallbackKind::Cache,
            cache_expiry: Duration::from_millis(10),
            cleanup_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let executor = Arc::new(FallbackExecutor::new("bg", config));
        executor.store("a", json!(1));

        executor.start_cache_sweep();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(executor.stats().cache_size, 0);

        executor.stop_cache_sweep().await;
    }

    #[test]
    fn test_config_validation() {
        let config = FallbackConfig {
            kind: FallbackKind::Default,
            default_value: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FallbackConfig::default();
        assert!(config.validate().is_ok());
    }
}
