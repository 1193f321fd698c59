//! Fallback executor integration tests.

use plugin_resilience::errors::{ErrorCode, PluginError};
use plugin_resilience::fallback::{FallbackConfig, FallbackExecutor, FallbackKind};
use plugin_resilience::scope::Scope;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn cache_config(expiry: Duration) -> FallbackConfig {
    FallbackConfig {
        kind: FallbackKind::Cache,
        cache_expiry: expiry,
        ..FallbackConfig::default()
    }
}

async fn failing_primary() -> Result<serde_json::Value, PluginError> {
    Err(PluginError::new(ErrorCode::MusicSourceUnavailable, "upstream down"))
}

#[tokio::test]
async fn cache_round_trip_within_ttl() {
    let executor = FallbackExecutor::new("tracks", cache_config(Duration::from_secs(60)));
    let scope = Scope::background();

    // Primary success populates the cache
    let value = executor
        .execute(&scope, "track:1", || async { Ok(json!({"title": "song"})) })
        .await
        .unwrap();
    assert_eq!(value["title"], "song");

    // Primary failure now serves the cached value
    let value = executor
        .execute(&scope, "track:1", failing_primary)
        .await
        .unwrap();
    assert_eq!(value["title"], "song");

    let stats = executor.stats();
    assert_eq!(stats.primary_successes, 1);
    assert_eq!(stats.fallback_successes, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn expired_entry_is_a_miss_and_is_evicted() {
    let executor = FallbackExecutor::new("tracks", cache_config(Duration::from_millis(20)));
    let scope = Scope::background();

    executor.store("track:1", json!("cached"));
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Read after the TTL removes the entry
    assert!(executor.lookup("track:1").is_none());
    assert_eq!(executor.stats().cache_size, 0);

    let err = executor
        .execute(&scope, "track:1", failing_primary)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(err.message().contains("no cached value"));
}

#[tokio::test]
async fn default_kind_returns_configured_value() {
    let config = FallbackConfig {
        kind: FallbackKind::Default,
        default_value: Some(json!({"quality": "low"})),
        ..FallbackConfig::default()
    };
    let executor = FallbackExecutor::new("stream", config);
    let scope = Scope::background();

    let value = executor
        .execute(&scope, "stream:1", failing_primary)
        .await
        .unwrap();
    assert_eq!(value["quality"], "low");
}

#[tokio::test]
async fn feature_kind_returns_degraded_marker() {
    let config = FallbackConfig {
        kind: FallbackKind::Feature,
        ..FallbackConfig::default()
    };
    let executor = FallbackExecutor::new("search", config);
    let scope = Scope::background();

    let value = executor
        .execute(&scope, "search:q", failing_primary)
        .await
        .unwrap();
    assert_eq!(value["status"], "degraded");
    assert_eq!(value["key"], "search:q");
}

#[tokio::test]
async fn custom_kind_invokes_registered_function() {
    let config = FallbackConfig {
        kind: FallbackKind::Custom,
        ..FallbackConfig::default()
    };
    let executor = FallbackExecutor::new("lyrics", config)
        .with_custom(|key, err| Ok(json!({"key": key, "cause": err.code().to_string()})));
    let scope = Scope::background();

    let value = executor
        .execute(&scope, "lyrics:1", failing_primary)
        .await
        .unwrap();
    assert_eq!(value["key"], "lyrics:1");
    assert_eq!(value["cause"], "MUSIC_SOURCE_UNAVAILABLE");
}

#[tokio::test]
async fn slow_primary_is_bounded_by_fallback_timeout() {
    let config = FallbackConfig {
        kind: FallbackKind::Default,
        timeout: Duration::from_millis(30),
        default_value: Some(json!("fallback")),
        ..FallbackConfig::default()
    };
    let executor = FallbackExecutor::new("slow", config);
    let scope = Scope::background();

    let value = executor
        .execute(&scope, "k", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("never"))
        })
        .await
        .unwrap();
    assert_eq!(value, json!("fallback"));
}

#[tokio::test]
async fn periodic_sweep_removes_expired_entries() {
    let config = FallbackConfig {
        kind: FallbackKind::Cache,
        cache_expiry: Duration::from_millis(20),
        cleanup_interval: Duration::from_millis(30),
        ..FallbackConfig::default()
    };
    let executor = Arc::new(FallbackExecutor::new("sweep", config));

    executor.store("a", json!(1));
    executor.store("b", json!(2));
    assert_eq!(executor.stats().cache_size, 2);

    executor.start_cache_sweep();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(executor.stats().cache_size, 0);

    executor.stop_cache_sweep().await;
}
