//! Retry executor integration tests.

use plugin_resilience::errors::{ErrorCode, PluginError};
use plugin_resilience::retry::{BackoffType, RetryConfig, RetryExecutor};
use plugin_resilience::scope::{CancellationToken, Scope};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn quick_config(max_attempts: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(1))
        .jitter(false)
        .build()
        .unwrap()
}

#[tokio::test]
async fn retryable_failure_invokes_operation_exactly_max_attempts_times() {
    let executor = RetryExecutor::new(quick_config(4));
    let calls = Arc::new(AtomicU32::new(0));
    let scope = Scope::background();

    let calls_in = calls.clone();
    let result: Result<u32, _> = executor
        .execute(&scope, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PluginError::new(ErrorCode::PluginTimeout, "still slow"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let err = result.unwrap_err();
    assert!(err.message().contains("after 4 attempts"));
    assert_eq!(err.code(), ErrorCode::PluginTimeout);
}

#[tokio::test]
async fn non_retryable_failure_invokes_operation_once() {
    let executor = RetryExecutor::new(quick_config(5));
    let calls = Arc::new(AtomicU32::new(0));
    let scope = Scope::background();

    let calls_in = calls.clone();
    let result: Result<u32, _> = executor
        .execute(&scope, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PluginError::new(ErrorCode::InvalidArgument, "bad request"))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn success_after_transient_failures() {
    let executor = RetryExecutor::new(quick_config(5));
    let calls = Arc::new(AtomicU32::new(0));
    let scope = Scope::background();

    let calls_in = calls.clone();
    let result = executor
        .execute(&scope, move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PluginError::new(ErrorCode::PluginNetworkError, "flaky"))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancellation_interrupts_inter_attempt_wait() {
    let config = RetryConfig::builder()
        .max_attempts(10)
        .base_delay(Duration::from_secs(30))
        .jitter(false)
        .build()
        .unwrap();
    let executor = RetryExecutor::new(config);

    let token = CancellationToken::new();
    let scope = Scope::with_token(token.clone());

    let handle = tokio::spawn(async move {
        executor
            .execute(&scope, || async {
                Err::<u32, _>(PluginError::new(ErrorCode::PluginTimeout, "slow"))
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("retry did not observe cancellation")
        .unwrap();
    assert_eq!(result.unwrap_err().code(), ErrorCode::Cancelled);
}

#[test]
fn exponential_backoff_without_jitter_is_capped_and_monotone() {
    let config = RetryConfig::builder()
        .max_attempts(10)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(2))
        .backoff(BackoffType::Exponential)
        .backoff_factor(2.0)
        .jitter(false)
        .build()
        .unwrap();

    let mut previous = Duration::ZERO;
    for attempt in 0..8 {
        let delay = config.delay_for(attempt);
        let expected =
            Duration::from_millis(100 * 2u64.pow(attempt)).min(Duration::from_secs(2));
        assert_eq!(delay, expected, "attempt {}", attempt);
        assert!(delay >= previous);
        previous = delay;
    }
    assert_eq!(config.delay_for(9), Duration::from_secs(2));
}

#[test]
fn fixed_and_linear_backoff() {
    let fixed = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(50))
        .backoff(BackoffType::Fixed)
        .jitter(false)
        .build()
        .unwrap();
    assert_eq!(fixed.delay_for(0), Duration::from_millis(50));
    assert_eq!(fixed.delay_for(5), Duration::from_millis(50));

    let linear = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(50))
        .backoff(BackoffType::Linear)
        .jitter(false)
        .build()
        .unwrap();
    assert_eq!(linear.delay_for(0), Duration::from_millis(50));
    assert_eq!(linear.delay_for(2), Duration::from_millis(150));
}

#[test]
fn jittered_delay_stays_in_range() {
    let config = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .backoff(BackoffType::Fixed)
        .jitter(true)
        .jitter_factor(0.5)
        .build()
        .unwrap();

    for _ in 0..200 {
        let delay = config.delay_for(0);
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }
}

#[test]
fn explicit_code_lists_override_error_flag() {
    let config = RetryConfig::builder()
        .max_attempts(5)
        .base_delay(Duration::from_millis(1))
        .retryable_codes(vec![ErrorCode::PluginIoError])
        .non_retryable_codes(vec![ErrorCode::PluginTimeout])
        .build()
        .unwrap();

    // Deny list wins even though the error is marked retryable
    let timeout = PluginError::new(ErrorCode::PluginTimeout, "slow");
    assert!(timeout.retryable());
    assert!(!config.should_retry(0, &timeout));

    // Allow list wins even though the error is not marked retryable
    let io = PluginError::new(ErrorCode::PluginIoError, "disk").with_retryable(false);
    assert!(config.should_retry(0, &io));
}
