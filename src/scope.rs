//! Cancellation-aware execution scope.
//!
//! A [`Scope`] carries an optional deadline and a cooperative cancellation
//! signal. Every blocking operation in the pipeline (retry waits, recovery
//! permit acquisition, fallback timeouts, health checks) observes the scope
//! at its suspension points; the innermost expiry wins.

use crate::error::ResilienceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Cooperative cancellation signal shared between a scope and its owner
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every scope holding this token
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is signalled
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

/// Deadline- and cancellation-bearing execution scope
#[derive(Clone, Debug)]
pub struct Scope {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Scope {
    /// Scope with no deadline and no external cancellation
    pub fn background() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    /// Scope that expires after the given duration
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// Scope driven by an external cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            deadline: None,
            token,
        }
    }

    /// Child scope sharing this scope's cancellation with a tighter deadline
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            deadline,
            token: self.token.clone(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Error describing why the scope is no longer live, if it isn't
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.token.is_cancelled() {
            return Err(ResilienceError::Cancelled("scope cancelled".into()));
        }
        if self.is_past_deadline() {
            return Err(ResilienceError::Timeout("scope deadline exceeded".into()));
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early with an error if the scope is
    /// cancelled or its deadline passes first
    pub async fn sleep(&self, duration: Duration) -> Result<(), ResilienceError> {
        self.check()?;
        let wake = Instant::now() + duration;
        let bound = match self.deadline {
            Some(deadline) if deadline < wake => deadline,
            _ => wake,
        };
        tokio::select! {
            _ = tokio::time::sleep_until(bound) => {
                if bound < wake {
                    Err(ResilienceError::Timeout("scope deadline exceeded".into()))
                } else {
                    Ok(())
                }
            }
            _ = self.token.cancelled() => {
                Err(ResilienceError::Cancelled("scope cancelled".into()))
            }
        }
    }

    /// Run a future bounded by this scope's deadline and cancellation
    pub async fn bound<F, T>(&self, fut: F) -> Result<T, ResilienceError>
    where
        F: std::future::Future<Output = T>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    out = tokio::time::timeout_at(deadline, fut) => {
                        out.map_err(|_| ResilienceError::Timeout("scope deadline exceeded".into()))
                    }
                    _ = self.token.cancelled() => {
                        Err(ResilienceError::Cancelled("scope cancelled".into()))
                    }
                }
            }
            None => {
                tokio::select! {
                    out = fut => Ok(out),
                    _ = self.token.cancelled() => {
                        Err(ResilienceError::Cancelled("scope cancelled".into()))
                    }
                }
            }
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::background()
    }
}
