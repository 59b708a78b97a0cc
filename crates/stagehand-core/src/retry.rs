//! Retry & failure classification for external calls.
//!
//! - transient な失敗だけを再試行する（上限 `max_attempts`、指数バックオフ）
//! - permanent な失敗は 1 回目で即座に返す
//! - 結果は `RetryError` で返し、`?` で `EngineError` に変換できる

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::domain::{EngineError, RemoteError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the `attempts`-th failure (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay_ms`.
    ///
    /// base=500ms, multiplier=2.0 の場合:
    /// - attempt 1: 500ms
    /// - attempt 2: 1s
    /// - attempt 3: 2s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis((delay_ms as u64).min(self.max_delay_ms))
    }

    /// Sum of the backoff delays a call that fails on every attempt sleeps through.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|n| self.next_delay(n)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    #[error("{operation} failed permanently on attempt {attempts}: {source}")]
    Permanent {
        operation: String,
        attempts: u32,
        source: RemoteError,
    },

    #[error("{operation} still failing after {attempts} attempt(s): {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        source: RemoteError,
    },
}

impl RetryError {
    pub fn remote(&self) -> &RemoteError {
        match self {
            RetryError::Permanent { source, .. } | RetryError::Exhausted { source, .. } => source,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// "Nothing to do" on this backend; the calling workflow decides whether to skip.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, RetryError::Permanent { source, .. } if source.is_not_supported())
    }
}

impl From<RetryError> for EngineError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Permanent { source, .. } => EngineError::PermanentRemoteFailure(source),
            RetryError::Exhausted {
                attempts, source, ..
            } => EngineError::TransientRemoteFailure { attempts, source },
        }
    }
}

/// One finished attempt, reported to the observer of `with_retry_observed`.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub attempt: u32,
    pub max_attempts: u32,
    /// `None` on success.
    pub error: Option<RemoteError>,
    /// Backoff slept after this attempt, if another one follows.
    pub delay: Option<Duration>,
}

pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    f: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    with_retry_observed(policy, operation, |_| {}, f).await
}

pub async fn with_retry_observed<F, Fut, T, O>(
    policy: &RetryPolicy,
    operation: &str,
    mut observer: O,
    mut f: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
    O: FnMut(AttemptReport),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match f().await {
            Ok(value) => {
                observer(AttemptReport {
                    attempt,
                    max_attempts,
                    error: None,
                    delay: None,
                });
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_transient() {
            observer(AttemptReport {
                attempt,
                max_attempts,
                error: Some(err.clone()),
                delay: None,
            });
            return Err(RetryError::Permanent {
                operation: operation.to_string(),
                attempts: attempt,
                source: err,
            });
        }

        if attempt >= max_attempts {
            observer(AttemptReport {
                attempt,
                max_attempts,
                error: Some(err.clone()),
                delay: None,
            });
            return Err(RetryError::Exhausted {
                operation: operation.to_string(),
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.next_delay(attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient failure"
        );
        observer(AttemptReport {
            attempt,
            max_attempts,
            error: Some(err),
            delay: Some(delay),
        });
        sleep(delay).await;
    }
}
