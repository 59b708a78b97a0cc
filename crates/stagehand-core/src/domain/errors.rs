//! Errors - エラー型と分類
//!
//! - `ErrorKind`: 外部呼び出し失敗の運用分類（Transient / Permanent）
//! - `EngineError`: エンジン全体のエラー taxonomy

use thiserror::Error;

use super::ids::TaskId;
use super::remote::RemoteError;
use super::target::TargetRef;

/// ErrorKind は外部呼び出しエラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("resource not found: {0}")]
    ResourceNotFound(TargetRef),

    #[error("conflict: {task_id} changed since version {expected}")]
    Conflict { task_id: TaskId, expected: u64 },

    #[error("invalid transition for {type_name}: {reason}")]
    InvalidTransition { type_name: String, reason: String },

    #[error("unknown task type '{0}'")]
    UnknownTaskType(String),

    #[error("target {0} no longer exists")]
    TargetGone(TargetRef),

    #[error("transient remote failure after {attempts} attempt(s): {source}")]
    TransientRemoteFailure { attempts: u32, source: RemoteError },

    #[error("permanent remote failure: {0}")]
    PermanentRemoteFailure(RemoteError),

    #[error("handler fault: {0}")]
    HandlerFault(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("payload error: {0}")]
    Payload(String),
}

impl EngineError {
    pub fn invalid_transition(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidTransition {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    /// Benign optimistic-concurrency race; the caller reloads and retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// Infrastructure hiccups that a later dispatch of the same task may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(_) | EngineError::Queue(_) | EngineError::Conflict { .. }
        )
    }
}

/// A raw remote error that escaped without going through the retry helper
/// counts as a single attempt.
impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        match err.class() {
            ErrorKind::Transient => EngineError::TransientRemoteFailure {
                attempts: 1,
                source: err,
            },
            ErrorKind::Permanent => EngineError::PermanentRemoteFailure(err),
        }
    }
}
