//! ReadyQueue port - 実行可能タスクの配送キュー
//!
//! task_id のみを流します（状態・payload は TaskStore が正本）。
//! 同じ task_id が重複して流れても、Dispatcher 側で 1 回分しか実行されません。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{EngineError, TaskId};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        EngineError::Queue(err.to_string())
    }
}

#[async_trait]
pub trait ReadyQueue: Send + Sync {
    async fn push(&self, task_id: TaskId) -> Result<(), QueueError>;

    /// Offer `task_id` again once `delay` has passed (busy resource lock).
    async fn push_after(&self, task_id: TaskId, delay: Duration) -> Result<(), QueueError>;

    /// Blocking pop with timeout; `None` when nothing became ready in time.
    async fn pop(&self, timeout: Duration) -> Result<Option<TaskId>, QueueError>;

    /// Ready + delayed entries.
    async fn len(&self) -> usize;
}
