//! ResourceLock port - target_ref 単位の advisory lock
//!
//! 単一プロセスならインメモリの表、複数インスタンスなら分散 lease に
//! 差し替えられるよう trait にしています。

use async_trait::async_trait;

use crate::domain::{EngineError, TargetRef, TaskId};

#[async_trait]
pub trait ResourceLock: Send + Sync {
    /// Non-blocking. Re-entrant for the same `owner`.
    async fn try_acquire(&self, target: &TargetRef, owner: TaskId) -> Result<bool, EngineError>;

    /// Releasing a lock held by someone else is a no-op.
    async fn release(&self, target: &TargetRef, owner: TaskId) -> Result<(), EngineError>;

    async fn holder(&self, target: &TargetRef) -> Option<TaskId>;
}
