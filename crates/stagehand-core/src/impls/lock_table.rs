//! InMemoryLockTable - 単一プロセス用の target_ref ロック表

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{EngineError, TargetRef, TaskId};
use crate::ports::ResourceLock;

#[derive(Default)]
pub struct InMemoryLockTable {
    holders: Mutex<HashMap<TargetRef, TaskId>>,
}

impl InMemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceLock for InMemoryLockTable {
    async fn try_acquire(&self, target: &TargetRef, owner: TaskId) -> Result<bool, EngineError> {
        let mut holders = self.holders.lock().await;
        match holders.get(target) {
            Some(holder) => Ok(*holder == owner),
            None => {
                holders.insert(target.clone(), owner);
                Ok(true)
            }
        }
    }

    async fn release(&self, target: &TargetRef, owner: TaskId) -> Result<(), EngineError> {
        let mut holders = self.holders.lock().await;
        if holders.get(target) == Some(&owner) {
            holders.remove(target);
        }
        Ok(())
    }

    async fn holder(&self, target: &TargetRef) -> Option<TaskId> {
        self.holders.lock().await.get(target).copied()
    }
}
