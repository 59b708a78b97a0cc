//! AuditSink の実装
//!
//! - TracingAuditSink: `stagehand::audit` ターゲットの tracing イベントとして出力（既定）
//! - MemoryAuditSink: テスト用に全件保持

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{AuditEntry, AuditOutcome, EngineError};
use crate::ports::AuditSink;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), EngineError> {
        let task_id = entry.task_id.map(|id| id.to_string()).unwrap_or_default();
        match entry.outcome {
            AuditOutcome::Success => info!(
                target: "stagehand::audit",
                actor = %entry.actor,
                target_ref = %entry.target,
                task_id = %task_id,
                action = %entry.action,
                detail = %entry.detail,
                "audit"
            ),
            AuditOutcome::Failure | AuditOutcome::Warning => warn!(
                target: "stagehand::audit",
                actor = %entry.actor,
                target_ref = %entry.target,
                task_id = %task_id,
                action = %entry.action,
                outcome = ?entry.outcome,
                detail = %entry.detail,
                "audit"
            ),
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn with_action(&self, action: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), EngineError> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}
