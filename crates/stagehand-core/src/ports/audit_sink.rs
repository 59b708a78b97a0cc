//! AuditSink port - 監査ログ・通知の送信先
//!
//! エンジンは結果を待たずにログだけ残します。ここでの失敗がタスクを
//! 失敗させることはありません。

use async_trait::async_trait;

use crate::domain::{AuditEntry, EngineError};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), EngineError>;
}
