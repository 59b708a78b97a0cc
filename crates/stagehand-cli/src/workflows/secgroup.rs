//! Security group cache sync.
//!
//! `SyncSecurityGroupCache` は子タスク `SyncStatus` を起動し、その結果で
//! `OnSyncStatusComplete` / `OnSyncStatusCompleteFailed` に進みます。
//! どちらのタスクも失敗時はキャッシュのステータスを `unknown` にします。
//! 親子で同じステータスを書くので、反映は 1 回だけになります。

use futures::FutureExt;
use stagehand_core::{EngineError, Payload, StageContext, StageTable, Workflow};
use tracing::info;

use super::sync_status::{self, STATUS_UNKNOWN, SyncStatus};

pub struct SyncSecurityGroupCache;

impl SyncSecurityGroupCache {
    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let target = ctx.target().clone();
        let child = ctx
            .start_subtask(SyncStatus::TYPE, target, sync_status::PURPOSE, Payload::new())
            .await?;
        info!(task_id = %ctx.task_id(), child_id = %child, "started status sync");
        Ok(())
    }

    async fn on_sync_status_complete(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        ctx.set_stage_complete(None)
    }

    async fn on_sync_status_failed(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let reason = sync_status::child_failure_reason(ctx);
        ctx.fail(reason)
    }
}

impl Workflow for SyncSecurityGroupCache {
    const TYPE: &'static str = "SyncSecurityGroupCache";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .stage("OnSyncStatusComplete", |w, ctx| w.on_sync_status_complete(ctx).boxed())
            .stage("OnSyncStatusCompleteFailed", |w, ctx| w.on_sync_status_failed(ctx).boxed())
            .failed_status(STATUS_UNKNOWN);
    }
}
