//! SyncTags - リソースのタグをクラウド側へ反映する
//!
//! OnInit でタグを更新し、続けて子タスク `SyncStatus` で状態を取り直します。
//! - バックエンドがタグを扱えない（not supported / not implemented）場合は更新を飛ばす
//! - タグを読めなかったときだけリソースを `update_tags_failed` にする
//! - 更新の成否は `update_tags` として監査に残す（旧タグと新タグ付き）

use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use stagehand_core::domain::AuditOutcome;
use stagehand_core::{EngineError, Payload, StageContext, StageTable, Workflow};
use tracing::{debug, info};

use super::sync_status::{self, SyncStatus};
use crate::remote::{TagApi, Tags};

pub const STATUS_UPDATE_TAGS_FAILED: &str = "update_tags_failed";

/// Audit action for a tag update attempt.
pub const ACTION_UPDATE_TAGS: &str = "update_tags";

/// Desired tags live in the resource metadata.
#[derive(Debug, Default, Deserialize)]
struct ResourceTags {
    #[serde(default)]
    tags: Tags,
}

pub struct SyncTags {
    cloud: Arc<dyn TagApi>,
}

impl SyncTags {
    pub fn new(cloud: Arc<dyn TagApi>) -> Self {
        Self { cloud }
    }

    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let replace = ctx.payload().get_bool("replace_tags", false);
        let target = ctx.target().clone();

        let cloud = self.cloud.clone();
        let fetched = ctx
            .retry("get_tags", || {
                let cloud = cloud.clone();
                let target = target.clone();
                async move { cloud.get_tags(&target).await }
            })
            .await;
        let old_tags = match fetched {
            Ok(tags) => tags,
            Err(e) if e.is_not_supported() => {
                debug!(target = %target, error = %e, "backend has no tags, skipping");
                return self.skip(ctx).await;
            }
            Err(e) => return self.tags_unavailable(ctx, format!("get tags: {e}")).await,
        };
        let desired = match ctx.resource().metadata.decode::<ResourceTags>() {
            Ok(resource) => resource.tags,
            Err(e) => return self.tags_unavailable(ctx, format!("resource tags: {e}")).await,
        };

        let updated = ctx
            .retry("set_tags", || {
                let cloud = cloud.clone();
                let target = target.clone();
                let desired = desired.clone();
                async move { cloud.set_tags(&target, &desired, replace).await }
            })
            .await;
        match updated {
            Ok(()) => {}
            Err(e) if e.is_not_supported() => {
                debug!(target = %target, error = %e, "backend cannot set tags, skipping");
                return self.skip(ctx).await;
            }
            Err(e) => {
                let reason = format!("set tags: {e}");
                ctx.audit(ACTION_UPDATE_TAGS, AuditOutcome::Failure, reason.clone())
                    .await;
                return ctx.fail(reason);
            }
        }

        info!(target = %target, old = old_tags.len(), new = desired.len(), replace, "tags synced");
        let mut change = Payload::new();
        change.insert_serialized("old_tags", &old_tags)?;
        change.insert_serialized("new_tags", &desired)?;
        ctx.audit(ACTION_UPDATE_TAGS, AuditOutcome::Success, change.to_value().to_string())
            .await;
        ctx.payload_mut().merge(change);
        self.sync_status(ctx).await
    }

    async fn on_sync_status_complete(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        ctx.set_stage_complete(None)
    }

    async fn on_sync_status_failed(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let reason = sync_status::child_failure_reason(ctx);
        ctx.fail(reason)
    }

    async fn skip(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        ctx.payload_mut().set("skipped", true);
        self.sync_status(ctx).await
    }

    /// Tags were touched or not, the status is refreshed either way.
    async fn sync_status(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let target = ctx.target().clone();
        let child = ctx
            .start_subtask(SyncStatus::TYPE, target, sync_status::PURPOSE, Payload::new())
            .await?;
        debug!(task_id = %ctx.task_id(), child_id = %child, "started status sync");
        Ok(())
    }

    async fn tags_unavailable(&self, ctx: &mut StageContext, reason: String) -> Result<(), EngineError> {
        ctx.set_resource_status(STATUS_UPDATE_TAGS_FAILED, &reason).await?;
        ctx.fail(reason)
    }
}

impl Workflow for SyncTags {
    const TYPE: &'static str = "SyncTags";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .stage("OnSyncStatusComplete", |w, ctx| w.on_sync_status_complete(ctx).boxed())
            .stage("OnSyncStatusCompleteFailed", |w, ctx| w.on_sync_status_failed(ctx).boxed())
            .keep_status_on_failure();
    }
}
