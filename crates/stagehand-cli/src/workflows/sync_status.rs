//! SyncStatus - クラウド側の状態をリソースに取り込む子タスク
//!
//! `SyncTags` と `SyncSecurityGroupCache` の両方から `"SyncStatus"` として起動されます。
//! ステータスは変化があるときだけ書き、失敗時は `unknown` にします。

use std::sync::Arc;

use futures::FutureExt;
use stagehand_core::domain::payload::CHILD_RESULT_KEY;
use stagehand_core::{EngineError, Payload, StageContext, StageTable, Workflow};

use crate::remote::StatusApi;

pub const STATUS_UNKNOWN: &str = "unknown";

/// Purpose passed to `start_subtask`; continuations are `OnSyncStatusComplete[Failed]`.
pub const PURPOSE: &str = "SyncStatus";

pub struct SyncStatus {
    cloud: Arc<dyn StatusApi>,
}

impl SyncStatus {
    pub fn new(cloud: Arc<dyn StatusApi>) -> Self {
        Self { cloud }
    }

    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let target = ctx.target().clone();
        let cloud = self.cloud.clone();
        let fetched = ctx
            .retry("get_status", || {
                let cloud = cloud.clone();
                let target = target.clone();
                async move { cloud.get_status(&target).await }
            })
            .await;
        let remote = match fetched {
            Ok(remote) => remote,
            Err(e) => return ctx.fail(format!("get status: {e}")),
        };

        if ctx.resource().status != remote.status {
            ctx.set_resource_status(&remote.status, "synced from cloud").await?;
        }
        let mut data = Payload::new();
        data.insert_serialized("remote", &remote)?;
        ctx.set_stage_complete(Some(data))
    }
}

impl Workflow for SyncStatus {
    const TYPE: &'static str = "SyncStatus";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .failed_status(STATUS_UNKNOWN);
    }
}

/// Reason a failed `SyncStatus` child reported, for the parent's failure stage.
pub fn child_failure_reason(ctx: &StageContext) -> String {
    ctx.payload()
        .get(CHILD_RESULT_KEY)
        .and_then(|child| child.get("reason"))
        .and_then(|reason| reason.as_str())
        .unwrap_or("status sync failed")
        .to_string()
}
