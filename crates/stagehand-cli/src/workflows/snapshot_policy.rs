//! ApplySnapshotPolicy: OnInit -> Applying -> complete.
//!
//! OnInit はパラメータを検証してリソースを `applying` にするだけです。
//! クラウド呼び出しは Applying で行うので、再起動後は Applying から再開します。

use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use stagehand_core::{EngineError, Payload, StageContext, StageTable, Workflow};

use crate::remote::SnapshotPolicyApi;

pub const STATUS_APPLYING: &str = "applying";

#[derive(Debug, Deserialize)]
struct ApplyParams {
    policy_id: String,
}

pub struct ApplySnapshotPolicy {
    cloud: Arc<dyn SnapshotPolicyApi>,
}

impl ApplySnapshotPolicy {
    pub fn new(cloud: Arc<dyn SnapshotPolicyApi>) -> Self {
        Self { cloud }
    }

    async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let params: ApplyParams = match ctx.payload().decode() {
            Ok(params) => params,
            Err(e) => return ctx.fail(format!("invalid params: {e}")),
        };
        if params.policy_id.is_empty() {
            return ctx.fail("policy_id is empty");
        }
        ctx.set_resource_status(STATUS_APPLYING, &format!("apply snapshot policy {}", params.policy_id))
            .await?;
        ctx.set_stage("Applying", None)
    }

    async fn applying(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
        let params: ApplyParams = ctx.payload().decode()?;
        let target = ctx.target().clone();
        let cloud = self.cloud.clone();
        ctx.retry("apply_snapshot_policy", || {
            let cloud = cloud.clone();
            let target = target.clone();
            let policy_id = params.policy_id.clone();
            async move { cloud.apply_snapshot_policy(&target, &policy_id).await }
        })
        .await?;
        ctx.set_stage_complete(Some(Payload::new().with("applied_policy", params.policy_id)))
    }
}

impl Workflow for ApplySnapshotPolicy {
    const TYPE: &'static str = "ApplySnapshotPolicy";

    fn stages(table: &mut StageTable<Self>) {
        table
            .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
            .stage("Applying", |w, ctx| w.applying(ctx).boxed())
            .complete_status("ready")
            .failed_status("apply_failed");
    }
}
