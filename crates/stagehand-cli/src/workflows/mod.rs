//! Example workflows built on the engine.

pub mod secgroup;
pub mod snapshot_policy;
pub mod sync_status;
pub mod sync_tags;

use std::sync::Arc;

use stagehand_core::typed::RegistryError;
use stagehand_core::{EngineBuilder, Workflow};

use crate::remote::{SnapshotPolicyApi, StatusApi, TagApi};

pub use secgroup::SyncSecurityGroupCache;
pub use snapshot_policy::ApplySnapshotPolicy;
pub use sync_status::SyncStatus;
pub use sync_tags::SyncTags;

/// Every task type this crate registers, for `EngineBuilder::expect_tasks`.
pub const TASK_TYPES: &[&str] = &[
    SyncTags::TYPE,
    SyncSecurityGroupCache::TYPE,
    SyncStatus::TYPE,
    ApplySnapshotPolicy::TYPE,
];

/// Register all example workflows against one cloud backend.
pub fn register_all<C>(builder: EngineBuilder, cloud: Arc<C>) -> Result<EngineBuilder, RegistryError>
where
    C: TagApi + StatusApi + SnapshotPolicyApi + 'static,
{
    let builder = builder
        .register(SyncTags::new(cloud.clone()))?
        .register(SyncSecurityGroupCache)?
        .register(SyncStatus::new(cloud.clone()))?
        .register(ApplySnapshotPolicy::new(cloud))?;
    Ok(builder.expect_tasks(TASK_TYPES))
}
