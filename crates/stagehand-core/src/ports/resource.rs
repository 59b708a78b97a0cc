//! ResourceProvider port - 管理対象リソースへの窓口
//!
//! リソースのスキーマはエンジンの外にあります。エンジンが触るのは
//! 解決（Resolve）とステータス欄（SetStatus）だけです。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Actor, EngineError, Payload, TargetRef};

/// Snapshot of a resource handed to stage handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub target: TargetRef,
    pub status: String,

    /// Owner-defined metadata (tags, names, backend ids...).
    #[serde(default)]
    pub metadata: Payload,
}

impl Resource {
    pub fn new(target: TargetRef, status: impl Into<String>) -> Self {
        Self {
            target,
            status: status.into(),
            metadata: Payload::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// `Ok(None)` when the resource does not exist (any more).
    async fn resolve(&self, target: &TargetRef) -> Result<Option<Resource>, EngineError>;

    async fn set_status(
        &self,
        target: &TargetRef,
        actor: &Actor,
        status: &str,
        reason: &str,
    ) -> Result<(), EngineError>;
}
