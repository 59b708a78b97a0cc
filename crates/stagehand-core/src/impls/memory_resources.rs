//! InMemoryResources - テスト・デモ用の ResourceProvider
//!
//! ステータス更新の履歴を保持するので、「失敗がちょうど 1 回反映された」
//! といった性質をテストで確認できます。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Actor, EngineError, Payload, TargetRef};
use crate::ports::{Resource, ResourceProvider};

/// One `set_status` call as observed by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub target: TargetRef,
    pub status: String,
    pub reason: String,
    pub actor_id: String,
}

#[derive(Default)]
struct ResourceState {
    resources: HashMap<TargetRef, Resource>,
    changes: Vec<StatusChange>,
}

#[derive(Default)]
pub struct InMemoryResources {
    state: Mutex<ResourceState>,
}

impl InMemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, resource: Resource) {
        let mut state = self.state.lock().await;
        state.resources.insert(resource.target.clone(), resource);
    }

    /// Shorthand for a resource with empty metadata.
    pub async fn add(&self, target: TargetRef, status: &str) {
        self.insert(Resource::new(target, status)).await;
    }

    pub async fn remove(&self, target: &TargetRef) -> Option<Resource> {
        self.state.lock().await.resources.remove(target)
    }

    pub async fn get(&self, target: &TargetRef) -> Option<Resource> {
        self.state.lock().await.resources.get(target).cloned()
    }

    pub async fn update_metadata(&self, target: &TargetRef, metadata: Payload) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let resource = state
            .resources
            .get_mut(target)
            .ok_or_else(|| EngineError::ResourceNotFound(target.clone()))?;
        resource.metadata.merge(metadata);
        Ok(())
    }

    pub async fn status_changes(&self, target: &TargetRef) -> Vec<StatusChange> {
        let state = self.state.lock().await;
        state
            .changes
            .iter()
            .filter(|c| &c.target == target)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResourceProvider for InMemoryResources {
    async fn resolve(&self, target: &TargetRef) -> Result<Option<Resource>, EngineError> {
        Ok(self.get(target).await)
    }

    async fn set_status(
        &self,
        target: &TargetRef,
        actor: &Actor,
        status: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let resource = state
            .resources
            .get_mut(target)
            .ok_or_else(|| EngineError::ResourceNotFound(target.clone()))?;
        resource.status = status.to_string();
        state.changes.push(StatusChange {
            target: target.clone(),
            status: status.to_string(),
            reason: reason.to_string(),
            actor_id: actor.user_id.clone(),
        });
        Ok(())
    }
}
